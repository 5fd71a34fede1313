//! Legacy per-host shell agent client.
//!
//! Older container records carry no key material; for those, commands go
//! through the HTTP agent that runs on every host. The agent is also poked
//! when a container is removed so it can drop its bookkeeping.

use futures_util::StreamExt;
use serde::Serialize;
use tracing::debug;

use quay_core::ProgressWriter;

use crate::error::ShellResult;

/// Lines containing this marker are noise from the container's resolver
/// setup and are dropped from command output.
const FILTERED_MARKER: &str = "unable to resolve host";

#[derive(Serialize)]
struct CmdInput<'a> {
    cmd: &'a str,
    args: &'a [String],
}

pub struct AgentClient {
    http: reqwest::Client,
    port: u16,
}

impl AgentClient {
    pub fn new(port: u16) -> Self {
        AgentClient {
            http: reqwest::Client::new(),
            port,
        }
    }

    /// Run a command in a container through the host agent, streaming
    /// filtered output lines into `sink`.
    pub async fn run_command(
        &self,
        host_addr: &str,
        container_ip: &str,
        cmd: &str,
        args: &[String],
        sink: &ProgressWriter,
    ) -> ShellResult<()> {
        let url = format!(
            "http://{}:{}/container/{}/cmd",
            host_addr, self.port, container_ip
        );
        debug!(%url, cmd, "running command via shell agent");
        let response = self
            .http
            .post(&url)
            .json(&CmdInput { cmd, args })
            .send()
            .await?;

        let mut stream = response.bytes_stream();
        let mut carry = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            carry.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = carry.find('\n') {
                let line: String = carry.drain(..=newline).collect();
                emit_filtered(sink, line.trim_end_matches('\n'));
            }
        }
        if !carry.is_empty() {
            emit_filtered(sink, &carry);
        }
        Ok(())
    }

    /// Tell the host agent a container is gone.
    pub async fn remove_container(&self, host_addr: &str, container_ip: &str) -> ShellResult<()> {
        let url = format!(
            "http://{}:{}/container/{}",
            host_addr, self.port, container_ip
        );
        self.http.delete(&url).send().await?;
        Ok(())
    }
}

fn emit_filtered(sink: &ProgressWriter, line: &str) {
    if !line.contains(FILTERED_MARKER) {
        sink.raw(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_drops_marked_lines() {
        let (sink, handle) = ProgressWriter::buffer();
        emit_filtered(&sink, "failed");
        emit_filtered(&sink, "unable to resolve host abcdef");
        emit_filtered(&sink, "done");

        assert_eq!(handle.lines(), vec!["failed", "done"]);
    }

    #[test]
    fn cmd_input_serializes() {
        let args = vec!["-a".to_string()];
        let input = CmdInput { cmd: "ls", args: &args };
        let json = serde_json::to_string(&input).unwrap();
        assert_eq!(json, r#"{"cmd":"ls","args":["-a"]}"#);
    }
}
