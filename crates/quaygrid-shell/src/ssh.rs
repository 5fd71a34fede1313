//! Direct SSH transport.
//!
//! One-shot commands run over a blocking ssh2 session on the blocking
//! thread pool. Interactive shells additionally bridge the session to an
//! async byte stream (the hijacked HTTP connection) through a pair of
//! channels: one blocking thread owns the ssh2 session and pumps both
//! directions in a poll loop, since an ssh2 session must stay on a single
//! thread.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;

use ssh2::{PtyModeOpcode, PtyModes, Session};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ShellError, ShellResult};

/// Where and how to dial a container's shell.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// PEM private key; the only auth method offered.
    pub private_key: String,
}

/// Captured output of a one-shot command.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Run `cmd args...` in the container and capture its output.
pub async fn exec(target: SshTarget, cmd: String, args: Vec<String>) -> ShellResult<ExecOutput> {
    tokio::task::spawn_blocking(move || exec_blocking(&target, &cmd, &args))
        .await
        .map_err(|e| ShellError::Task(e.to_string()))?
}

fn connect(target: &SshTarget) -> ShellResult<Session> {
    let tcp = TcpStream::connect((target.host.as_str(), target.port))?;
    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.handshake()?;
    session.userauth_pubkey_memory(&target.user, None, &target.private_key, None)?;
    Ok(session)
}

fn exec_blocking(target: &SshTarget, cmd: &str, args: &[String]) -> ShellResult<ExecOutput> {
    let session = connect(target)?;
    let mut channel = session.channel_session()?;

    let mut full = cmd.to_string();
    for arg in args {
        full.push(' ');
        full.push_str(arg);
    }
    debug!(host = %target.host, port = target.port, command = %full, "running ssh command");
    channel.exec(&full)?;

    let mut output = ExecOutput::default();
    channel.read_to_end(&mut output.stdout)?;
    channel.stderr().read_to_end(&mut output.stderr)?;
    channel.wait_close()?;
    output.exit_code = channel.exit_status()?;
    Ok(output)
}

/// Terminal modes for interactive sessions: control characters are not
/// echoed, and the line speed is pinned at 14400 baud both ways.
fn pty_modes() -> PtyModes {
    let mut modes = PtyModes::new();
    modes.set_boolean(PtyModeOpcode::ECHOCTL, false);
    modes.set_u32(PtyModeOpcode::TTY_OP_ISPEED, 14400);
    modes.set_u32(PtyModeOpcode::TTY_OP_OSPEED, 14400);
    modes
}

/// Open an interactive shell in the container and bridge it to `stream`
/// until either side closes.
pub async fn shell<S>(target: SshTarget, stream: S) -> ShellResult<()>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut stream_read, mut stream_write) = tokio::io::split(stream);

    // Client → session.
    let (stdin_tx, stdin_rx) = std_mpsc::channel::<Vec<u8>>();
    // Session → client.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            match stream_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdin_tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(chunk) = out_rx.recv().await {
            if stream_write.write_all(&chunk).await.is_err() {
                break;
            }
            let _ = stream_write.flush().await;
        }
    });

    let result = tokio::task::spawn_blocking(move || shell_blocking(&target, stdin_rx, out_tx))
        .await
        .map_err(|e| ShellError::Task(e.to_string()))?;

    reader.abort();
    let _ = writer.await;
    result
}

fn shell_blocking(
    target: &SshTarget,
    stdin_rx: std_mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
) -> ShellResult<()> {
    let session = connect(target)?;
    let mut channel = session.channel_session()?;
    channel.request_pty("xterm", Some(pty_modes()), Some((120, 80, 0, 0)))?;
    channel.shell()?;

    // The poll loop below multiplexes both directions on one thread.
    session.set_blocking(false);
    let mut pending_stdin: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];
    let mut client_closed = false;

    loop {
        let mut idle = true;

        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                idle = false;
                if out_tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }
        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                idle = false;
                if out_tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => return Err(e.into()),
        }

        if pending_stdin.is_empty() && !client_closed {
            match stdin_rx.try_recv() {
                Ok(data) => pending_stdin = data,
                Err(std_mpsc::TryRecvError::Empty) => {}
                Err(std_mpsc::TryRecvError::Disconnected) => {
                    client_closed = true;
                    let _ = channel.send_eof();
                }
            }
        }
        if !pending_stdin.is_empty() {
            match channel.write(&pending_stdin) {
                Ok(n) => {
                    idle = false;
                    pending_stdin.drain(..n);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }

        if channel.eof() {
            break;
        }
        if idle {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    session.set_blocking(true);
    let _ = channel.wait_close();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pty_modes_build() {
        // Mode construction must not panic; the encoded blob is opaque.
        let _ = pty_modes();
    }

    #[test]
    fn exec_output_defaults() {
        let output = ExecOutput::default();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.is_empty());
    }
}
