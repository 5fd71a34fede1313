//! Progress log streams.
//!
//! Long-running admin operations (deploys, moves, rebalance) report progress
//! as newline-delimited JSON records of the form `{"message": "..."}`. The
//! [`ProgressWriter`] is a cheap clonable handle; each emitted record is a
//! single write, so concurrent tasks sharing a writer never interleave
//! partial lines.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// One record of a progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressLog {
    pub message: String,
}

enum Sink {
    Null,
    Channel(mpsc::UnboundedSender<String>),
    Buffer(Arc<Mutex<Vec<String>>>),
}

/// Destination for progress output.
#[derive(Clone)]
pub struct ProgressWriter {
    sink: Arc<Sink>,
}

impl ProgressWriter {
    /// Discard everything.
    pub fn null() -> Self {
        ProgressWriter {
            sink: Arc::new(Sink::Null),
        }
    }

    /// Forward lines to a channel, e.g. for a streaming HTTP response.
    pub fn channel(tx: mpsc::UnboundedSender<String>) -> Self {
        ProgressWriter {
            sink: Arc::new(Sink::Channel(tx)),
        }
    }

    /// Collect lines in memory. Returns the writer and a handle for reading
    /// what was written (used by tests).
    pub fn buffer() -> (Self, BufferHandle) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let writer = ProgressWriter {
            sink: Arc::new(Sink::Buffer(lines.clone())),
        };
        (writer, BufferHandle { lines })
    }

    /// Emit one `{"message": ...}` record.
    pub fn message(&self, message: impl Into<String>) {
        let record = ProgressLog {
            message: message.into(),
        };
        // ProgressLog has no non-serializable fields.
        let line = serde_json::to_string(&record).unwrap_or_default();
        self.write_line(line);
    }

    /// Emit a raw line, e.g. build-container output relayed verbatim.
    pub fn raw(&self, line: impl Into<String>) {
        let mut line = line.into();
        while line.ends_with('\n') {
            line.pop();
        }
        self.write_line(line);
    }

    fn write_line(&self, mut line: String) {
        line.push('\n');
        match self.sink.as_ref() {
            Sink::Null => {}
            Sink::Channel(tx) => {
                // Receiver gone means the client hung up; nothing to do.
                let _ = tx.send(line);
            }
            Sink::Buffer(lines) => {
                lines.lock().expect("progress buffer poisoned").push(line);
            }
        }
    }
}

/// Read side of [`ProgressWriter::buffer`].
pub struct BufferHandle {
    lines: Arc<Mutex<Vec<String>>>,
}

impl BufferHandle {
    /// All emitted lines, trailing newlines stripped.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .expect("progress buffer poisoned")
            .iter()
            .map(|l| l.trim_end_matches('\n').to_string())
            .collect()
    }

    /// The `message` field of every JSON record, skipping raw lines.
    pub fn messages(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter_map(|l| serde_json::from_str::<ProgressLog>(&l).ok())
            .map(|r| r.message)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_is_json_record() {
        let (writer, handle) = ProgressWriter::buffer();
        writer.message("Containers moved successfully!");

        let lines = handle.lines();
        assert_eq!(lines.len(), 1);
        let record: ProgressLog = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(record.message, "Containers moved successfully!");
    }

    #[test]
    fn raw_lines_pass_through() {
        let (writer, handle) = ProgressWriter::buffer();
        writer.raw("---- Starting 2 new units ----\n");
        writer.raw("no newline");

        assert_eq!(
            handle.lines(),
            vec!["---- Starting 2 new units ----", "no newline"]
        );
        assert!(handle.messages().is_empty());
    }

    #[test]
    fn channel_writer_forwards_lines() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let writer = ProgressWriter::channel(tx);
        writer.message("one");
        writer.message("two");

        let first = rx.try_recv().unwrap();
        assert_eq!(first, "{\"message\":\"one\"}\n");
        let second = rx.try_recv().unwrap();
        assert!(second.contains("two"));
    }

    #[test]
    fn null_writer_discards() {
        let writer = ProgressWriter::null();
        writer.message("nobody listens");
    }

    #[test]
    fn clones_share_the_buffer() {
        let (writer, handle) = ProgressWriter::buffer();
        let clone = writer.clone();
        writer.message("a");
        clone.message("b");
        assert_eq!(handle.messages(), vec!["a", "b"]);
    }
}
