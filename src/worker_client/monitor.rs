//! Worker stderr monitor.
//!
//! Drains the worker's diagnostic stream for as long as it is open so the
//! pipe never fills up and blocks the worker. Each non-empty line is logged
//! at debug level and kept in a small ring buffer that startup failures can
//! quote.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

/// Log target for lines the worker writes to stderr.
pub const STDERR_TARGET: &str = "browser_bridge::worker_stderr";

/// Lines kept by default in a [`DiagnosticTail`].
const DEFAULT_TAIL_LINES: usize = 20;

/// Bounded buffer of the most recent stderr lines.
#[derive(Debug, Clone)]
pub struct DiagnosticTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for DiagnosticTail {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TAIL_LINES)
    }
}

impl DiagnosticTail {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, line: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// Recent lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.iter().cloned().collect()
    }

    /// Recent lines joined with `" | "`, or an empty string.
    pub fn summary(&self) -> String {
        self.snapshot().join(" | ")
    }
}

/// Start draining `stderr` on a background task.
///
/// The task ends when the stream closes. Read errors are logged and end the
/// task; they are never reported to callers.
pub fn spawn_monitor<R>(worker: &str, stderr: R, tail: DiagnosticTail) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let worker = worker.to_string();
    tokio::spawn(async move { drain(worker, stderr, tail).await })
}

async fn drain<R>(worker: String, stderr: R, tail: DiagnosticTail)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut count: u64 = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                count += 1;
                tracing::debug!(target: STDERR_TARGET, worker = %worker, "{line}");
                tail.push(line);
            }
            Err(e) => {
                tracing::error!(worker = %worker, error = %e, "error reading worker stderr");
                break;
            }
        }
    }

    tracing::debug!(worker = %worker, lines = count, "worker stderr closed");
}
