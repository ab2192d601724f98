//! Worker process supervision.
//!
//! Spawns the worker with piped stdio, exposes line-oriented access to its
//! stdin/stdout, and tears it down in escalating stages:
//!
//! 1. Close stdin and wait `grace`
//! 2. SIGTERM the worker's process group and wait `secondary_grace`
//! 3. SIGKILL and reap
//!
//! The worker runs in its own process group on Unix so that `npx` and the
//! `node` process it forks are signalled together.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

use super::errors::BridgeError;
use crate::config::WorkerConfig;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

// ─── WorkerStdio ─────────────────────────────────────────────────────────────

/// The request/response pipe pair: worker stdin for writing, stdout for reading.
pub struct WorkerStdio {
    name: String,
    writer: Option<BoxedWriter>,
    reader: BufReader<BoxedReader>,
    /// Bytes of a line whose read was cancelled before the newline arrived.
    partial: Vec<u8>,
}

impl WorkerStdio {
    /// Wrap any writer/reader pair. The session only ever sees this type, so
    /// in-memory pipes work as well as a child's stdio.
    pub fn new<W, R>(name: &str, writer: W, reader: R) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            name: name.to_string(),
            writer: Some(Box::new(writer)),
            reader: BufReader::new(Box::new(reader)),
            partial: Vec::new(),
        }
    }

    /// Write `text` followed by a newline (unless it already ends with one)
    /// and flush.
    pub async fn write_line(&mut self, text: &str) -> Result<(), BridgeError> {
        let writer = self.writer.as_mut().ok_or_else(|| BridgeError::PipeClosed {
            name: self.name.clone(),
            reason: "input stream already closed".into(),
        })?;

        let pipe_closed = |e: std::io::Error| BridgeError::PipeClosed {
            name: self.name.clone(),
            reason: format!("failed to write to stdin: {e}"),
        };

        writer.write_all(text.as_bytes()).await.map_err(pipe_closed)?;
        if !text.ends_with('\n') {
            writer.write_all(b"\n").await.map_err(pipe_closed)?;
        }
        writer.flush().await.map_err(pipe_closed)?;
        Ok(())
    }

    /// Read one line, without its terminator. `Ok(None)` means end-of-stream.
    ///
    /// Invalid UTF-8 is replaced rather than rejected so that the codec, not
    /// the pipe, reports the bad line. Cancel-safe: a dropped read keeps
    /// what it consumed for the next call.
    pub async fn read_line(&mut self) -> Result<Option<String>, BridgeError> {
        let bytes_read = match self.reader.read_until(b'\n', &mut self.partial).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "failed to read from stdout");
                return Err(BridgeError::ConnectionClosed {
                    name: self.name.clone(),
                });
            }
        };

        if bytes_read == 0 && self.partial.is_empty() {
            return Ok(None);
        }

        let buf = std::mem::take(&mut self.partial);
        let mut line = String::from_utf8_lossy(&buf).into_owned();
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    /// Shut down the write half. Safe to call repeatedly.
    pub async fn close_input(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(worker = %self.name, error = %e, "stdin shutdown failed");
            }
        }
    }
}

// ─── WorkerProcess ───────────────────────────────────────────────────────────

/// Handle to a running worker's OS process.
pub struct WorkerProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    exit_status: Option<ExitStatus>,
}

/// Everything produced by [`spawn`]. The three streams are independent so
/// they can be handed to different owners.
pub struct SpawnedWorker {
    pub process: WorkerProcess,
    pub stdio: WorkerStdio,
    pub stderr: Option<ChildStderr>,
}

/// Start the worker described by `config` with all three stdio streams piped.
pub fn spawn(config: &WorkerConfig) -> Result<SpawnedWorker, BridgeError> {
    let spawn_failed = |reason: String| BridgeError::SpawnFailed {
        name: config.name.clone(),
        reason,
    };

    if !config.working_dir.is_dir() {
        return Err(spawn_failed(format!(
            "working directory {} does not exist",
            config.working_dir.display()
        )));
    }

    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .envs(&config.env)
        .current_dir(&config.working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    // Windows: prevent console window from appearing for child processes
    #[cfg(target_os = "windows")]
    {
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| spawn_failed(format!("{}: {e}", config.command)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| spawn_failed("failed to capture stdout".into()))?;
    let stderr = child.stderr.take();
    let pid = child.id();

    tracing::info!(
        worker = %config.name,
        pid = ?pid,
        command = %config.command,
        args = ?config.args,
        cwd = %config.working_dir.display(),
        "worker process spawned"
    );

    Ok(SpawnedWorker {
        process: WorkerProcess {
            name: config.name.clone(),
            child,
            pid,
            exit_status: None,
        },
        stdio: WorkerStdio::new(&config.name, stdin, stdout),
        stderr,
    })
}

impl WorkerProcess {
    /// Check without blocking whether the worker has exited.
    pub fn has_exited(&mut self) -> bool {
        if self.exit_status.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(worker = %self.name, error = %e, "try_wait failed");
                false
            }
        }
    }

    /// Wait up to `limit` for the worker to exit.
    async fn wait_for_exit(&mut self, limit: Duration) -> bool {
        if self.has_exited() {
            return true;
        }
        match tokio::time::timeout(limit, self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_status = Some(status);
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = %self.name, error = %e, "wait failed");
                false
            }
            Err(_) => false,
        }
    }

    /// Stop the worker, escalating from stdin close to SIGTERM to SIGKILL.
    ///
    /// `stdio` is the request pipe if the caller could reclaim it; dropping
    /// it closes the worker's stdin. Returns the exit status if it could be
    /// collected. Calling this on an already-exited worker returns at once.
    pub async fn terminate(
        &mut self,
        stdio: Option<WorkerStdio>,
        grace: Duration,
        secondary_grace: Duration,
    ) -> Option<ExitStatus> {
        if let Some(mut stdio) = stdio {
            stdio.close_input().await;
        }

        if self.wait_for_exit(grace).await {
            tracing::info!(worker = %self.name, status = ?self.exit_status, "worker exited after stdin close");
            return self.exit_status;
        }

        tracing::warn!(
            worker = %self.name,
            grace_ms = grace.as_millis() as u64,
            "worker did not stop gracefully, terminating"
        );
        self.signal_terminate();

        if self.wait_for_exit(secondary_grace).await {
            tracing::info!(worker = %self.name, status = ?self.exit_status, "worker exited after SIGTERM");
            return self.exit_status;
        }

        tracing::warn!(worker = %self.name, "force killing worker");
        self.kill().await
    }

    /// SIGKILL the worker (and its process group) and reap it.
    pub async fn kill(&mut self) -> Option<ExitStatus> {
        if self.has_exited() {
            return self.exit_status;
        }

        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGKILL);

        if let Err(e) = self.child.kill().await {
            tracing::debug!(worker = %self.name, error = %e, "kill failed");
        }
        match self.child.wait().await {
            Ok(status) => {
                tracing::info!(worker = %self.name, ?status, "worker killed");
                self.exit_status = Some(status);
            }
            Err(e) => {
                tracing::error!(worker = %self.name, error = %e, "failed to reap worker");
            }
        }
        self.exit_status
    }

    /// Ask the worker politely to exit.
    fn signal_terminate(&mut self) {
        #[cfg(unix)]
        self.signal_group(nix::sys::signal::Signal::SIGTERM);

        // No SIGTERM on Windows; the next stage kills.
        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                tracing::debug!(worker = %self.name, error = %e, "start_kill failed");
            }
        }
    }

    #[cfg(unix)]
    fn signal_group(&self, signal: nix::sys::signal::Signal) {
        use nix::sys::signal::killpg;
        use nix::unistd::Pid;

        let Some(pid) = self.pid else {
            return;
        };
        tracing::debug!(worker = %self.name, pid, ?signal, "signalling worker process group");
        if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
            // ESRCH: the group is already gone
            tracing::debug!(worker = %self.name, pid, error = ?e, "killpg failed");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Instant;

    fn sh_worker(script: &str) -> WorkerConfig {
        WorkerConfig {
            name: "sh-worker".into(),
            command: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: std::env::temp_dir(),
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_write_and_read_lines_over_memory_pipe() {
        let (client, worker) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (worker_read, mut worker_write) = tokio::io::split(worker);
        let mut stdio = WorkerStdio::new("mem", client_write, client_read);

        stdio.write_line("{\"a\":1}").await.unwrap();
        let mut worker_lines = BufReader::new(worker_read).lines();
        assert_eq!(worker_lines.next_line().await.unwrap().unwrap(), "{\"a\":1}");

        worker_write.write_all(b"{\"b\":2}\r\n").await.unwrap();
        assert_eq!(stdio.read_line().await.unwrap().unwrap(), "{\"b\":2}");

        drop(worker_write);
        drop(worker_lines);
        assert_eq!(stdio.read_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancelled_read_keeps_partial_line() {
        let (client, worker) = tokio::io::duplex(1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (_worker_read, mut worker_write) = tokio::io::split(worker);
        let mut stdio = WorkerStdio::new("mem", client_write, client_read);

        worker_write.write_all(b"{\"id\":").await.unwrap();
        let cancelled =
            tokio::time::timeout(std::time::Duration::from_millis(50), stdio.read_line()).await;
        assert!(cancelled.is_err());

        worker_write.write_all(b"7}\n").await.unwrap();
        assert_eq!(stdio.read_line().await.unwrap().unwrap(), "{\"id\":7}");
    }

    #[tokio::test]
    async fn test_write_after_close_is_pipe_closed() {
        let (client, _worker) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(client);
        let mut stdio = WorkerStdio::new("mem", w, r);
        stdio.close_input().await;
        stdio.close_input().await;
        let err = stdio.write_line("x").await.unwrap_err();
        assert!(matches!(err, BridgeError::PipeClosed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let config = WorkerConfig {
            command: "/definitely/not/a/worker-binary".into(),
            working_dir: std::env::temp_dir(),
            ..WorkerConfig::default()
        };
        let err = spawn(&config).err().unwrap();
        assert!(matches!(err, BridgeError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_spawn_missing_working_dir() {
        let config = WorkerConfig {
            working_dir: PathBuf::from("/definitely/not/a/dir"),
            ..WorkerConfig::default()
        };
        let err = spawn(&config).err().unwrap();
        assert!(err.to_string().contains("does not exist"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_graceful_on_stdin_close() {
        let spawned = spawn(&sh_worker("cat > /dev/null")).unwrap();
        let mut process = spawned.process;
        let start = Instant::now();
        let status = process
            .terminate(
                Some(spawned.stdio),
                Duration::from_secs(5),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert!(status.success());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let spawned =
            spawn(&sh_worker("trap '' TERM; while :; do sleep 1; done")).unwrap();
        let mut process = spawned.process;
        let grace = Duration::from_millis(300);
        let secondary = Duration::from_millis(300);

        let start = Instant::now();
        let status = process.terminate(Some(spawned.stdio), grace, secondary).await;
        let elapsed = start.elapsed();

        assert!(status.is_some());
        assert!(!status.unwrap().success());
        assert!(elapsed >= grace + secondary);
        assert!(elapsed < grace + secondary + Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let spawned = spawn(&sh_worker("exit 0")).unwrap();
        let mut process = spawned.process;
        let first = process
            .terminate(Some(spawned.stdio), Duration::from_secs(2), Duration::from_secs(1))
            .await;
        let start = Instant::now();
        let second = process
            .terminate(None, Duration::from_secs(2), Duration::from_secs(1))
            .await;
        assert_eq!(first, second);
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(process.has_exited());
    }
}
