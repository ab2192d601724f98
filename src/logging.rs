//! Tracing subscriber setup.
//!
//! Logs go to stderr by default. With `logging.file` set they go to that file
//! instead, rotated on every startup (`bridge.log` → `bridge.log.1` → … keeps
//! the last 3) and flushed after every line so a crash loses nothing.

use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Filter used when neither `RUST_LOG` nor `logging.filter` is set.
pub const DEFAULT_FILTER: &str = "browser_bridge=info,warn";

/// Rotated log files kept next to the active one.
const KEEP_ROTATED: u32 = 3;

/// Install the global tracing subscriber.
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init_tracing(config: &LoggingConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(config.filter.as_deref().unwrap_or(DEFAULT_FILTER))
    });

    let mut rotation_failures = Vec::new();
    let (writer, ansi) = match &config.file {
        Some(path) => {
            if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            rotation_failures = rotate_log_file(path, KEEP_ROTATED);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            (BoxMakeWriter::new(FlushingWriter::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };
    installed.map_err(std::io::Error::other)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?config.file,
        pid = std::process::id(),
        "=== browser-bridge starting ==="
    );
    for failure in rotation_failures {
        tracing::debug!(%failure, "log rotation step failed");
    }
    Ok(())
}

/// Rotate log files: `bridge.log` → `bridge.log.1` → `.2` → … → `.{keep}`.
///
/// The file past `keep` is deleted. Missing links in the chain are skipped;
/// any other failure is returned so it can be logged once tracing is up.
fn rotate_log_file(base_path: &Path, keep: u32) -> Vec<String> {
    let rotated = |i: u32| PathBuf::from(format!("{}.{i}", base_path.display()));
    let mut failures = Vec::new();
    let mut note = |action: &str, path: &Path, result: std::io::Result<()>| {
        if let Err(e) = result {
            if e.kind() != ErrorKind::NotFound {
                failures.push(format!("{action} {}: {e}", path.display()));
            }
        }
    };

    let oldest = rotated(keep);
    note("remove", &oldest, std::fs::remove_file(&oldest));
    for i in (1..keep).rev() {
        let from = rotated(i);
        note("rename", &from, std::fs::rename(&from, rotated(i + 1)));
    }
    note("rename", base_path, std::fs::rename(base_path, rotated(1)));
    failures
}

/// A file writer that flushes after every write.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(Mutex::new(file)),
        }
    }
}

impl Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = f.write(buf)?;
        f.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        f.flush()
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
