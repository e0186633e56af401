//! Structured logging setup.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from CLI/config level
//! - Route output to stderr or a log file
//! - Support reopening the log file on SIGHUP (external rotation)
//!
//! # Design Decisions
//! - Numeric levels follow the historical CLI: 0=error, 1=warn, 2=info,
//!   3=debug, 4+=trace; `RUST_LOG` wins when set
//! - Rotation is reopen-based: the rotator renames the file, we reopen
//!   the configured path on signal

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

struct LogFileInner {
    path: PathBuf,
    file: File,
}

/// A log sink whose file can be reopened at any time from any thread.
#[derive(Clone)]
pub struct LogFile {
    inner: Arc<Mutex<LogFileInner>>,
}

impl LogFile {
    pub fn open(path: &Path) -> io::Result<LogFile> {
        let file = open_append(path)?;
        Ok(LogFile {
            inner: Arc::new(Mutex::new(LogFileInner {
                path: path.to_path_buf(),
                file,
            })),
        })
    }

    /// Reopen the configured path (log rotation).
    pub fn reopen(&self) {
        let mut inner = self.inner.lock().unwrap();
        match open_append(&inner.path) {
            Ok(file) => {
                inner.file = file;
                tracing::info!(path = %inner.path.display(), "log file reopened");
            }
            Err(e) => {
                tracing::error!(path = %inner.path.display(), error = %e, "failed to reopen log file");
            }
        }
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct LogFileWriter {
    inner: Arc<Mutex<LogFileInner>>,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().unwrap().file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().unwrap().file.flush()
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

fn level_filter(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Initialize logging. Returns the log file handle when logging to a
/// file, so the signal path can rotate it.
pub fn init_logging(level: u8, logfile: Option<&Path>) -> io::Result<Option<LogFile>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("pushpin_proxy={}", level_filter(level))));

    match logfile {
        Some(path) => {
            let log_file = LogFile::open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(log_file.clone()),
                )
                .init();
            Ok(Some(log_file))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            Ok(None)
        }
    }
}
