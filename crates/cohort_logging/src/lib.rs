//! Shared logging utilities for cohort binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "cohort=info,cohort_coordinator=info,cohort_worker=info,cohort_analyzer=info";
const MAX_LOG_FILES: usize = 5;
const MAX_LOG_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Initialize tracing with a size-rotated log file and stderr output.
///
/// The file layer always gets the full filter; stderr stays at `warn` unless
/// `verbose` is set, so progress rendering is not interleaved with log lines.
pub fn init_logging(app_name: &str, verbose: bool) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let file_writer = SharedLogWriter::open(log_dir, app_name)
        .context("Failed to initialize rotating log writer")?;

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let console_filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    } else {
        EnvFilter::new("warn")
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// Cohort home directory: ~/.cohort (COHORT_HOME overrides).
pub fn cohort_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("COHORT_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cohort")
}

/// Logs directory: ~/.cohort/logs
pub fn logs_dir() -> PathBuf {
    cohort_home().join("logs")
}

/// Default checkpoint directory: ~/.cohort/checkpoints
pub fn default_checkpoint_dir() -> PathBuf {
    cohort_home().join("checkpoints")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Append-only log file that rotates by size, keeping `MAX_LOG_FILES`
/// generations (`cohort.log`, `cohort.log.1`, ...).
struct RotatingLogFile {
    dir: PathBuf,
    base_name: String,
    file: File,
    written: u64,
}

impl RotatingLogFile {
    fn open(dir: PathBuf, base_name: &str) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let base_name = sanitize_name(base_name);
        let file = Self::open_file(&dir, &base_name)?;
        let written = file.metadata()?.len();
        let mut this = Self {
            dir,
            base_name,
            file,
            written,
        };
        if this.written > MAX_LOG_FILE_SIZE {
            this.rotate()?;
        }
        Ok(this)
    }

    fn open_file(dir: &PathBuf, base_name: &str) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", base_name)))
    }

    fn generation_path(&self, index: usize) -> PathBuf {
        if index == 0 {
            self.dir.join(format!("{}.log", self.base_name))
        } else {
            self.dir.join(format!("{}.log.{}", self.base_name, index))
        }
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();

        let oldest = self.generation_path(MAX_LOG_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (0..MAX_LOG_FILES - 1).rev() {
            let src = self.generation_path(index);
            if src.exists() {
                fs::rename(&src, self.generation_path(index + 1))?;
            }
        }

        self.file = Self::open_file(&self.dir, &self.base_name)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for RotatingLogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_SIZE {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[derive(Clone)]
struct SharedLogWriter {
    inner: Arc<Mutex<RotatingLogFile>>,
}

impl SharedLogWriter {
    fn open(dir: PathBuf, base_name: &str) -> Result<Self> {
        let file = RotatingLogFile::open(dir, base_name)
            .with_context(|| format!("Failed to open log file for {}", base_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(file)),
        })
    }
}

struct SharedLogWriterGuard {
    inner: Arc<Mutex<RotatingLogFile>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for SharedLogWriter {
    type Writer = SharedLogWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedLogWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for SharedLogWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}
