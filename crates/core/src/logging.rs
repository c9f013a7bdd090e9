//! Dual-sink logging: every formatted line reaches the platform sink
//! (stderr / logcat) and, when a path has been set, an append-mode log file
//! the host app can read without adb.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::Path,
    sync::{Mutex, Once, PoisonError},
};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use tracing_subscriber::EnvFilter;

static LOG_FILE: Lazy<Mutex<Option<File>>> = Lazy::new(|| Mutex::new(None));
static INIT: Once = Once::new();

/// Install the global tracing subscriber. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(false)
            .with_writer(|| DualWriter)
            .init();
    });
}

/// Point the file half of the sink at `path` (append mode), or close it when
/// `path` is `None`. A header line marks each new attachment so sessions can
/// be told apart in a long-lived file.
pub fn set_log_file(path: Option<&Path>) -> Result<()> {
    let mut guard = LOG_FILE.lock().unwrap_or_else(PoisonError::into_inner);
    *guard = None;
    if let Some(path) = path {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        writeln!(file, "\n=== MedGemma session started ===")?;
        file.flush()?;
        *guard = Some(file);
    }
    Ok(())
}

pub(crate) struct DualWriter;

impl io::Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stderr().write_all(buf);
        let mut guard = LOG_FILE.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(file) = guard.as_mut() {
            let _ = file.write_all(buf);
            let _ = file.flush();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}
