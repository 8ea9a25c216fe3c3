//! Per-conversation transcript logs.
//!
//! Each stream can append timestamped lines (prompts, raw engine events,
//! questions) to `{log_dir}/{conversation_id}.log`. Diagnostics go through
//! the `log` facade instead.

use std::{
    fs::{File, OpenOptions},
    io::Write,
    path::Path,
    sync::{Arc, Mutex},
};

use chrono::{SecondsFormat, Utc};

use crate::paths::is_safe_file_stem;

/// Thread-safe handle to an append-only log file.
pub type LogHandle = Arc<Mutex<Option<File>>>;

/// A handle that discards everything written to it.
pub fn disabled_log() -> LogHandle {
    Arc::new(Mutex::new(None))
}

/// Write a timestamped line to the log file (if present).
pub fn log_line(handle: &LogHandle, direction: &str, data: &str) {
    if let Ok(mut guard) = handle.lock() {
        if let Some(ref mut file) = *guard {
            let ts = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
            let _ = writeln!(file, "[{}] {}: {}", ts, direction, data);
            let _ = file.flush();
        }
    }
}

/// Open (or create) a log file at `{log_dir}/{log_id}.log` and return a shared handle.
///
/// Returns a disabled handle when no directory is configured, the id is not a
/// plain file name, or the file cannot be opened.
pub fn open_log_file(log_dir: Option<&Path>, log_id: &str) -> LogHandle {
    if !is_safe_file_stem(log_id) {
        log::warn!("Refusing to open transcript log for id '{}'", log_id);
        return disabled_log();
    }

    let file = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", log_id)))
            .ok()
    });
    Arc::new(Mutex::new(file))
}
