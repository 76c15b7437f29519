//! Audit trail of state-changing operations.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Destination of audit entries.
pub trait AuditSink: fmt::Debug + Send + Sync {
    /// Records an operation. Failures are the sink's to report; they never
    /// fail the operation itself.
    fn record(&self, actor: &str, action: &str, details: Value);
}

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    actor: &'a str,
    action: &'a str,
    details: Value,
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl JsonlAuditLog {
    /// A log appending to `path`. Nothing is created until the first entry.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    /// File the log appends to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, actor: &str, action: &str, details: Value) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            actor,
            action,
            details,
        };
        let result = serde_json::to_string(&entry)
            .map_err(std::io::Error::other)
            .and_then(|line| self.append(&line));
        if let Err(err) = result {
            warn!(path = %self.path.display(), action, error = %err, "Failed to write audit entry.");
        }
    }
}
