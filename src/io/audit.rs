//! Audit trail - appends every entry/exit mutation to a JSONL file

use crate::domain::events::{AuditEvent, AuditSink};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// JSONL audit writer
///
/// The file handle is opened lazily and kept behind a mutex so concurrent
/// mutations append whole lines.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl AuditLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!(file_path = %path.display(), "audit_log_initialized");
        Self { path, file: Mutex::new(None) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            *guard = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        if let Some(file) = guard.as_mut() {
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }
}

impl AuditSink for AuditLog {
    fn record(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                error!(record_id = %event.record_id, error = %e, "audit_serialize_failed");
                return;
            }
        };
        match self.append_line(&line) {
            Ok(()) => debug!(record_id = %event.record_id, bytes = %line.len(), "audit_written"),
            Err(e) => error!(record_id = %event.record_id, error = %e, "audit_write_failed"),
        }
    }
}
