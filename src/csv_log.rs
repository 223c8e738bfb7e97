//! Append-only CSV logger with duplicate suppression

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::permissions::{Permission, PermissionGate};
use crate::reading::ReadingDisplay;

/// Name of the output file inside the output directory
pub const CSV_FILE_NAME: &str = "data.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    Appended,
    /// Same line as the last append; nothing written
    Duplicate,
    /// Storage permission missing; requested and skipped
    PermissionDenied,
    /// Open or write failed; the failure was logged
    Failed,
}

#[derive(Debug)]
pub struct CsvLogger {
    path: PathBuf,
    last_line: Option<String>,
}

impl CsvLogger {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(CSV_FILE_NAME),
            last_line: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last line that was actually appended
    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    /// Append the formatted reading unless it equals the last appended line.
    ///
    /// Never returns an error: I/O failures are logged and reported as
    /// `LogOutcome::Failed`, and the dedup marker is only moved after the
    /// write succeeded.
    pub fn log_if_changed(
        &mut self,
        display: &ReadingDisplay,
        gate: &mut dyn PermissionGate,
    ) -> LogOutcome {
        if !gate.has(Permission::StorageWrite) {
            gate.request(Permission::StorageWrite);
            return LogOutcome::PermissionDenied;
        }

        let line = display.csv_line();
        if self.last_line.as_deref() == Some(line.as_str()) {
            tracing::trace!("Skipping duplicate line");
            return LogOutcome::Duplicate;
        }

        match self.append(&line) {
            Ok(()) => {
                tracing::debug!("Saved line to {:?}", self.path);
                self.last_line = Some(line);
                LogOutcome::Appended
            }
            Err(e) => {
                tracing::warn!("Failed to append to {:?}: {}", self.path, e);
                LogOutcome::Failed
            }
        }
    }

    fn append(&self, line: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }
}
