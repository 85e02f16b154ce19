//! Attendance ledger: one immutable CSV per completed session.

use crate::session::{dedup_by_identity, validate_subject, AttendanceEntry};
use chrono::{DateTime, Local};
use geoattend_core::Identity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger already exists: {0}")]
    Exists(PathBuf),
    #[error("invalid subject: {0}")]
    InvalidSubject(String),
    #[error("ledger I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// One persisted row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRow {
    pub identity: Identity,
    pub display_name: String,
}

pub struct AttendanceLedger {
    root: PathBuf,
}

impl AttendanceLedger {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<subject>/<subject>_<YYYY-MM-DD>_<HH-MM-SS>.csv`
    pub fn path_for(&self, subject: &str, timestamp: &DateTime<Local>) -> PathBuf {
        self.root.join(subject).join(format!(
            "{subject}_{}.csv",
            timestamp.format("%Y-%m-%d_%H-%M-%S")
        ))
    }

    /// Write the deduplicated `entries` for one session.
    ///
    /// The file appears atomically (temporary sibling, then rename) and an
    /// existing ledger is never overwritten.
    pub fn persist(
        &self,
        entries: &[AttendanceEntry],
        subject_label: &str,
        timestamp: DateTime<Local>,
    ) -> Result<PathBuf, LedgerError> {
        let subject = validate_subject(subject_label).map_err(LedgerError::InvalidSubject)?;
        let path = self.path_for(subject, &timestamp);
        if path.exists() {
            return Err(LedgerError::Exists(path));
        }
        let dir = self.root.join(subject);
        fs::create_dir_all(&dir)?;

        let rows: Vec<LedgerRow> = dedup_by_identity(entries.to_vec())
            .into_iter()
            .map(|e| LedgerRow {
                identity: e.identity,
                display_name: e.display_name,
            })
            .collect();

        let tmp = path.with_extension("csv.tmp");
        if let Err(e) = Self::write_rows(&tmp, &rows) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        // Re-check: another writer may have claimed the name meanwhile.
        if path.exists() {
            let _ = fs::remove_file(&tmp);
            return Err(LedgerError::Exists(path));
        }
        fs::rename(&tmp, &path)?;

        tracing::info!(path = %path.display(), entries = rows.len(), subject, "ledger persisted");
        Ok(path)
    }

    fn write_rows(path: &Path, rows: &[LedgerRow]) -> Result<(), LedgerError> {
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_path(path)?;
        writer.write_record(["identity", "display_name"])?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Read a ledger file back.
    pub fn read(path: &Path) -> Result<Vec<LedgerRow>, LedgerError> {
        let mut reader = csv::Reader::from_path(path)?;
        let rows = reader.deserialize().collect::<Result<Vec<LedgerRow>, _>>()?;
        Ok(rows)
    }

    /// Ledger files recorded for `subject`, oldest first.
    pub fn list(&self, subject_label: &str) -> Result<Vec<PathBuf>, LedgerError> {
        let subject = validate_subject(subject_label).map_err(LedgerError::InvalidSubject)?;
        let dir = self.root.join(subject);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect();
        files.sort();
        Ok(files)
    }
}
