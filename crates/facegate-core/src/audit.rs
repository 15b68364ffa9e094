//! Append-only audit trail of verification attempts.
//!
//! Records are newline-delimited JSON, one line per attempt, in files
//! partitioned by UTC date. Lines are never rewritten.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// One verification attempt as written to the trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub identity: String,
    pub similarity: f64,
    pub threshold: f64,
    pub outcome: AuditOutcome,
    pub attempt_number: u32,
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

/// Per-request context carried into audit sinks and log spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub request_id: Uuid,
    /// Free-form caller description, e.g. a client address or `cli`.
    pub origin: Option<String>,
}

impl AuditContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

impl Default for AuditContext {
    fn default() -> Self {
        Self::new()
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, record: &AuditRecord) -> AppResult<()>;
}

/// Date-partitioned JSONL files: `<dir>/verification_log_YYYYMMDD.jsonl`.
pub struct JsonlAuditLog {
    dir: PathBuf,
    guard: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("verification_log_{}.jsonl", date.format("%Y%m%d")))
    }

    fn append(&self, path: &Path, record: &AuditRecord) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut line = serde_json::to_vec(record).map_err(io::Error::other)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, record: &AuditRecord) -> AppResult<()> {
        let path = self.log_path_for(record.timestamp.date_naive());
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        self.append(&path, record)
            .map_err(|source| AppError::AuditWrite { path, source })
    }
}

/// Keeps records in memory; handy for tests and embedding callers.
#[derive(Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, record: &AuditRecord) -> AppResult<()> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
