//! Error types for the sync pipeline
//!
//! Record-level problems ([`RecordError`]) are counted and skipped inside the
//! batch loop and never escape it. Everything in [`SyncError`] aborts the run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Fatal and batch-level failures of a sync run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("timed out after {waited:?} waiting for lock on '{resource}'")]
    LockTimeout { resource: String, waited: Duration },

    #[error("failed to fetch page {page} from {source_name}: {message}")]
    PageFetch {
        source_name: String,
        page: u32,
        message: String,
    },

    #[error("source file not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    #[error("batch write to '{resource}' failed and was rolled back: {source}")]
    BatchWrite {
        resource: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("events for {subject_id}/{series_key} are not ordered by time at position {position}")]
    UnorderedEvents {
        subject_id: i64,
        series_key: String,
        position: usize,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl SyncError {
    pub fn page_fetch(source_name: &str, page: u32, error: &anyhow::Error) -> Self {
        Self::PageFetch {
            source_name: source_name.to_string(),
            page,
            message: format!("{error:#}"),
        }
    }

    /// Whether the failure happened inside a batch transaction that was rolled back
    pub fn is_batch_level(&self) -> bool {
        matches!(self, Self::BatchWrite { .. })
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Why a single source record was skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid email: '{0}'")]
    InvalidEmail(String),

    #[error("required field '{0}' is missing")]
    MissingField(&'static str),

    #[error("malformed row at line {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
