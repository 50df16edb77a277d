//! # Error Module
//!
//! Error types for the media pipeline.
//!
//! ## Design Principles
//! - **Never panic** on library data - return errors instead
//! - **Include context** - paths, job ids, what went wrong
//! - **Classify failures** - per-item errors say whether a retry can help,
//!   batch-level errors abort the grouped write as a whole

use crate::core::media::Stage;
use crate::core::queue::{JobId, JobState, WorkerId};
use std::path::PathBuf;
use thiserror::Error;

/// Top-level application error
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Scanning error: {0}")]
    Scan(#[from] ScanError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),

    #[error("Comparison error: {0}")]
    Compare(#[from] CompareError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Errors that occur while walking a media folder
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Directory not found: {path}")]
    DirectoryNotFound { path: PathBuf },

    #[error("Failed to read directory {path}: {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Input that cannot be turned into a fingerprint
#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("Image could not be decoded: {reason}")]
    InvalidImage { reason: String },

    #[error("Image is {width}x{height}, fewer pixels than the {grid}x{grid} fingerprint grid")]
    TooSmall { width: u32, height: u32, grid: u32 },
}

/// Errors that occur when comparing fingerprints
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompareError {
    #[error("Fingerprint lengths differ: {left} vs {right} hex digits")]
    LengthMismatch { left: usize, right: usize },

    #[error("Invalid hex digit '{found}' at position {position}")]
    InvalidHex { position: usize, found: char },

    #[error("Fingerprint is empty")]
    Empty,

    #[error("Invalid threshold: {0}")]
    InvalidThreshold(String),
}

/// Failures of the stage extractors (EXIF, thumbnail, analysis, file reads)
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Extraction failed for {path}: {reason}")]
    Failed { path: PathBuf, reason: String },

    #[error("Unsupported media file: {path}")]
    Unsupported { path: PathBuf },
}

impl ExtractionError {
    /// Whether running the same extraction again could succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExtractionError::Unsupported { .. })
    }
}

/// Errors raised by the media store. Any of these aborts the grouped write.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Failed to open database at {path}: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    #[error("Database query failed: {0}")]
    QueryFailed(String),

    #[error("Stored value is malformed: {0}")]
    Corrupt(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Injected failure: {0}")]
    Injected(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(e: rusqlite::Error) -> Self {
        PersistenceError::QueryFailed(e.to_string())
    }
}

/// Errors raised by job queues
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job {0} does not exist")]
    UnknownJob(JobId),

    #[error("Worker {worker} does not hold the lease on job {job}")]
    NotLeaseHolder { job: JobId, worker: WorkerId },

    #[error("A {payload} payload cannot be enqueued on the {queue} queue")]
    PayloadMismatch { queue: Stage, payload: Stage },

    #[error("Cannot reset jobs in state {0}")]
    UnsupportedReset(JobState),

    #[error("Queue storage failed: {0}")]
    Storage(String),

    #[error("Queue lock poisoned")]
    LockPoisoned,
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Storage(e.to_string())
    }
}

/// Errors loading or validating configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A single item's failure inside a batch.
///
/// These are folded into the batch outcome and never abort sibling work.
#[derive(Error, Debug)]
pub enum ItemError {
    #[error(transparent)]
    InvalidImage(#[from] FingerprintError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Compare(#[from] CompareError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error("Missing input: {0}")]
    MissingInput(String),
}

impl ItemError {
    /// Transient failures are left for redelivery; everything else is a
    /// definitive failure recorded on the item.
    pub fn is_retryable(&self) -> bool {
        match self {
            ItemError::Extraction(e) => e.is_retryable(),
            ItemError::Scan(e) => matches!(e, ScanError::ReadDirectory { .. }),
            ItemError::InvalidImage(_) | ItemError::Compare(_) | ItemError::MissingInput(_) => {
                false
            }
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_error_includes_path() {
        let error = ScanError::DirectoryNotFound {
            path: PathBuf::from("/photos/vacation"),
        };
        assert!(error.to_string().contains("/photos/vacation"));
    }

    #[test]
    fn length_mismatch_reports_both_lengths() {
        let message = CompareError::LengthMismatch { left: 16, right: 60 }.to_string();
        assert!(message.contains("16"));
        assert!(message.contains("60"));
    }

    #[test]
    fn extraction_io_errors_are_retryable() {
        let error = ItemError::from(ExtractionError::Io {
            path: PathBuf::from("/photos/a.jpg"),
            source: std::io::Error::new(std::io::ErrorKind::Interrupted, "interrupted"),
        });
        assert!(error.is_retryable());
    }

    #[test]
    fn invalid_images_are_definitive() {
        let error = ItemError::from(FingerprintError::InvalidImage {
            reason: "truncated".to_string(),
        });
        assert!(!error.is_retryable());

        let unsupported = ItemError::from(ExtractionError::Unsupported {
            path: PathBuf::from("/photos/a.xyz"),
        });
        assert!(!unsupported.is_retryable());
    }
}
