use std::path::PathBuf;

use thiserror::Error;

use crate::modules::jobs::model::JobKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
}

/// Failures talking to the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(#[from] redis::RedisError),

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("store call timed out")]
    Timeout,

    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("version conflict on job {id}: expected version {expected}")]
    Conflict { id: String, expected: u64 },
}

impl StoreError {
    pub fn corrupt(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Corrupt {
            key: key.into(),
            reason: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LeaseError {
    /// The lease expired or was taken over; the holder no longer owns the key.
    #[error("lease {key} lost")]
    Lost { key: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lost lease on job {job_id}")]
    LostLease { job_id: String },

    #[error("no handler registered for job kind {0}")]
    NoHandler(JobKind),
}

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("input file does not exist: {}", .0.display())]
    FileNotExists(PathBuf),

    #[error("conversion stopped at {progress:.2}%, keeping original file")]
    Incomplete { progress: f64 },
}
