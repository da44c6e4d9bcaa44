//! The engine's error type.

use thiserror::Error;

use crate::types::{JobId, JobStatus};

/// Errors surfaced by every engine operation.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Filesystem or process I/O failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The job already has an active dispatch cycle.
    #[error("scan {job_id} is already {status}")]
    DispatchConflict {
        /// The job holding the active cycle.
        job_id: JobId,
        /// Its status when the conflict was detected.
        status: JobStatus,
    },

    /// The directory is already the artifact directory of a recorded scan.
    #[error("directory already belongs to scan {job_id}")]
    AlreadyImported {
        /// The scan that owns the directory.
        job_id: JobId,
    },

    /// A status change that does not move forward in the lifecycle.
    #[error("invalid status transition for scan {job_id}: {from} -> {to}")]
    InvalidTransition {
        /// The job the change was requested for.
        job_id: JobId,
        /// Status the caller expected the job to have.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// Deliberately carries no detail so callers cannot tell a missing
    /// resource apart from a denied one.
    #[error("forbidden")]
    Forbidden,

    /// No such record. Scan lookups report `Forbidden` instead.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was malformed; the message is safe to show the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A processed artifact could not be read or parsed.
    #[error("Artifact parse error in {path}: {message}")]
    ArtifactParse {
        /// Path of the artifact.
        path: String,
        /// Parser or read error.
        message: String,
    },

    /// The tool could not be started or supervised.
    #[error("Execution error: {0}")]
    Execution(String),

    /// A repository operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operation was cut short by shutdown.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// A bug or an invariant the engine could not uphold.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for ScanError {
    fn from(err: sqlx::Error) -> Self {
        ScanError::Storage(err.to_string())
    }
}

/// Shorthand used across the engine.
pub type Result<T> = std::result::Result<T, ScanError>;
