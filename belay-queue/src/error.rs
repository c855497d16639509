//! Error types for queue operations.

use crate::job::JobId;
use thiserror::Error;

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-specific errors.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The persistence layer failed (I/O, connection, script error).
    ///
    /// Fatal to the current operation; the polling loop backs off and retries.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The job record no longer exists (already completed or deleted).
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Another worker holds (or has taken over) the claim on this job.
    #[error("Job {0} is claimed by another worker")]
    ClaimConflict(JobId),

    /// A unit of work failed.
    #[error("Job execution failed: {0}")]
    Execution(#[from] JobError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored record could not be decoded
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Worker not running
    #[error("Worker not running")]
    WorkerNotRunning,

    /// Worker already running
    #[error("Worker already running")]
    WorkerAlreadyRunning,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl QueueError {
    /// Whether retrying the whole operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// Failure raised by a unit of work.
///
/// The variant decides what the engine does next: a retryable failure is
/// rescheduled with backoff while attempts remain, a permanent one marks the
/// job failed immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Transient failure (network, rate limit, timeout).
    #[error("{0}")]
    Retryable(String),

    /// Failure that will not go away by retrying.
    #[error("{0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable failure.
    pub fn retryable(detail: impl Into<String>) -> Self {
        Self::Retryable(detail.into())
    }

    /// Create a permanent failure.
    pub fn permanent(detail: impl Into<String>) -> Self {
        Self::Permanent(detail.into())
    }

    /// Whether the engine may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// The failure detail recorded as `last_error`.
    pub fn detail(&self) -> &str {
        match self {
            Self::Retryable(detail) | Self::Permanent(detail) => detail,
        }
    }
}

impl From<serde_json::Error> for JobError {
    fn from(err: serde_json::Error) -> Self {
        Self::Permanent(format!("invalid job arguments: {}", err))
    }
}
