//! Error types for the jobrow job queue.

use thiserror::Error;

use crate::job::JobId;

/// The main error type for jobrow.
#[derive(Error, Debug)]
pub enum JobrowError {
    /// The store could not be reached or rejected the operation.
    ///
    /// Transient: callers should retry at the polling layer.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// No claim strategy can serve the configured store.
    ///
    /// Raised while constructing the reservation engine, never by `reserve`.
    #[error("No claim strategy configured: {0}")]
    NoStrategyConfigured(String),

    /// A compare-and-swap claim lost the race for its candidate.
    #[error("Claim conflict on job {0}")]
    ClaimConflict(JobId),

    /// The job is now held under a different lock than the caller claimed it with.
    ///
    /// The caller's lock expired and another worker reclaimed the job; the
    /// caller must drop its copy without writing.
    #[error("Job {0} is no longer held by this claim")]
    LockLost(JobId),

    /// The store was asked for a primitive it does not declare.
    #[error("Store does not support {0}")]
    UnsupportedCapability(&'static str),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
}

impl JobrowError {
    /// Wrap a store driver error with context.
    pub fn store(context: &str, err: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(format!("{}: {}", context, err))
    }

    /// Whether the error is transient and the call may be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::ClaimConflict(_))
    }
}

/// Result type alias using JobrowError.
pub type Result<T> = std::result::Result<T, JobrowError>;
