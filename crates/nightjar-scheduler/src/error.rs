//! Error types for the scheduler.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in scheduler operations.
///
/// Every variant is recoverable. Outer layers map them 1:1 to their own
/// status codes; nothing here is meant to bring the process down.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Job run not found.
    #[error("job run not found: {0}")]
    JobRunNotFound(String),

    /// Template not found.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// Schedule not found.
    #[error("schedule not found: {0}")]
    ScheduleNotFound(String),

    /// Job group not found.
    #[error("job group not found: {0}")]
    GroupNotFound(String),

    /// Direct reservation not found.
    #[error("reservation not found: {0}")]
    ReservationNotFound(String),

    /// The operation would break an invariant (mutating a dispatched job,
    /// cancelling a running job, retrying a run that did not fail, ...).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Another direct reservation is already active.
    #[error("reservation conflict: {reservation_id} is held by {reserved_by}")]
    ReservationConflict {
        reservation_id: String,
        reserved_by: String,
    },

    /// A claim lost the race for a job. Expected under concurrency.
    #[error("concurrency violation: {0}")]
    ConcurrencyViolation(String),

    /// Waiting for the worker exceeded the caller's bound.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Storage engine failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Stored JSON could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SchedulerError {
    /// Whether this error reports a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::JobNotFound(_)
                | Self::JobRunNotFound(_)
                | Self::TemplateNotFound(_)
                | Self::ScheduleNotFound(_)
                | Self::GroupNotFound(_)
                | Self::ReservationNotFound(_)
        )
    }

    /// Whether this error is a lost claim race.
    pub fn is_concurrency_violation(&self) -> bool {
        matches!(self, Self::ConcurrencyViolation(_))
    }
}

// rusqlite's error type stays inside the storage layer.
impl From<rusqlite::Error> for SchedulerError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

/// Errors a [`JobHandler`](crate::JobHandler) can report.
///
/// The executor turns every one of these into a FAILED run.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// No command is configured for the job type.
    #[error("no handler configured for job type: {0}")]
    UnknownJobType(String),

    /// The process could not be launched.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// I/O error while running the job.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Params could not be encoded for the handler.
    #[error("invalid params: {0}")]
    Params(#[from] serde_json::Error),

    /// Any other handler-specific failure.
    #[error("{0}")]
    Other(String),
}
