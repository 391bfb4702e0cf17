//! Queue and stage error types.

use derive_more::Display;
use thiserror::Error;

use crate::job::JobId;

#[derive(Debug, Error)]
pub enum QueueError {
    /// The store could not confirm the operation. No job state may be
    /// assumed changed.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] shipyard_core::Error),
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        QueueError::StoreUnavailable(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for QueueError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        QueueError::StoreUnavailable(format!("migration failed: {}", err))
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum StageErrorKind {
    /// Retried until the queue's attempt ceiling.
    #[display("transient")]
    Transient,
    /// Fails the job immediately.
    #[display("permanent")]
    Permanent,
}

/// Outcome of a failed stage handler invocation.
#[derive(Debug, Clone, Error)]
#[error("{kind} stage failure: {message}")]
pub struct StageError {
    pub kind: StageErrorKind,
    pub message: String,
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: StageErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.kind == StageErrorKind::Permanent
    }
}

impl From<shipyard_core::Error> for StageError {
    fn from(err: shipyard_core::Error) -> Self {
        if err.is_permanent() {
            StageError::permanent(err.to_string())
        } else {
            StageError::transient(err.to_string())
        }
    }
}

impl From<QueueError> for StageError {
    fn from(err: QueueError) -> Self {
        match err {
            // A payload that does not decode now never will.
            QueueError::InvalidPayload(e) => StageError::permanent(e.to_string()),
            QueueError::Core(e) => e.into(),
            other => StageError::transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::permanent(format!("invalid payload: {}", err))
    }
}
