//! Handler outcome types.
//!
//! A [`ChangeHandler`](crate::ChangeHandler) reports how it processed a
//! replayed event. The coordinator only logs and counts failures: the event
//! is terminal either way.

use thiserror::Error;

/// Outcome of replaying one event into a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Event applied
    Success,
    /// Event payload was rejected
    InvalidEntry,
    /// Event could not be applied
    Failed,
    /// Handler chose not to act (duplicate, stale, etc.)
    Ignore,
}

impl TaskStatus {
    /// Returns true if the event needs no further attention.
    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Ignore)
    }

    /// Returns true if the handler failed to apply the event.
    pub fn is_failure(&self) -> bool {
        matches!(self, TaskStatus::InvalidEntry | TaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::InvalidEntry => "invalid_entry",
            TaskStatus::Failed => "failed",
            TaskStatus::Ignore => "ignore",
        }
    }
}

/// Error returned by a handler.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The payload was malformed
    #[error("Invalid entry: {message}")]
    InvalidEntry { message: String },

    /// Writing derived state failed
    #[error("Datastore write failed: {message}")]
    WriteFailed { message: String },

    /// The handler deliberately skipped the event
    #[error("Ignored: {reason}")]
    Ignored { reason: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TaskError {
    /// Creates an invalid entry error.
    pub fn invalid_entry(message: impl Into<String>) -> Self {
        TaskError::InvalidEntry {
            message: message.into(),
        }
    }

    /// Creates a write failure.
    pub fn write_failed(message: impl Into<String>) -> Self {
        TaskError::WriteFailed {
            message: message.into(),
        }
    }

    /// Creates an ignored outcome.
    pub fn ignored(reason: impl Into<String>) -> Self {
        TaskError::Ignored {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        TaskError::Internal {
            message: message.into(),
        }
    }

    /// Converts this error to a TaskStatus.
    pub fn to_status(&self) -> TaskStatus {
        match self {
            TaskError::InvalidEntry { .. } => TaskStatus::InvalidEntry,
            TaskError::WriteFailed { .. } => TaskStatus::Failed,
            TaskError::Ignored { .. } => TaskStatus::Ignore,
            TaskError::Internal { .. } => TaskStatus::Failed,
        }
    }
}

/// Result type for handler callbacks.
pub type TaskResult<T> = Result<T, TaskError>;

/// Extension trait for converting TaskResult to TaskStatus.
pub trait TaskResultExt {
    /// Converts this result to a TaskStatus.
    fn to_status(&self) -> TaskStatus;
}

impl<T> TaskResultExt for TaskResult<T> {
    fn to_status(&self) -> TaskStatus {
        match self {
            Ok(_) => TaskStatus::Success,
            Err(e) => e.to_status(),
        }
    }
}
