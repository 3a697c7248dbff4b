//! Error types for the deferred dependency-resolution engine.
//!
//! None of these ever reach a notification-delivery task: per-event failures
//! are logged by the coordinator and the remaining work continues.

use crate::datastore::LogicalDatastoreType;
use std::io;
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, DeferError>;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum DeferError {
    /// A deferred event could not be built (missing or inconsistent fields).
    #[error("Invalid deferred event: {message}")]
    InvalidState {
        /// What was missing or inconsistent.
        message: String,
    },

    /// Evaluating one event against one notification failed.
    #[error("Failed to resolve {target} for event {key}: {message}")]
    Resolution {
        /// Key of the deferred event.
        key: String,
        /// Dependency target being resolved.
        target: String,
        /// Error message.
        message: String,
    },

    /// The wildcard subscription could not be established.
    #[error("Listener registration for {pattern} in {store} failed after {attempts} attempts")]
    Registration {
        /// The wildcard pattern.
        pattern: String,
        /// The logical store.
        store: LogicalDatastoreType,
        /// Number of attempts made.
        attempts: u32,
    },

    /// A datastore read or subscription failed.
    #[error("Datastore {operation} failed: {message}")]
    Store {
        /// The operation that failed (e.g., "read", "register").
        operation: String,
        /// Error message.
        message: String,
    },

    /// An identifier string could not be parsed.
    #[error("Invalid identifier '{input}': {message}")]
    InvalidIdentifier {
        /// The rejected input.
        input: String,
        /// Error message.
        message: String,
    },

    /// Configuration validation error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl DeferError {
    /// Creates a construction error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Creates a resolution error.
    pub fn resolution(
        key: impl ToString,
        target: impl ToString,
        message: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            key: key.to_string(),
            target: target.to_string(),
            message: message.into(),
        }
    }

    /// Creates a datastore error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an identifier parse error.
    pub fn invalid_identifier(input: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            input: input.into(),
            message: message.into(),
        }
    }

    /// Returns true if the failure is transient and the operation may
    /// succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeferError::Store { .. } | DeferError::Registration { .. })
    }
}
