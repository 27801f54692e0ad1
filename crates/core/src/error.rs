//! Error types for the Ember core crate.

use thiserror::Error;

/// Errors raised by core primitives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// I/O error with context
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Malformed digest
    #[error("Invalid digest: {digest}")]
    InvalidDigest { digest: String },

    /// Background worker is gone
    #[error("Worker unavailable: {reason}")]
    WorkerUnavailable { reason: String },
}

impl CoreError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new invalid digest error
    pub fn invalid_digest<S: Into<String>>(digest: S) -> Self {
        Self::InvalidDigest {
            digest: digest.into(),
        }
    }

    /// Create a new worker unavailable error
    pub fn worker_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::WorkerUnavailable {
            reason: reason.into(),
        }
    }
}

/// Result type for core operations
pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        CoreError::io(error.to_string())
    }
}
