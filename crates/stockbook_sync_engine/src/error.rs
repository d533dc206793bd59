//! Error types for the sync engine.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// None of these escape the engine's cycle entry points; every error
/// is captured into [`crate::SyncStatus`] instead. The taxonomy matters
/// because only network-class failures drive pull backoff and retries.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Missing or malformed configuration. Fatal: the engine starts
    /// disabled and performs no network activity.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network-class failure: timeout, abort, or connection failure.
    /// Recoverable; retried with bounded attempts and counted by the
    /// pull backoff controller.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the call exceeded its bounded timeout.
        timed_out: bool,
    },

    /// Application-level query failure (rejected write, malformed
    /// response). Recoverable but not retried within the cycle.
    #[error("query error: {0}")]
    Query(String),

    /// Remote payload failed to normalize during merge. The merge is
    /// all-or-nothing, so local state is left untouched.
    #[error("merge error: {0}")]
    Merge(String),

    /// Device state store failure.
    #[error("state store error: {0}")]
    Store(String),
}

impl SyncError {
    /// Creates a network-class error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            timed_out: false,
        }
    }

    /// Creates a network-class timeout error.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            timed_out: true,
        }
    }

    /// Returns true for network-class failures (as opposed to
    /// application-level errors).
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network { .. })
    }
}
