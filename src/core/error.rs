//! Error types for the terrain cache

use std::sync::Arc;

use thiserror::Error;

/// Main error type for the crate
///
/// Cloneable so a single load result can be handed to every waiter of a
/// shared load.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Stored or received data failed validation. Never repaired in place.
    #[error("Corrupted data: {0}")]
    Corrupted(String),

    /// The operation was cancelled (eviction or shutdown).
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    /// Internal state that the selection algorithm should never produce.
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Cancellation is expected during eviction and shutdown and is not
    /// reported as a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_corrupted(&self) -> bool {
        matches!(self, Error::Corrupted(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Config(err.to_string())
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, Error>;
