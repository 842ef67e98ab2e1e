//! Error types for the restore map phase

use thiserror::Error;

/// Result type for restore operations
pub type Result<T> = std::result::Result<T, RestoreError>;

/// Restore map phase errors
#[derive(Error, Debug)]
pub enum RestoreError {
    /// Invalid restore request (zero restore timestamp, bad location, …)
    #[error("invalid restore request: {0}")]
    Config(String),

    /// Error from quiver-db-core while decoding records or keys
    #[error("decode error: {0}")]
    Core(#[from] quiver_db_core::Error),

    /// A record or frame failed to decode
    #[error("decode error: {0}")]
    Decode(String),

    /// A manifest names a compression scheme we do not understand
    #[error("unknown backup compression: {0}")]
    UnknownCompression(String),

    /// I/O error from the archive stream or the map files
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error surfaced by the live store while banning a namespace
    #[error("live store error: {0}")]
    Store(String),

    /// The phase was cancelled because a sibling task failed
    #[error("restore map phase cancelled")]
    Cancelled,
}

impl RestoreError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        RestoreError::Config(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        RestoreError::Decode(msg.into())
    }

    /// Create a live store error
    pub fn store(msg: impl Into<String>) -> Self {
        RestoreError::Store(msg.into())
    }

    /// Whether this is the cancellation sentinel rather than a root cause.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RestoreError::Cancelled)
    }
}
