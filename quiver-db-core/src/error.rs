//! Error types for quiver-db-core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// A key did not parse as a native or backup key
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// A namespaced attribute string did not follow the `<ns hex>-<name>` form
    #[error("malformed attribute: {0}")]
    MalformedAttr(String),

    /// A wire-format record failed to decode
    #[error("decode error: {0}")]
    Decode(String),
}

impl Error {
    /// Create a malformed key error
    pub fn malformed_key(msg: impl Into<String>) -> Self {
        Error::MalformedKey(msg.into())
    }

    /// Create a malformed attribute error
    pub fn malformed_attr(msg: impl Into<String>) -> Self {
        Error::MalformedAttr(msg.into())
    }

    /// Create a decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Error::Decode(msg.into())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Decode(e.to_string())
    }
}
