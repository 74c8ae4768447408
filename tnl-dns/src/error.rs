//! Error types for DNS operations

use thiserror::Error;

/// Result type alias for DNS operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed query or response
    #[error("DNS error: {0}")]
    Dns(String),

    #[error("DNS configuration error: {0}")]
    Config(String),

    /// Every configured upstream failed
    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("DNS query timed out")]
    Timeout,

    /// Blocklist download failed
    #[error("blocklist fetch failed: {0}")]
    Fetch(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<hickory_proto::ProtoError> for Error {
    fn from(err: hickory_proto::ProtoError) -> Self {
        Error::Dns(err.to_string())
    }
}
