//! Error types for tnl-tun

use std::io;
use thiserror::Error;

/// Result type alias for tnl-tun operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving the virtual interface
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("device creation error: {0}")]
    DeviceCreation(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("route error: {0}")]
    Route(String),

    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// A read or write after `close`
    #[error("interface {0} is closed")]
    Closed(String),

    /// Frame too short to carry the platform prefix
    #[error("bad frame: {0}")]
    Framing(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
    }
}

impl From<Error> for tnl_protocol::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => tnl_protocol::Error::Io(e),
            Error::Config(msg) | Error::InvalidPrefix(msg) => tnl_protocol::Error::InvalidConfig(msg),
            Error::Framing(msg) => tnl_protocol::Error::Malformed(msg),
            other => tnl_protocol::Error::Transport(other.to_string()),
        }
    }
}
