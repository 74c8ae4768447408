//! Error types for the tunnels wire protocol

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while framing, sealing or rewriting packets
#[derive(Debug, Error)]
pub enum Error {
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    #[error("not an IPv4 packet (version {0})")]
    NotIpv4(u8),

    #[error("unsupported transport protocol {0}")]
    UnsupportedProtocol(u8),

    #[error("malformed packet: {0}")]
    Malformed(String),

    /// AEAD tag mismatch. Fatal to the session.
    #[error("authentication failed")]
    AuthFailed,

    #[error("replayed or stale nonce {0}")]
    Replay(u64),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("key exchange error: {0}")]
    KeyExchange(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("unknown encryption type: {0}")]
    UnknownEncType(String),

    #[error("no free {0}")]
    Exhausted(&'static str),

    #[error("no port mapping for flow")]
    NoMapping,

    #[error("invalid session state transition from {from} to {to}")]
    InvalidStateTransition {
        from: crate::SessionState,
        to: crate::SessionState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors that must tear the session down
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::AuthFailed | Error::Transport(_) | Error::Io(_))
    }

    /// Errors that only drop the offending packet
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            Error::PacketTooShort { .. }
                | Error::NotIpv4(_)
                | Error::UnsupportedProtocol(_)
                | Error::Malformed(_)
                | Error::Replay(_)
                | Error::Exhausted(_)
                | Error::NoMapping
        )
    }
}
