//! Error types for the tunnels engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used for recovery decisions and API status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Tag mismatch or bad signature
    Auth,
    /// UDP or TLS dial/write failure
    Transport,
    /// Handshake step or heartbeat deadline passed
    Timeout,
    /// No free index, slot or queue space
    Congestion,
    /// Host capability check failed
    Permission,
    /// Malformed packet or invalid configuration
    BadInput,
    /// Unknown server or session
    NotFound,
    /// DHCP exhausted, duplicate tag, negotiation already running
    Conflict,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Transport => "transport",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Congestion => "congestion",
            ErrorKind::Permission => "permission",
            ErrorKind::BadInput => "bad input",
            ErrorKind::NotFound => "not found",
            ErrorKind::Conflict => "conflict",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while negotiating or running tunnels
#[derive(Debug, Error)]
pub enum Error {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("congestion: {0}")]
    Congestion(String),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Engine was asked to stop
    #[error("shutting down")]
    Shutdown,

    #[error("protocol error: {0}")]
    Protocol(#[from] tnl_protocol::Error),

    #[error("TUN error: {0}")]
    Tun(#[from] tnl_tun::Error),

    #[error("DNS error: {0}")]
    Dns(#[from] tnl_dns::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use tnl_protocol::Error as P;
        match self {
            Error::Auth(_) => ErrorKind::Auth,
            Error::Transport(_) | Error::Shutdown => ErrorKind::Transport,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Congestion(_) => ErrorKind::Congestion,
            Error::Permission(_) => ErrorKind::Permission,
            Error::BadInput(_) | Error::Json(_) | Error::ConfigParse(_) => ErrorKind::BadInput,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Protocol(e) => match e {
                P::AuthFailed | P::BadSignature | P::KeyExchange(_) | P::Encryption(_) => {
                    ErrorKind::Auth
                }
                P::Exhausted(_) => ErrorKind::Congestion,
                P::Transport(_) | P::Io(_) => ErrorKind::Transport,
                P::InvalidStateTransition { .. } => ErrorKind::Conflict,
                _ => ErrorKind::BadInput,
            },
            Error::Tun(e) if e.is_permission_denied() => ErrorKind::Permission,
            Error::Tun(tnl_tun::Error::Config(_) | tnl_tun::Error::InvalidPrefix(_)) => {
                ErrorKind::BadInput
            }
            Error::Tun(_) => ErrorKind::Transport,
            Error::Dns(tnl_dns::Error::Timeout) => ErrorKind::Timeout,
            Error::Dns(tnl_dns::Error::Config(_)) => ErrorKind::BadInput,
            Error::Dns(_) => ErrorKind::Transport,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::InvalidData | std::io::ErrorKind::InvalidInput => {
                    ErrorKind::BadInput
                }
                _ => ErrorKind::Transport,
            },
        }
    }

    /// Worth retrying after a backoff
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
            && !matches!(self, Error::Shutdown)
    }

    /// Must tear the session down
    pub fn is_fatal_to_session(&self) -> bool {
        self.kind() == ErrorKind::Auth
    }

    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::ConfigParse(_) | Error::Json(_))
            || (self.kind() == ErrorKind::BadInput && !matches!(self, Error::Protocol(_)))
    }
}
