//! Session identity and lifecycle state

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Stable session identifier, independent of the wire index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08X}", self.0)
    }
}

/// Lowest and highest index handed out by a server
pub const MIN_SESSION_INDEX: u16 = 1;
pub const MAX_SESSION_INDEX: u16 = 65534;

/// Server-assigned 16-bit index carried in every data datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionIndex(pub u16);

impl SessionIndex {
    pub const fn value(&self) -> u16 {
        self.0
    }

    pub const fn is_assignable(&self) -> bool {
        self.0 >= MIN_SESSION_INDEX && self.0 <= MAX_SESSION_INDEX
    }
}

impl fmt::Display for SessionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u16> for SessionIndex {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum SessionState {
    #[default]
    Init = 0,
    /// Handshake in progress
    Negotiating = 1,
    /// Pipelines running
    Connected = 2,
    /// Heartbeat timed out; waiting for reconnect or teardown
    NotReady = 3,
    /// Torn down; terminal
    Closed = 4,
}

impl SessionState {
    pub const fn can_transfer_data(&self) -> bool {
        matches!(self, SessionState::Connected)
    }

    pub const fn is_finished(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Whether `self -> to` is a legal edge
    pub const fn can_transition_to(&self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Init, Negotiating)
                | (Negotiating, Connected)
                | (Negotiating, Init)
                | (Connected, NotReady)
                | (NotReady, Negotiating)
                | (NotReady, Connected)
                | (Init, Closed)
                | (Negotiating, Closed)
                | (Connected, Closed)
                | (NotReady, Closed)
        )
    }

    const fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Negotiating,
            2 => SessionState::Connected,
            3 => SessionState::NotReady,
            4 => SessionState::Closed,
            _ => SessionState::Init,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Init => write!(f, "INIT"),
            SessionState::Negotiating => write!(f, "NEGOTIATING"),
            SessionState::Connected => write!(f, "CONNECTED"),
            SessionState::NotReady => write!(f, "NOT_READY"),
            SessionState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Session state shared between tasks
#[derive(Debug, Default)]
pub struct AtomicSessionState(AtomicU8);

impl AtomicSessionState {
    pub fn new(state: SessionState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `to` if the edge is legal, returning the previous state
    pub fn transition(&self, to: SessionState) -> crate::Result<SessionState> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current);
            if !from.can_transition_to(to) {
                return Err(crate::Error::InvalidStateTransition { from, to });
            }
            match self
                .0
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}
