//! Tunnel events and their handlers

use std::net::{Ipv4Addr, SocketAddr};

use tnl_protocol::{SessionIndex, SessionState};
use tokio::sync::mpsc;

/// Events emitted by the client and server engines
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Session state changed (client)
    StateChanged {
        tag: String,
        old: SessionState,
        new: SessionState,
    },

    /// Tunnel is up (client)
    Connected {
        tag: String,
        index: SessionIndex,
        /// Local interface address
        interface_ip: Ipv4Addr,
        /// VPL lease, when the server assigned one
        vpl_ip: Option<Ipv4Addr>,
    },

    /// Tunnel is gone (client)
    Disconnected { tag: String, reason: String },

    /// A client finished the handshake (server)
    ClientConnected {
        index: SessionIndex,
        peer: Option<SocketAddr>,
        vpl_ip: Option<Ipv4Addr>,
    },

    /// A client session was torn down (server)
    ClientDisconnected { index: SessionIndex, reason: String },

    Error {
        message: String,
        /// Whether the error is recoverable
        recoverable: bool,
    },
}

impl EngineEvent {
    pub(crate) fn error(err: &crate::Error) -> Self {
        EngineEvent::Error {
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }
}

/// Event handler trait for receiving engine events
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn on_event(&self, event: EngineEvent);
}

/// Simple event handler that logs events
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingEventHandler {
    async fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::StateChanged { tag, old, new } => {
                log::info!("[{}] state: {:?} -> {:?}", tag, old, new);
            }
            EngineEvent::Connected {
                tag,
                index,
                interface_ip,
                vpl_ip,
            } => match vpl_ip {
                Some(vpl) => log::info!(
                    "[{}] connected: index={}, interface={}, vpl={}",
                    tag,
                    index,
                    interface_ip,
                    vpl
                ),
                None => log::info!(
                    "[{}] connected: index={}, interface={}",
                    tag,
                    index,
                    interface_ip
                ),
            },
            EngineEvent::Disconnected { tag, reason } => {
                log::info!("[{}] disconnected: {}", tag, reason);
            }
            EngineEvent::ClientConnected { index, peer, vpl_ip } => {
                log::info!(
                    "Client connected: index={}, peer={:?}, vpl={:?}",
                    index,
                    peer,
                    vpl_ip
                );
            }
            EngineEvent::ClientDisconnected { index, reason } => {
                log::info!("Client disconnected: index={}, reason={}", index, reason);
            }
            EngineEvent::Error {
                message,
                recoverable,
            } => {
                if recoverable {
                    log::warn!("Recoverable error: {}", message);
                } else {
                    log::error!("Error: {}", message);
                }
            }
        }
    }
}

/// Forwards events into an unbounded channel
pub struct ChannelEventHandler {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait::async_trait]
impl EventHandler for ChannelEventHandler {
    async fn on_event(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
