//! State shared by every server task

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tnl_protocol::{BufferPool, SessionIndex, SlotTable, VplSwitch};
use tokio::time::Instant;

use super::raw::RawSender;
use super::registry::SessionRegistry;
use super::session::ServerSession;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::event::{EngineEvent, EventHandler};
use crate::stats::SharedStatsRef;

/// Idle buffers kept for the packet path
const POOL_SIZE: usize = 4096;

/// Unconnected datagram socket on the data port
#[async_trait]
pub trait ServerDatagram: Send + Sync {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}

#[async_trait]
impl ServerDatagram for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, addr)
            .await
            .map_err(|e| Error::Transport(format!("udp send to {}: {}", addr, e)))
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf)
            .await
            .map_err(|e| Error::Transport(format!("udp recv: {}", e)))
    }
}

pub struct ServerContext {
    pub config: Arc<ServerConfig>,
    pub registry: SessionRegistry,
    pub slots: Arc<SlotTable<ServerSession>>,
    pub vpl: VplSwitch<ServerSession>,
    pub pool: BufferPool,
    pub stats: SharedStatsRef,
    pub socket: Arc<dyn ServerDatagram>,
    pub raw: Arc<dyn RawSender>,
    pub events: Arc<dyn EventHandler>,
}

impl ServerContext {
    pub fn new(
        config: Arc<ServerConfig>,
        socket: Arc<dyn ServerDatagram>,
        raw: Arc<dyn RawSender>,
        events: Arc<dyn EventHandler>,
        stats: SharedStatsRef,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let slots = Arc::new(SlotTable::new(config.slot_layout()?));
        let vpl = VplSwitch::new(config.lan_cidr, config.lease_timeout())
            .map_err(|e| Error::BadInput(e.to_string()))?;
        let pool = BufferPool::new(POOL_SIZE, tnl_protocol::IFACE_BUFSIZE);
        Ok(Arc::new(Self {
            config,
            registry: SessionRegistry::new(),
            slots,
            vpl,
            pool,
            stats,
            socket,
            raw,
            events,
        }))
    }

    pub fn session(&self, index: SessionIndex) -> Option<Arc<ServerSession>> {
        self.registry.get(index)
    }

    /// Release everything `index` holds; false if it was already gone
    pub async fn teardown(&self, index: SessionIndex, reason: &str) -> bool {
        let Some(session) = self.registry.release(index) else {
            return false;
        };
        if !session.close() {
            return false;
        }
        if let Some((slot, _)) = session.slot() {
            self.slots.release(slot);
        }
        if let Some(lease) = &session.lease {
            // The address may already belong to this device's newer session
            let held = self.vpl.lookup(lease.ip);
            if held.map_or(true, |h| Arc::ptr_eq(&h, &session)) {
                self.vpl.release(lease.ip);
            }
        }
        self.stats.set_active_sessions(self.registry.len());
        log::info!(
            "Session {} ({}) closed: {}",
            index,
            session.grant.user_id,
            reason
        );
        self.events
            .on_event(EngineEvent::ClientDisconnected {
                index,
                reason: reason.to_string(),
            })
            .await;
        true
    }

    /// Sessions whose last client ping is older than the idle timeout
    pub fn idle_sessions_at(&self, now: Instant) -> Vec<SessionIndex> {
        let timeout = self.config.idle_timeout();
        self.registry
            .sessions()
            .into_iter()
            .filter(|s| now.saturating_duration_since(s.last_ping_at()) > timeout)
            .map(|s| s.index)
            .collect()
    }

    /// Tear down every live session
    pub async fn teardown_all(&self, reason: &str) {
        for session in self.registry.sessions() {
            self.teardown(session.index, reason).await;
        }
    }
}
