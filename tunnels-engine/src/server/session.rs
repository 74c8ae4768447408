//! Server-side view of one client

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tnl_protocol::{
    HostStats, LanFirewall, PooledBuffer, PortRange, Sealer, SessionId, SessionIndex, VplLease,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::handshake::SessionGrant;
use crate::stats::{DropReason, SharedStatsRef};

/// Minimum gap between two "channel full" warnings of one session
const FULL_WARN_INTERVAL: Duration = Duration::from_secs(1);

/// Receiving halves of the session queues, taken by the fan-out tasks
pub(crate) struct Queues {
    pub from_user: mpsc::Receiver<PooledBuffer>,
    pub to_user: mpsc::Receiver<PooledBuffer>,
}

pub struct ServerSession {
    pub index: SessionIndex,
    pub id: SessionId,
    pub grant: SessionGrant,
    /// Bypasses the LAN firewall
    pub net_admin: bool,
    pub lease: Option<VplLease>,
    pub firewall: LanFirewall,
    pub(crate) sealer: Sealer,
    slot: OnceLock<(usize, PortRange)>,
    peer: ArcSwapOption<SocketAddr>,
    from_user: mpsc::Sender<PooledBuffer>,
    to_user: mpsc::Sender<PooledBuffer>,
    queues: Mutex<Option<Queues>>,
    last_ping_at: Mutex<Instant>,
    client_stats: Mutex<HostStats>,
    last_full_warn: Mutex<Option<Instant>>,
    closed: watch::Sender<bool>,
    stats: SharedStatsRef,
}

impl ServerSession {
    pub fn new(
        index: SessionIndex,
        grant: SessionGrant,
        sealer: Sealer,
        lease: Option<VplLease>,
        net_admin: bool,
        channel_depth: usize,
        stats: SharedStatsRef,
    ) -> Arc<Self> {
        let (from_user, from_user_rx) = mpsc::channel(channel_depth.max(1));
        let (to_user, to_user_rx) = mpsc::channel(channel_depth.max(1));
        Arc::new(Self {
            index,
            id: SessionId::random(),
            grant,
            net_admin,
            lease,
            firewall: LanFirewall::new(),
            sealer,
            slot: OnceLock::new(),
            peer: ArcSwapOption::empty(),
            from_user,
            to_user,
            queues: Mutex::new(Some(Queues {
                from_user: from_user_rx,
                to_user: to_user_rx,
            })),
            last_ping_at: Mutex::new(Instant::now()),
            client_stats: Mutex::new(HostStats::default()),
            last_full_warn: Mutex::new(None),
            closed: watch::channel(false).0,
            stats,
        })
    }

    pub fn slot(&self) -> Option<(usize, PortRange)> {
        self.slot.get().copied()
    }

    pub(crate) fn set_slot(&self, slot: usize, range: PortRange) {
        let _ = self.slot.set((slot, range));
    }

    /// Client's UDP address, known after its first authenticated datagram
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer.load().as_deref().copied()
    }

    /// Record where the client's datagrams come from; follows NAT rebinding
    pub fn set_peer(&self, addr: SocketAddr) {
        if self.peer() != Some(addr) {
            log::debug!("Session {} peer is {}", self.index, addr);
            self.peer.store(Some(Arc::new(addr)));
        }
    }

    pub(crate) fn take_queues(&self) -> Option<Queues> {
        self.queues.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn on_client_ping(&self, stats: HostStats) {
        *self.last_ping_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        *self.client_stats.lock().unwrap_or_else(|e| e.into_inner()) = stats;
    }

    pub fn last_ping_at(&self) -> Instant {
        *self.last_ping_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn client_stats(&self) -> HostStats {
        *self.client_stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue an opened client packet; never blocks
    pub fn enqueue_from_user(&self, packet: PooledBuffer) -> bool {
        self.offer(&self.from_user, packet, "from-user")
    }

    /// Queue a packet bound for the client; never blocks
    pub fn enqueue_to_user(&self, packet: PooledBuffer) -> bool {
        self.offer(&self.to_user, packet, "to-user")
    }

    fn offer(&self, queue: &mpsc::Sender<PooledBuffer>, packet: PooledBuffer, name: &str) -> bool {
        match queue.try_send(packet) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.record_drop(DropReason::ChannelFull);
                self.warn_full(name);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.record_drop(DropReason::NoSession);
                false
            }
        }
    }

    fn warn_full(&self, name: &str) {
        let now = Instant::now();
        let mut last = self.last_full_warn.lock().unwrap_or_else(|e| e.into_inner());
        if last.is_some_and(|at| now.duration_since(at) < FULL_WARN_INTERVAL) {
            return;
        }
        *last = Some(now);
        log::warn!("Session {} {} channel full, dropping packets", self.index, name);
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Mark closed; true only for the first call
    pub(crate) fn close(&self) -> bool {
        !self.closed.send_replace(true)
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("index", &self.index)
            .field("id", &self.id)
            .field("user", &self.grant.user_id)
            .field("peer", &self.peer())
            .field("lease", &self.lease.as_ref().map(|l| l.ip))
            .finish_non_exhaustive()
    }
}

/// Session with throwaway keys
#[cfg(test)]
pub(crate) fn test_session(index: u16, depth: usize) -> Arc<ServerSession> {
    use tnl_protocol::{kex, EncType, Role};

    let client = kex::ClientHandshake::new();
    let (_, keys) = kex::respond(&client.offer()).unwrap();
    let sealer = Sealer::new(index, EncType::Chacha20Poly1305, &keys, Role::Server).unwrap();
    ServerSession::new(
        SessionIndex(index),
        SessionGrant {
            user_id: "u1".into(),
            device_token: "dev".into(),
            server_id: "s1".into(),
            enc_type: EncType::Chacha20Poly1305,
            requesting_ports: true,
            expires_at: chrono::Utc::now(),
        },
        sealer,
        None,
        false,
        depth,
        Arc::new(crate::stats::SharedStats::new()),
    )
}
