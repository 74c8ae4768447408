//! One live client tunnel
//!
//! A [`ClientSession`] owns the sealer, data socket and translation tables of
//! a single negotiated session. The interface is borrowed: a reconnect builds
//! a new session around the same NIC.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tnl_protocol::{
    heartbeat, AtomicSessionState, DatagramSocket, HostStats, NatMaps, PortMappers, Sealer,
    ServerPing, SessionId, SessionIndex, SessionState, VirtualNic,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::control_plane::ServerInfo;
use crate::error::{Error, Result};
use crate::handshake::LanInfo;
use crate::negotiator::Negotiated;
use crate::stats::SharedStatsRef;

/// LAN routing of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VplRoute {
    pub lan: LanInfo,
    /// Our lease on the LAN
    pub lease: Ipv4Addr,
}

impl VplRoute {
    pub fn is_vpl(&self, addr: Ipv4Addr) -> bool {
        self.lan.is_vpl(addr)
    }
}

/// Address and port translation state shared by both pipelines
pub struct Translator {
    /// Server public address; source of every Internet-bound packet
    pub server_ip: Ipv4Addr,
    /// Local interface address; destination of every LAN reply
    pub local_ip: Ipv4Addr,
    /// Absent when the session holds no port slot
    pub ports: Option<PortMappers>,
    pub nat: NatMaps,
    pub vpl: Option<VplRoute>,
    /// Rewrite outbound bare RST to ACK|RST
    pub normalize_rst: bool,
}

impl Translator {
    pub fn is_vpl(&self, addr: Ipv4Addr) -> bool {
        self.vpl.is_some_and(|v| v.is_vpl(addr))
    }

    /// Build the tables for a negotiated session
    pub fn from_negotiated(negotiated: &Negotiated, local_ip: Ipv4Addr, normalize_rst: bool) -> Self {
        let params = &negotiated.params;
        let ports = params.port_range().map(|range| {
            PortMappers::with_epoch(range, params.dns_servers.clone(), Instant::now().into_std())
        });
        let vpl = match (params.lan, params.dhcp.as_ref()) {
            (Some(lan), Some(lease)) => Some(VplRoute {
                lan,
                lease: lease.ip,
            }),
            _ => None,
        };
        Self {
            server_ip: params.interface_ip,
            local_ip,
            ports,
            nat: NatMaps::new(params.networks.clone()),
            vpl,
            normalize_rst,
        }
    }
}

/// Why a session's tasks stopped
#[derive(Debug)]
pub enum ExitReason {
    /// A pipeline hit an error it cannot recover from
    Failed(Error),
    /// No server ping within the liveness window
    HeartbeatTimeout,
}

/// Sent on the monitor channel when a session task ends abnormally
#[derive(Debug)]
pub struct SessionExit {
    pub tag: String,
    pub id: SessionId,
    pub task: &'static str,
    pub reason: ExitReason,
}

pub struct ClientSession {
    pub id: SessionId,
    pub tag: String,
    pub index: SessionIndex,
    pub(crate) sealer: Arc<Sealer>,
    pub(crate) socket: Arc<dyn DatagramSocket>,
    pub(crate) nic: Arc<dyn VirtualNic>,
    pub(crate) server: ServerInfo,
    pub(crate) translator: Translator,
    pub(crate) stats: SharedStatsRef,
    state: AtomicSessionState,
    ping_counter: AtomicU64,
    last_ping_at: Mutex<Instant>,
    server_stats: Mutex<HostStats>,
    latency_micros: AtomicU64,
    closed: watch::Sender<bool>,
}

impl ClientSession {
    pub fn new(
        tag: &str,
        negotiated: Negotiated,
        nic: Arc<dyn VirtualNic>,
        normalize_rst: bool,
        stats: SharedStatsRef,
    ) -> Arc<Self> {
        let translator = Translator::from_negotiated(&negotiated, nic.info().address, normalize_rst);
        let state = AtomicSessionState::new(SessionState::Negotiating);
        Arc::new(Self {
            id: SessionId::random(),
            tag: tag.to_string(),
            index: negotiated.index,
            sealer: negotiated.sealer,
            socket: negotiated.socket,
            nic,
            server: negotiated.server,
            translator,
            stats,
            state,
            ping_counter: AtomicU64::new(0),
            last_ping_at: Mutex::new(Instant::now()),
            server_stats: Mutex::new(HostStats::default()),
            latency_micros: AtomicU64::new(0),
            closed: watch::channel(false).0,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state.load()
    }

    /// Move to `to`, returning the previous state
    pub fn transition(&self, to: SessionState) -> Result<SessionState> {
        Ok(self.state.transition(to)?)
    }

    pub fn server(&self) -> &ServerInfo {
        &self.server
    }

    pub fn nic(&self) -> &Arc<dyn VirtualNic> {
        &self.nic
    }

    pub fn translator(&self) -> &Translator {
        &self.translator
    }

    pub fn vpl_ip(&self) -> Option<Ipv4Addr> {
        self.translator.vpl.map(|v| v.lease)
    }

    pub(crate) fn next_ping_counter(&self) -> u64 {
        self.ping_counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn last_ping_at(&self) -> Instant {
        *self.last_ping_at.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a server heartbeat
    pub(crate) fn on_server_ping(&self, payload: &[u8]) {
        *self.last_ping_at.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        let ping = ServerPing::decode(payload);
        *self.server_stats.lock().unwrap_or_else(|e| e.into_inner()) = ping.stats;
        if payload.len() >= heartbeat::SERVER_PING_LEN {
            if let Some(latency) = ping.latency_micros(heartbeat::unix_micros()) {
                self.latency_micros.store(latency, Ordering::Relaxed);
            }
        }
        log::trace!("[{}] server ping {:?}", self.tag, ping.stats);
    }

    pub fn server_stats(&self) -> HostStats {
        *self.server_stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Last measured one-way delay from the server, in microseconds
    pub fn latency_micros(&self) -> u64 {
        self.latency_micros.load(Ordering::Relaxed)
    }

    /// Receiver that flips to `true` once the session closes
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Stop every task of this session; true only for the first call
    pub fn close(&self) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        let _ = self.state.transition(SessionState::Closed);
        if let Some(ports) = &self.translator.ports {
            ports.clear();
        }
        self.translator.nat.clear();
        log::debug!("[{}] session {} closed", self.tag, self.index);
        true
    }

    /// Spawn the pipelines, heartbeat and sweeper; failures go to `monitor`
    pub fn start(self: &Arc<Self>, send_stats: bool, monitor: mpsc::UnboundedSender<SessionExit>) {
        spawn_task(self, "egress", monitor.clone(), super::egress::run(self.clone()));
        spawn_task(self, "ingress", monitor.clone(), super::ingress::run(self.clone()));
        spawn_task(
            self,
            "heartbeat",
            monitor,
            crate::heartbeat::run_client(self.clone(), send_stats),
        );
        if self.translator.ports.is_some() {
            tokio::spawn(crate::heartbeat::run_sweeper(self.clone()));
        }
    }
}

/// Run a session task and report how it ended
fn spawn_task<F>(
    session: &Arc<ClientSession>,
    task: &'static str,
    monitor: mpsc::UnboundedSender<SessionExit>,
    fut: F,
) where
    F: std::future::Future<Output = Result<Option<ExitReason>>> + Send + 'static,
{
    let tag = session.tag.clone();
    let id = session.id;
    tokio::spawn(async move {
        let reason = match fut.await {
            Ok(None) => return,
            Ok(Some(reason)) => reason,
            Err(e) => ExitReason::Failed(e),
        };
        log::debug!("[{}] {} task stopped: {:?}", tag, task, reason);
        let _ = monitor.send(SessionExit {
            tag,
            id,
            task,
            reason,
        });
    });
}
