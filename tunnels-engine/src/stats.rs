//! Lock-free traffic counters
//!
//! The packet path never reports errors upward for a single packet; it drops
//! it and bumps the matching [`DropReason`] counter instead.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    NonIpv4,
    UnsupportedProto,
    Malformed,
    NoMapping,
    /// No mapped port left for the flow
    Exhausted,
    Replay,
    Firewall,
    /// Per-session queue full
    ChannelFull,
    /// Datagram or packet for an unknown session
    NoSession,
    /// Internet or local-network access denied
    Policy,
}

impl DropReason {
    const ALL: [DropReason; 10] = [
        DropReason::NonIpv4,
        DropReason::UnsupportedProto,
        DropReason::Malformed,
        DropReason::NoMapping,
        DropReason::Exhausted,
        DropReason::Replay,
        DropReason::Firewall,
        DropReason::ChannelFull,
        DropReason::NoSession,
        DropReason::Policy,
    ];

    /// Drop reason for a non-fatal protocol error
    pub fn from_protocol(err: &tnl_protocol::Error) -> Option<Self> {
        use tnl_protocol::Error as P;
        Some(match err {
            P::NotIpv4(_) => DropReason::NonIpv4,
            P::UnsupportedProtocol(_) => DropReason::UnsupportedProto,
            P::PacketTooShort { .. } | P::Malformed(_) => DropReason::Malformed,
            P::NoMapping => DropReason::NoMapping,
            P::Exhausted(_) => DropReason::Exhausted,
            P::Replay(_) => DropReason::Replay,
            _ => return None,
        })
    }

    fn slot(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::NonIpv4 => "non_ipv4",
            DropReason::UnsupportedProto => "unsupported_proto",
            DropReason::Malformed => "malformed",
            DropReason::NoMapping => "no_mapping",
            DropReason::Exhausted => "exhausted",
            DropReason::Replay => "replay",
            DropReason::Firewall => "firewall",
            DropReason::ChannelFull => "channel_full",
            DropReason::NoSession => "no_session",
            DropReason::Policy => "policy",
        }
    }
}

/// Per-reason drop counters
#[derive(Debug, Default)]
pub struct PipelineCounters {
    drops: [AtomicU64; 10],
}

impl PipelineCounters {
    pub fn record(&self, reason: DropReason) {
        self.drops[reason.slot()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, reason: DropReason) -> u64 {
        self.drops[reason.slot()].load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.drops.iter().map(|d| d.load(Ordering::Relaxed)).sum()
    }

    /// Non-zero counters by name
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        DropReason::ALL
            .iter()
            .map(|r| (r.as_str(), self.get(*r)))
            .filter(|(_, n)| *n > 0)
            .collect()
    }
}

/// Shared statistics updated from the packet path
#[derive(Debug, Default)]
pub struct SharedStats {
    pub bytes_rx: AtomicU64,
    pub bytes_tx: AtomicU64,
    pub packets_rx: AtomicU64,
    pub packets_tx: AtomicU64,
    pub active_sessions: AtomicUsize,
    pub drops: PipelineCounters,
}

impl SharedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record received bytes
    pub fn record_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
    }

    /// Record transmitted bytes
    pub fn record_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.drops.record(reason);
    }

    pub fn set_active_sessions(&self, count: usize) {
        self.active_sessions.store(count, Ordering::Relaxed);
    }

    /// Get a snapshot of current stats
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            drops: self.drops.snapshot(),
        }
    }
}

/// Snapshot of stats at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_rx: u64,
    pub bytes_tx: u64,
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub active_sessions: usize,
    pub drops: Vec<(&'static str, u64)>,
}

impl StatsSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_rx + self.bytes_tx
    }
}

/// Reference to shared stats
pub type SharedStatsRef = Arc<SharedStats>;
