//! Heartbeat payloads
//!
//! Any opened plaintext shorter than 20 bytes is a heartbeat. Layouts:
//!
//! ```text
//! client -> server (12): [reserved][cpu][mem][disk][counter u64 BE]
//! server -> client (11): [cpu][mem][disk][server_ts u64 BE]
//! ```
//!
//! The first ping after connect carries an empty payload.

use std::time::{SystemTime, UNIX_EPOCH};

pub const CLIENT_PING_LEN: usize = 12;
pub const SERVER_PING_LEN: usize = 11;

/// Host usage percentages carried in pings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HostStats {
    pub cpu: u8,
    pub mem: u8,
    pub disk: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPing {
    pub stats: HostStats,
    pub counter: u64,
}

impl ClientPing {
    pub fn encode(&self) -> [u8; CLIENT_PING_LEN] {
        let mut out = [0u8; CLIENT_PING_LEN];
        out[1] = self.stats.cpu;
        out[2] = self.stats.mem;
        out[3] = self.stats.disk;
        out[4..12].copy_from_slice(&self.counter.to_be_bytes());
        out
    }

    /// Decode what the server received. An empty or short ping yields zero
    /// stats; the counter is zero unless all 12 bytes are present.
    pub fn decode(payload: &[u8]) -> Self {
        let byte = |i: usize| payload.get(i).copied().unwrap_or(0);
        let counter = payload
            .get(4..12)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_be_bytes)
            .unwrap_or(0);
        Self {
            stats: HostStats {
                cpu: byte(1),
                mem: byte(2),
                disk: byte(3),
            },
            counter,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerPing {
    pub stats: HostStats,
    /// Microseconds since the Unix epoch when the server sent the ping
    pub server_ts: Option<u64>,
}

impl ServerPing {
    /// Ping stamped with the current wall clock
    pub fn now(stats: HostStats) -> Self {
        Self {
            stats,
            server_ts: Some(unix_micros()),
        }
    }

    pub fn encode(&self) -> [u8; SERVER_PING_LEN] {
        let mut out = [0u8; SERVER_PING_LEN];
        out[0] = self.stats.cpu;
        out[1] = self.stats.mem;
        out[2] = self.stats.disk;
        out[3..11].copy_from_slice(&self.server_ts.unwrap_or(0).to_be_bytes());
        out
    }

    pub fn decode(payload: &[u8]) -> Self {
        let byte = |i: usize| payload.get(i).copied().unwrap_or(0);
        let server_ts = payload
            .get(3..11)
            .and_then(|b| <[u8; 8]>::try_from(b).ok())
            .map(u64::from_be_bytes);
        Self {
            stats: HostStats {
                cpu: byte(0),
                mem: byte(1),
                disk: byte(2),
            },
            server_ts,
        }
    }

    /// Microseconds between the server stamp and `now_micros`
    pub fn latency_micros(&self, now_micros: u64) -> Option<u64> {
        self.server_ts.map(|ts| now_micros.saturating_sub(ts))
    }
}

/// Current wall clock in microseconds since the Unix epoch
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_ping_layout() {
        let ping = ClientPing {
            stats: HostStats {
                cpu: 10,
                mem: 20,
                disk: 30,
            },
            counter: 0x0102,
        };
        let bytes = ping.encode();
        assert_eq!(bytes, [0, 10, 20, 30, 0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(ClientPing::decode(&bytes), ping);
    }

    #[test]
    fn test_empty_ping() {
        let ping = ClientPing::decode(&[]);
        assert_eq!(ping.counter, 0);
        assert_eq!(ping.stats, HostStats::default());
        assert_eq!(ServerPing::decode(&[]).server_ts, None);
    }

    #[test]
    fn test_server_ping_latency() {
        let ping = ServerPing {
            stats: HostStats {
                cpu: 1,
                mem: 2,
                disk: 3,
            },
            server_ts: Some(1_000_000),
        };
        let decoded = ServerPing::decode(&ping.encode());
        assert_eq!(decoded.stats.disk, 3);
        assert_eq!(decoded.latency_micros(1_002_500), Some(2500));

        // Only stats present
        assert_eq!(ServerPing::decode(&[5, 6, 7]).latency_micros(10), None);
    }
}
