//! Abstract I/O seams of the data plane
//!
//! - [`VirtualNic`]: the local TUN interface (raw IPv4 packets in and out).
//! - [`DatagramSocket`]: a connected UDP socket carrying sealed frames.
//!
//! Pipelines only see these traits, so they run unchanged against a real
//! interface (`tnl-tun`) or the in-memory doubles in [`mock`].

pub mod mock;

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::error::{Error, Result};

/// Description of an opened interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicInfo {
    /// Interface name (e.g., "tun0", "utun3")
    pub name: String,
    pub mtu: u16,
    /// Local IPv4 address of the interface
    pub address: Ipv4Addr,
    pub prefix_len: u8,
}

/// Settings used to open a [`VirtualNic`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicConfig {
    pub name: Option<String>,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
}

impl Default for NicConfig {
    fn default() -> Self {
        Self {
            name: None,
            address: Ipv4Addr::new(10, 255, 0, 2),
            prefix_len: 24,
            mtu: crate::DEFAULT_MTU as u16,
        }
    }
}

/// A layer-3 virtual interface
///
/// `read` and `write` carry bare IPv4 packets; any platform framing is the
/// implementation's concern.
#[async_trait]
pub trait VirtualNic: Send + Sync {
    /// Read one packet the OS routed into the tunnel
    ///
    /// Cancel-safe. Returns an error once the interface is closed.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Hand one packet to the OS
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Route `net` through this interface
    async fn add_route(&self, net: Ipv4Net) -> Result<()>;

    fn set_mtu(&self, mtu: u16) -> Result<()>;

    /// Bring the interface down and wake pending reads
    async fn close(&self) -> Result<()>;

    fn info(&self) -> NicInfo;
}

/// Opens interfaces; the engine holds one so reconnects can reuse a NIC
#[async_trait]
pub trait NicFactory: Send + Sync {
    async fn open(&self, config: &NicConfig) -> Result<std::sync::Arc<dyn VirtualNic>>;
}

/// A connected datagram socket
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Cancel-safe
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    fn local_addr(&self) -> Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for tokio::net::UdpSocket {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        tokio::net::UdpSocket::send(self, buf)
            .await
            .map_err(|e| Error::Transport(format!("udp send: {}", e)))
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        tokio::net::UdpSocket::recv(self, buf)
            .await
            .map_err(|e| Error::Transport(format!("udp recv: {}", e)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(tokio::net::UdpSocket::local_addr(self)?)
    }
}
