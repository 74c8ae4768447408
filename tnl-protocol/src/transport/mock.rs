//! In-memory transports for tests
//!
//! - [`MockNic`]: packets injected with [`MockNic::inject`] come out of
//!   `read`; packets the pipeline writes are captured for inspection.
//! - [`MockNicFactory`]: hands out `MockNic`s and remembers them.
//! - [`MockDatagram::pair`]: two connected in-memory UDP endpoints. Either end
//!   can be muted to simulate a silent peer.
//! - [`IpPacketBuilder`]: builds IPv4 TCP/UDP packets with valid checksums.
//!
//! ```ignore
//! let nic = MockNic::new(NicConfig::default());
//! nic.inject(IpPacketBuilder::udp(src, 5353, dst, 53).build());
//! // ... run the pipeline ...
//! let written = nic.next_written().await;
//! ```

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::sync::{mpsc, watch};

use super::{DatagramSocket, NicConfig, NicFactory, NicInfo, VirtualNic};
use crate::checksum;
use crate::error::{Error, Result};
use crate::ipv4::Transport;

/// Scripted virtual interface
pub struct MockNic {
    info: Mutex<NicInfo>,
    inbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    written_tx: mpsc::UnboundedSender<Vec<u8>>,
    written_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    routes: Mutex<Vec<Ipv4Net>>,
    closed: watch::Sender<bool>,
}

impl MockNic {
    pub fn new(config: NicConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            info: Mutex::new(NicInfo {
                name: config.name.unwrap_or_else(|| "mock0".into()),
                mtu: config.mtu,
                address: config.address,
                prefix_len: config.prefix_len,
            }),
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            written_tx,
            written_rx: tokio::sync::Mutex::new(written_rx),
            routes: Mutex::new(Vec::new()),
            closed,
        })
    }

    /// Queue a packet as if the OS routed it into the tunnel
    pub fn inject(&self, packet: Vec<u8>) {
        let _ = self.inbound_tx.send(packet);
    }

    /// Wait for the next packet written to the interface
    pub async fn next_written(&self) -> Option<Vec<u8>> {
        self.written_rx.lock().await.recv().await
    }

    /// Drain packets written so far
    pub fn written_now(&self) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        if let Ok(mut rx) = self.written_rx.try_lock() {
            while let Ok(packet) = rx.try_recv() {
                out.push(packet);
            }
        }
        out
    }

    pub fn routes(&self) -> Vec<Ipv4Net> {
        self.routes.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

#[async_trait]
impl VirtualNic for MockNic {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Error::Transport("interface closed".into()));
        }
        let mut rx = self.inbound_rx.lock().await;
        tokio::select! {
            packet = rx.recv() => {
                let packet = packet.ok_or_else(|| Error::Transport("interface closed".into()))?;
                let len = packet.len().min(buf.len());
                buf[..len].copy_from_slice(&packet[..len]);
                Ok(len)
            }
            _ = closed.changed() => Err(Error::Transport("interface closed".into())),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::Transport("interface closed".into()));
        }
        let mtu = self.info().mtu as usize;
        if buf.len() > mtu {
            return Err(Error::Transport(format!(
                "packet size {} exceeds MTU {}",
                buf.len(),
                mtu
            )));
        }
        let _ = self.written_tx.send(buf.to_vec());
        Ok(buf.len())
    }

    async fn add_route(&self, net: Ipv4Net) -> Result<()> {
        if let Ok(mut routes) = self.routes.lock() {
            if !routes.contains(&net) {
                routes.push(net);
            }
        }
        Ok(())
    }

    fn set_mtu(&self, mtu: u16) -> Result<()> {
        if let Ok(mut info) = self.info.lock() {
            info.mtu = mtu;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn info(&self) -> NicInfo {
        self.info
            .lock()
            .map(|i| i.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }
}

/// Factory that records every interface it opens
#[derive(Default)]
pub struct MockNicFactory {
    opened: Mutex<Vec<Arc<MockNic>>>,
}

impl MockNicFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> Vec<Arc<MockNic>> {
        self.opened.lock().map(|o| o.clone()).unwrap_or_default()
    }

    /// Most recently opened interface
    pub fn last(&self) -> Option<Arc<MockNic>> {
        self.opened().pop()
    }
}

#[async_trait]
impl NicFactory for MockNicFactory {
    async fn open(&self, config: &NicConfig) -> Result<Arc<dyn VirtualNic>> {
        let nic = MockNic::new(config.clone());
        if let Ok(mut opened) = self.opened.lock() {
            opened.push(nic.clone());
        }
        Ok(nic)
    }
}

/// One end of an in-memory datagram link
pub struct MockDatagram {
    local: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    muted: AtomicBool,
    closed: watch::Sender<bool>,
    sent: AtomicU64,
}

impl MockDatagram {
    /// Two connected endpoints
    pub fn pair() -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let end = |local: SocketAddr, tx, rx| Self {
            local,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            muted: AtomicBool::new(false),
            closed: watch::channel(false).0,
            sent: AtomicU64::new(0),
        };
        (
            end(SocketAddr::from(([127, 0, 0, 1], 40001)), a_tx, a_rx),
            end(SocketAddr::from(([127, 0, 0, 1], 40002)), b_tx, b_rx),
        )
    }

    /// Silently discard outgoing datagrams while muted
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Datagrams sent (including muted ones)
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatagramSocket for MockDatagram {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        if *self.closed.borrow() {
            return Err(Error::Transport("socket closed".into()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.muted.load(Ordering::SeqCst) {
            return Ok(buf.len());
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| Error::Transport("peer gone".into()))?;
        Ok(buf.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(Error::Transport("socket closed".into()));
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            datagram = rx.recv() => {
                let datagram = datagram.ok_or_else(|| Error::Transport("peer gone".into()))?;
                let len = datagram.len().min(buf.len());
                buf[..len].copy_from_slice(&datagram[..len]);
                Ok(len)
            }
            _ = closed.changed() => Err(Error::Transport("socket closed".into())),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local)
    }
}

/// Builder for IPv4 TCP/UDP test packets
#[derive(Debug, Clone)]
pub struct IpPacketBuilder {
    transport: Transport,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    flags: u8,
    ttl: u8,
    payload: Vec<u8>,
}

impl IpPacketBuilder {
    fn new(transport: Transport, src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self {
            transport,
            src,
            dst,
            src_port,
            dst_port,
            flags: 0,
            ttl: 64,
            payload: Vec::new(),
        }
    }

    pub fn tcp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self::new(Transport::Tcp, src, src_port, dst, dst_port)
    }

    pub fn udp(src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Self {
        Self::new(Transport::Udp, src, src_port, dst, dst_port)
    }

    /// TCP flags byte; ignored for UDP
    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn payload(mut self, data: &[u8]) -> Self {
        self.payload = data.to_vec();
        self
    }

    pub fn build(self) -> Vec<u8> {
        let transport_len = match self.transport {
            Transport::Tcp => 20,
            Transport::Udp => 8,
        };
        let total = 20 + transport_len + self.payload.len();
        let mut pkt = Vec::with_capacity(total);

        pkt.extend_from_slice(&[0x45, 0x00]);
        pkt.extend_from_slice(&(total as u16).to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x00, 0x40, 0x00, self.ttl, self.transport.number()]);
        pkt.extend_from_slice(&[0x00, 0x00]);
        pkt.extend_from_slice(&self.src.octets());
        pkt.extend_from_slice(&self.dst.octets());

        pkt.extend_from_slice(&self.src_port.to_be_bytes());
        pkt.extend_from_slice(&self.dst_port.to_be_bytes());
        match self.transport {
            Transport::Tcp => {
                pkt.extend_from_slice(&[0u8; 8]);
                pkt.push(0x50);
                pkt.push(self.flags);
                pkt.extend_from_slice(&0xFFFFu16.to_be_bytes());
                pkt.extend_from_slice(&[0u8; 4]);
            }
            Transport::Udp => {
                pkt.extend_from_slice(&((8 + self.payload.len()) as u16).to_be_bytes());
                pkt.extend_from_slice(&[0u8; 2]);
            }
        }
        pkt.extend_from_slice(&self.payload);

        let _ = checksum::recalculate_ipv4_checksum(&mut pkt);
        let _ = checksum::recalculate_transport_checksum(&mut pkt);
        pkt
    }
}
