//! Raw IPv4 sockets between the server and the Internet
//!
//! Inbound: one raw socket per transport (TCP, UDP) receives every packet
//! addressed to the host; the destination port picks the owning session
//! through the slot table. Outbound: one `IPPROTO_RAW` socket sends packets
//! exactly as the client built them.
//!
//! The kernel also sees inbound segments for ports no local socket owns and
//! may answer TCP ones with RST. Deployments drop those with a firewall rule
//! on the slot range.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use tnl_protocol::{ipv4, BufferPool, SlotTable, Transport};

use super::session::ServerSession;
use crate::error::{Error, Result};

/// Writes complete IPv4 packets to the wire
#[async_trait]
pub trait RawSender: Send + Sync {
    async fn send_raw(&self, packet: &[u8]) -> Result<()>;
}

/// Reads complete IPv4 packets addressed to this host
#[async_trait]
pub trait RawReceiver: Send + Sync {
    async fn recv_raw(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Session owning the destination port of an inbound packet
///
/// Sessions without a known peer address are skipped.
pub fn route_inbound(
    slots: &SlotTable<ServerSession>,
    packet: &[u8],
) -> Option<Arc<ServerSession>> {
    let port = ipv4::dst_port(packet)?;
    slots.lookup(port).filter(|s| s.peer().is_some())
}

/// Deliver one received packet; false if it was dropped
pub fn deliver_inbound(
    slots: &SlotTable<ServerSession>,
    pool: &BufferPool,
    packet: &[u8],
) -> bool {
    match route_inbound(slots, packet) {
        Some(session) => session.enqueue_to_user(pool.copy_from(packet)),
        None => false,
    }
}

#[cfg(unix)]
pub use sys::{RawListener, RawSocketSender};

#[cfg(unix)]
mod sys {
    use std::io::Read;

    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use tokio::io::unix::AsyncFd;

    use super::*;

    fn raw_socket(protocol: i32) -> Result<AsyncFd<Socket>> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(protocol)))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => {
                    Error::Permission(format!("raw socket: {}", e))
                }
                _ => Error::Transport(format!("raw socket: {}", e)),
            })?;
        socket.set_nonblocking(true)?;
        Ok(AsyncFd::new(socket)?)
    }

    /// `IPPROTO_RAW` sender; the IP header comes from the packet
    pub struct RawSocketSender {
        fd: AsyncFd<Socket>,
    }

    impl RawSocketSender {
        pub fn open() -> Result<Self> {
            Ok(Self {
                fd: raw_socket(libc::IPPROTO_RAW)?,
            })
        }
    }

    #[async_trait]
    impl RawSender for RawSocketSender {
        async fn send_raw(&self, packet: &[u8]) -> Result<()> {
            let info = ipv4::parse(packet)?;
            let target = SockAddr::from(SocketAddrV4::new(info.dst, info.dst_port));
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| inner.get_ref().send_to(packet, &target)) {
                    Ok(Ok(_)) => return Ok(()),
                    Ok(Err(e)) => {
                        return Err(Error::Transport(format!("raw send to {}: {}", info.dst, e)))
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }

    /// Receives TCP or UDP packets for the whole host
    pub struct RawListener {
        fd: AsyncFd<Socket>,
        transport: Transport,
    }

    impl RawListener {
        /// Listen for `transport`, optionally only for packets to `bind`
        pub fn open(transport: Transport, bind: Option<Ipv4Addr>) -> Result<Self> {
            let fd = raw_socket(transport.number() as i32)?;
            if let Some(ip) = bind {
                fd.get_ref()
                    .bind(&SockAddr::from(SocketAddrV4::new(ip, 0)))
                    .map_err(|e| Error::Transport(format!("raw bind {}: {}", ip, e)))?;
            }
            Ok(Self { fd, transport })
        }

        pub fn transport(&self) -> Transport {
            self.transport
        }
    }

    #[async_trait]
    impl RawReceiver for RawListener {
        async fn recv_raw(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                let result = guard.try_io(|inner| {
                    let mut socket: &Socket = inner.get_ref();
                    socket.read(buf)
                });
                match result {
                    Ok(Ok(n)) => return Ok(n),
                    Ok(Err(e)) => {
                        return Err(Error::Transport(format!("raw {} recv: {}", self.transport, e)))
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }
}

/// Pump one raw listener into the session queues until it fails
pub async fn run_listener(
    receiver: Arc<dyn RawReceiver>,
    slots: Arc<SlotTable<ServerSession>>,
    pool: BufferPool,
    stats: crate::stats::SharedStatsRef,
) -> Result<()> {
    let mut buf = vec![0u8; u16::MAX as usize];
    loop {
        let n = receiver.recv_raw(&mut buf).await?;
        let packet = &buf[..n];
        // A full queue counts itself in enqueue_to_user
        match route_inbound(&slots, packet) {
            Some(session) => {
                session.enqueue_to_user(pool.copy_from(packet));
            }
            None => stats.record_drop(crate::stats::DropReason::NoSession),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::session::test_session;
    use tnl_protocol::transport::mock::IpPacketBuilder;
    use tnl_protocol::SlotLayout;

    #[tokio::test]
    async fn test_inbound_routed_by_destination_port() {
        let slots = SlotTable::new(SlotLayout::new(40000, 40100, 100, 50).unwrap());
        let session = test_session(1, 8);
        let (slot, range) = slots.assign(session.clone()).unwrap();
        session.set_slot(slot, range);
        let pool = BufferPool::new(16, 2048);

        let packet = IpPacketBuilder::tcp(
            Ipv4Addr::new(1, 1, 1, 1),
            443,
            Ipv4Addr::new(192, 0, 2, 10),
            range.start + 3,
        )
        .build();

        // No peer yet: dropped
        assert!(!deliver_inbound(&slots, &pool, &packet));

        session.set_peer("198.51.100.7:5000".parse().unwrap());
        assert!(deliver_inbound(&slots, &pool, &packet));
        let mut queues = session.take_queues().unwrap();
        assert_eq!(queues.to_user.recv().await.unwrap().as_slice(), packet.as_slice());

        let stray = IpPacketBuilder::udp(
            Ipv4Addr::new(1, 1, 1, 1),
            53,
            Ipv4Addr::new(192, 0, 2, 10),
            39999,
        )
        .build();
        assert!(!deliver_inbound(&slots, &pool, &stray));
    }

    #[cfg(unix)]
    #[tokio::test]
    #[ignore = "needs CAP_NET_RAW"]
    async fn test_raw_listener_reads_whole_packets() {
        let listener = RawListener::open(Transport::Udp, Some(Ipv4Addr::LOCALHOST)).unwrap();
        let target = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = target.local_addr().unwrap().port();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", ("127.0.0.1", port)).unwrap();

        let mut buf = vec![0u8; 2048];
        loop {
            let n = tokio::time::timeout(
                std::time::Duration::from_secs(5),
                listener.recv_raw(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            let info = ipv4::parse(&buf[..n]).unwrap();
            if info.dst_port == port {
                assert_eq!(info.dst, Ipv4Addr::LOCALHOST);
                assert!(buf[..n].ends_with(b"ping"));
                break;
            }
        }
    }
}
