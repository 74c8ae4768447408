//! In-place IPv4 / TCP / UDP header access
//!
//! The data path never copies packets to rewrite them: [`Ipv4Packet`] borrows
//! the scratch buffer mutably, validates the fields the pipelines need, and
//! exposes typed getters and setters over the raw bytes.

use std::net::Ipv4Addr;

use crate::checksum;
use crate::flags::TcpFlags;
use crate::{Error, Result};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Minimum IPv4 header length
pub const IPV4_MIN_HEADER: usize = 20;

/// Transport protocol of a supported packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub const fn number(&self) -> u8 {
        match self {
            Transport::Tcp => PROTO_TCP,
            Transport::Udp => PROTO_UDP,
        }
    }

    pub const fn from_number(proto: u8) -> Option<Self> {
        match proto {
            PROTO_TCP => Some(Transport::Tcp),
            PROTO_UDP => Some(Transport::Udp),
            _ => None,
        }
    }

    /// Minimum transport header length we need to touch
    const fn min_header(&self) -> usize {
        match self {
            Transport::Tcp => 20,
            Transport::Udp => 8,
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "TCP"),
            Transport::Udp => write!(f, "UDP"),
        }
    }
}

/// Copyable summary of a parsed packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub ihl: usize,
    pub transport: Transport,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// TCP flags, `None` for UDP
    pub tcp_flags: Option<TcpFlags>,
}

/// Validate and summarize an IPv4 TCP/UDP packet
pub fn parse(packet: &[u8]) -> Result<PacketInfo> {
    if packet.is_empty() {
        return Err(Error::PacketTooShort {
            expected: IPV4_MIN_HEADER,
            actual: 0,
        });
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(Error::NotIpv4(version));
    }
    if packet.len() < IPV4_MIN_HEADER {
        return Err(Error::PacketTooShort {
            expected: IPV4_MIN_HEADER,
            actual: packet.len(),
        });
    }

    let transport =
        Transport::from_number(packet[9]).ok_or(Error::UnsupportedProtocol(packet[9]))?;

    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_MIN_HEADER {
        return Err(Error::Malformed(format!("IHL {} below minimum", ihl)));
    }
    if packet.len() < ihl + transport.min_header() {
        return Err(Error::PacketTooShort {
            expected: ihl + transport.min_header(),
            actual: packet.len(),
        });
    }

    let tcp_flags = match transport {
        Transport::Tcp => Some(TcpFlags::new(packet[ihl + 13])),
        Transport::Udp => None,
    };

    Ok(PacketInfo {
        ihl,
        transport,
        src: Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]),
        dst: Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]),
        src_port: u16::from_be_bytes([packet[ihl], packet[ihl + 1]]),
        dst_port: u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]),
        tcp_flags,
    })
}

/// Read the transport destination port without full validation
///
/// Used by the raw listener, which only needs the port to pick a slot.
pub fn dst_port(packet: &[u8]) -> Option<u16> {
    if packet.len() < IPV4_MIN_HEADER || packet[0] >> 4 != 4 {
        return None;
    }
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    let bytes = packet.get(ihl + 2..ihl + 4)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Read the IPv4 destination address without full validation
pub fn dst_addr(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_MIN_HEADER || packet[0] >> 4 != 4 {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}

/// Mutable view over a validated IPv4 TCP/UDP packet
pub struct Ipv4Packet<'a> {
    buf: &'a mut [u8],
    info: PacketInfo,
}

impl<'a> Ipv4Packet<'a> {
    /// Validate `buf` and wrap it
    pub fn new(buf: &'a mut [u8]) -> Result<Self> {
        let info = parse(buf)?;
        Ok(Self { buf, info })
    }

    /// Header summary as parsed (not updated by setters)
    pub fn info(&self) -> &PacketInfo {
        &self.info
    }

    pub fn transport(&self) -> Transport {
        self.info.transport
    }

    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    pub fn set_src(&mut self, addr: Ipv4Addr) {
        self.buf[12..16].copy_from_slice(&addr.octets());
    }

    pub fn set_dst(&mut self, addr: Ipv4Addr) {
        self.buf[16..20].copy_from_slice(&addr.octets());
    }

    pub fn src_port(&self) -> u16 {
        let ihl = self.info.ihl;
        u16::from_be_bytes([self.buf[ihl], self.buf[ihl + 1]])
    }

    pub fn dst_port(&self) -> u16 {
        let ihl = self.info.ihl;
        u16::from_be_bytes([self.buf[ihl + 2], self.buf[ihl + 3]])
    }

    pub fn set_src_port(&mut self, port: u16) {
        let ihl = self.info.ihl;
        self.buf[ihl..ihl + 2].copy_from_slice(&port.to_be_bytes());
    }

    pub fn set_dst_port(&mut self, port: u16) {
        let ihl = self.info.ihl;
        self.buf[ihl + 2..ihl + 4].copy_from_slice(&port.to_be_bytes());
    }

    /// Current TCP flags, `None` for UDP
    pub fn tcp_flags(&self) -> Option<TcpFlags> {
        match self.info.transport {
            Transport::Tcp => Some(TcpFlags::new(self.buf[self.info.ihl + 13])),
            Transport::Udp => None,
        }
    }

    /// Overwrite the TCP flags byte; no-op for UDP
    pub fn set_tcp_flags(&mut self, flags: TcpFlags) {
        if self.info.transport == Transport::Tcp {
            self.buf[self.info.ihl + 13] = flags.as_u8();
        }
    }

    /// Recompute the IPv4 header and transport checksums
    pub fn recalculate_checksums(&mut self) -> Result<()> {
        checksum::recalculate_ipv4_checksum(self.buf)?;
        checksum::recalculate_transport_checksum(self.buf)
    }

    /// The underlying bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::IpPacketBuilder;

    #[test]
    fn test_parse_tcp() {
        let pkt = IpPacketBuilder::tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            50000,
            Ipv4Addr::new(1, 1, 1, 1),
            443,
        )
        .flags(0x02)
        .build();

        let info = parse(&pkt).unwrap();
        assert_eq!(info.transport, Transport::Tcp);
        assert_eq!(info.src, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(info.dst_port, 443);
        assert!(info.tcp_flags.unwrap().is_syn());
    }

    #[test]
    fn test_parse_rejects_non_ipv4() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        assert!(matches!(parse(&pkt), Err(Error::NotIpv4(6))));
    }

    #[test]
    fn test_parse_rejects_icmp() {
        let mut pkt = IpPacketBuilder::udp(
            Ipv4Addr::new(10, 0, 0, 2),
            1000,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        )
        .build();
        pkt[9] = 1;
        assert!(matches!(parse(&pkt), Err(Error::UnsupportedProtocol(1))));
    }

    #[test]
    fn test_parse_truncated_transport() {
        let pkt = IpPacketBuilder::tcp(
            Ipv4Addr::new(10, 0, 0, 2),
            1,
            Ipv4Addr::new(1, 1, 1, 1),
            2,
        )
        .build();
        assert!(parse(&pkt[..30]).is_err());
    }

    #[test]
    fn test_setters_rewrite_in_place() {
        let mut pkt = IpPacketBuilder::udp(
            Ipv4Addr::new(10, 0, 0, 2),
            5353,
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        )
        .payload(b"hello")
        .build();

        let mut view = Ipv4Packet::new(&mut pkt).unwrap();
        view.set_src(Ipv4Addr::new(192, 0, 2, 10));
        view.set_src_port(40001);
        view.recalculate_checksums().unwrap();
        assert_eq!(view.src(), Ipv4Addr::new(192, 0, 2, 10));
        assert_eq!(view.src_port(), 40001);

        assert!(checksum::verify_ipv4_checksum(&pkt[..20]));
        assert_eq!(dst_port(&pkt), Some(53));
        assert_eq!(dst_addr(&pkt), Some(Ipv4Addr::new(8, 8, 8, 8)));
    }
}
