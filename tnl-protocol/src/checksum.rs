//! RFC 1071 internet checksums for IPv4 headers and TCP/UDP segments

use std::net::Ipv4Addr;

use crate::ipv4::{PROTO_TCP, PROTO_UDP};
use crate::{Error, Result};

/// Offset of the checksum field inside the IPv4 header
const IPV4_CHECKSUM_OFFSET: usize = 10;

/// Offset of the checksum field inside a TCP header
pub const TCP_CHECKSUM_OFFSET: usize = 16;

/// Offset of the checksum field inside a UDP header
pub const UDP_CHECKSUM_OFFSET: usize = 6;

/// Add `data` as big-endian 16-bit words to `sum`, skipping the word at `skip`
fn sum_words(data: &[u8], mut sum: u32, skip: Option<usize>) -> u32 {
    let mut i = 0;
    while i + 1 < data.len() {
        if skip != Some(i) {
            sum = sum.wrapping_add(u16::from_be_bytes([data[i], data[i + 1]]) as u32);
        }
        i += 2;
    }
    if i < data.len() {
        sum = sum.wrapping_add((data[i] as u32) << 8);
    }
    sum
}

/// Fold carries and invert
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Compute the IPv4 header checksum, treating the checksum field as zero
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    finish(sum_words(header, 0, Some(IPV4_CHECKSUM_OFFSET)))
}

/// Returns true if the stored header checksum is correct
pub fn verify_ipv4_checksum(header: &[u8]) -> bool {
    header.len() >= 20 && finish(sum_words(header, 0, None)) == 0
}

/// Compute a TCP or UDP checksum over the IPv4 pseudo-header and `segment`,
/// treating the segment's checksum field as zero
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let skip = match protocol {
        PROTO_TCP => Some(TCP_CHECKSUM_OFFSET),
        PROTO_UDP => Some(UDP_CHECKSUM_OFFSET),
        _ => None,
    };

    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());

    let sum = sum_words(&pseudo, 0, None);
    finish(sum_words(segment, sum, skip))
}

/// Rewrite the IPv4 header checksum in place
pub fn recalculate_ipv4_checksum(packet: &mut [u8]) -> Result<()> {
    let ihl = header_len(packet)?;
    let checksum = ipv4_header_checksum(&packet[..ihl]);
    packet[IPV4_CHECKSUM_OFFSET..IPV4_CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

/// Rewrite the TCP or UDP checksum in place
///
/// The transport length comes from the IPv4 total length. A computed UDP
/// checksum of zero is sent as `0xFFFF`, zero meaning "no checksum" on the wire.
pub fn recalculate_transport_checksum(packet: &mut [u8]) -> Result<()> {
    let ihl = header_len(packet)?;
    let protocol = packet[9];
    let total = (u16::from_be_bytes([packet[2], packet[3]]) as usize).min(packet.len());
    if total < ihl {
        return Err(Error::Malformed(format!(
            "total length {} shorter than header {}",
            total, ihl
        )));
    }

    let offset = match protocol {
        PROTO_TCP => TCP_CHECKSUM_OFFSET,
        PROTO_UDP => UDP_CHECKSUM_OFFSET,
        other => return Err(Error::UnsupportedProtocol(other)),
    };
    if total - ihl < offset + 2 {
        return Err(Error::PacketTooShort {
            expected: ihl + offset + 2,
            actual: total,
        });
    }

    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let mut checksum = transport_checksum(src, dst, protocol, &packet[ihl..total]);
    if protocol == PROTO_UDP && checksum == 0 {
        checksum = 0xFFFF;
    }
    packet[ihl + offset..ihl + offset + 2].copy_from_slice(&checksum.to_be_bytes());
    Ok(())
}

fn header_len(packet: &[u8]) -> Result<usize> {
    if packet.len() < 20 {
        return Err(Error::PacketTooShort {
            expected: 20,
            actual: packet.len(),
        });
    }
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    if ihl < 20 || packet.len() < ihl {
        return Err(Error::Malformed(format!("bad IHL {}", ihl)));
    }
    Ok(ihl)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [u8; 20] = [
        0x45, 0x00, 0x00, 0x28, 0x00, 0x00, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0xC0, 0xA8, 0x01,
        0x01, 0xC0, 0xA8, 0x01, 0x02,
    ];

    fn tcp_packet() -> Vec<u8> {
        let mut pkt = HEADER.to_vec();
        // 20-byte TCP header: 50000 -> 443, SYN
        let mut tcp = [0u8; 20];
        tcp[0..2].copy_from_slice(&50000u16.to_be_bytes());
        tcp[2..4].copy_from_slice(&443u16.to_be_bytes());
        tcp[12] = 0x50;
        tcp[13] = 0x02;
        tcp[14..16].copy_from_slice(&64240u16.to_be_bytes());
        pkt.extend_from_slice(&tcp);
        pkt
    }

    #[test]
    fn test_known_header_checksum() {
        assert_eq!(ipv4_header_checksum(&HEADER), 0xB77C);

        let mut pkt = HEADER.to_vec();
        recalculate_ipv4_checksum(&mut pkt).unwrap();
        assert_eq!(&pkt[10..12], &[0xB7, 0x7C]);
        assert!(verify_ipv4_checksum(&pkt));
    }

    #[test]
    fn test_ipv4_checksum_idempotent() {
        let mut pkt = HEADER.to_vec();
        recalculate_ipv4_checksum(&mut pkt).unwrap();
        let first = pkt.clone();
        recalculate_ipv4_checksum(&mut pkt).unwrap();
        assert_eq!(first, pkt);
    }

    #[test]
    fn test_tcp_checksum_validates() {
        let mut pkt = tcp_packet();
        recalculate_transport_checksum(&mut pkt).unwrap();

        // Summing the pseudo-header and the segment including its checksum yields zero
        let src = Ipv4Addr::new(192, 168, 1, 1);
        let dst = Ipv4Addr::new(192, 168, 1, 2);
        let mut pseudo = [0u8; 12];
        pseudo[0..4].copy_from_slice(&src.octets());
        pseudo[4..8].copy_from_slice(&dst.octets());
        pseudo[9] = PROTO_TCP;
        pseudo[10..12].copy_from_slice(&20u16.to_be_bytes());
        let sum = sum_words(&pkt[20..], sum_words(&pseudo, 0, None), None);
        assert_eq!(finish(sum), 0);
    }

    #[test]
    fn test_transport_checksum_idempotent() {
        let mut pkt = tcp_packet();
        recalculate_transport_checksum(&mut pkt).unwrap();
        let first = pkt.clone();
        recalculate_transport_checksum(&mut pkt).unwrap();
        assert_eq!(first, pkt);
    }

    #[test]
    fn test_udp_checksum_never_zero() {
        let mut pkt = HEADER.to_vec();
        pkt[9] = PROTO_UDP;
        pkt[2..4].copy_from_slice(&28u16.to_be_bytes());
        pkt.extend_from_slice(&[0x13, 0x88, 0x00, 0x35, 0x00, 0x08, 0x00, 0x00]);
        recalculate_transport_checksum(&mut pkt).unwrap();
        let stored = u16::from_be_bytes([pkt[26], pkt[27]]);
        assert_ne!(stored, 0);
    }

    #[test]
    fn test_short_packet_rejected() {
        let mut pkt = vec![0x45, 0x00];
        assert!(recalculate_ipv4_checksum(&mut pkt).is_err());
    }
}
