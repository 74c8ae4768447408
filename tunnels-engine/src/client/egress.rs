//! TUN → UDP
//!
//! Every packet read from the interface is classified by destination. LAN
//! traffic is re-addressed onto the server's VPL; everything else gets a
//! mapped source port from the session's slot and the server's address as
//! source. The rewritten packet is sealed and sent before the next read.

use std::sync::Arc;
use std::time::Instant;

use tnl_protocol::ports::FlowKey;
use tnl_protocol::{nat, Ipv4Packet, TcpFlags, Transport};

use super::session::{ClientSession, ExitReason, Translator};
use crate::error::{Error, Result};
use crate::stats::DropReason;

/// Rewrite one outbound packet in place
pub fn transform(t: &Translator, packet: &mut [u8], now: Instant) -> tnl_protocol::Result<()> {
    let mut pkt = Ipv4Packet::new(packet)?;
    let dst = pkt.dst();

    match t.vpl.filter(|v| v.is_vpl(dst)) {
        Some(vpl) => {
            pkt.set_dst(nat::rewrite_prefix(dst, vpl.lan.network));
            pkt.set_src(vpl.lease);
        }
        None => {
            let ports = t.ports.as_ref().ok_or(tnl_protocol::Error::NoMapping)?;
            let key = FlowKey {
                src: pkt.src(),
                dst,
                src_port: pkt.src_port(),
                dst_port: pkt.dst_port(),
            };
            let mapping = ports.for_transport(pkt.transport()).get_or_map_at(key, now)?;
            if let Some(flags) = pkt.tcp_flags() {
                mapping.observe(flags);
            }
            pkt.set_src(t.server_ip);
            pkt.set_src_port(mapping.mapped_port);
            if let Some(translated) = t.nat.egress(dst) {
                pkt.set_dst(translated);
            }
        }
    }

    if pkt.transport() == Transport::Tcp && t.normalize_rst {
        if pkt.tcp_flags().is_some_and(|f| f.is_bare_rst()) {
            pkt.set_tcp_flags(TcpFlags::ack_rst());
        }
    }
    pkt.recalculate_checksums()
}

/// Egress loop; returns `Ok(None)` when the session closes
pub(crate) async fn run(session: Arc<ClientSession>) -> Result<Option<ExitReason>> {
    let mut closed = session.closed_signal();
    let mut buf = vec![0u8; tnl_protocol::IFACE_BUFSIZE];
    let mut wire = Vec::with_capacity(tnl_protocol::IFACE_BUFSIZE + tnl_protocol::FRAME_OVERHEAD);
    let counters = &session.stats;

    loop {
        let n = tokio::select! {
            _ = closed.wait_for(|c| *c) => return Ok(None),
            read = session.nic.read(&mut buf) => match read {
                Ok(n) => n,
                Err(_) if session.is_closed() => return Ok(None),
                Err(e) => return Err(Error::Transport(format!("interface read: {}", e))),
            },
        };
        let packet = &mut buf[..n];

        if let Err(e) = transform(&session.translator, packet, tokio::time::Instant::now().into_std()) {
            match DropReason::from_protocol(&e) {
                Some(reason) => {
                    log::trace!("[{}] egress drop: {}", session.tag, e);
                    counters.record_drop(reason);
                    continue;
                }
                None => return Err(e.into()),
            }
        }

        wire.clear();
        session.sealer.seal_into(packet, &mut wire)?;
        if let Err(e) = session.socket.send(&wire).await {
            if session.is_closed() {
                return Ok(None);
            }
            return Err(Error::Transport(format!("udp send: {}", e)));
        }
        counters.record_tx(n);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::session::VplRoute;
    use crate::handshake::LanInfo;
    use ipnet::Ipv4Net;
    use std::net::Ipv4Addr;
    use tnl_protocol::flags::consts::*;
    use tnl_protocol::transport::mock::IpPacketBuilder;
    use tnl_protocol::{NatMaps, NatRule, PortMappers, PortRange};

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 255, 0, 2);
    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);

    fn translator() -> Translator {
        let lan: Ipv4Net = "10.0.0.0/16".parse().unwrap();
        let nat: Ipv4Net = "10.9.0.0/16".parse().unwrap();
        Translator {
            server_ip: SERVER,
            local_ip: LOCAL,
            ports: Some(PortMappers::new(
                PortRange::new(40000, 41000).unwrap(),
                vec![Ipv4Addr::new(1, 1, 1, 1)],
            )),
            nat: NatMaps::new(vec![NatRule::new(
                "172.16.0.0/24".parse().unwrap(),
                "192.168.50.0/24".parse().unwrap(),
            )
            .unwrap()]),
            vpl: Some(VplRoute {
                lan: LanInfo { network: lan, nat },
                lease: Ipv4Addr::new(10, 0, 0, 5),
            }),
            normalize_rst: true,
        }
    }

    #[test]
    fn test_internet_packet_gets_server_source() {
        let t = translator();
        let mut pkt = IpPacketBuilder::tcp(LOCAL, 50000, Ipv4Addr::new(1, 1, 1, 1), 443)
            .flags(TCP_SYN)
            .build();
        transform(&t, &mut pkt, Instant::now()).unwrap();

        let info = tnl_protocol::ipv4::parse(&pkt).unwrap();
        assert_eq!(info.src, SERVER);
        assert!((40000..41000).contains(&info.src_port));
        assert_eq!(info.dst, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(info.dst_port, 443);
        assert_eq!(t.ports.as_ref().unwrap().tcp.len(), 1);
    }

    #[test]
    fn test_vpl_packet_uses_lease() {
        let t = translator();
        let mut pkt = IpPacketBuilder::udp(LOCAL, 5353, Ipv4Addr::new(10, 9, 0, 6), 53).build();
        transform(&t, &mut pkt, Instant::now()).unwrap();

        let info = tnl_protocol::ipv4::parse(&pkt).unwrap();
        assert_eq!(info.src, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(info.dst, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(info.src_port, 5353);
        assert!(t.ports.as_ref().unwrap().udp.is_empty());
    }

    #[test]
    fn test_nat_rule_rewrites_destination() {
        let t = translator();
        let mut pkt =
            IpPacketBuilder::tcp(LOCAL, 50001, Ipv4Addr::new(192, 168, 50, 7), 22).build();
        transform(&t, &mut pkt, Instant::now()).unwrap();
        assert_eq!(tnl_protocol::ipv4::dst_addr(&pkt), Some(Ipv4Addr::new(172, 16, 0, 7)));
    }

    #[test]
    fn test_bare_rst_is_normalized() {
        let t = translator();
        let mut pkt = IpPacketBuilder::tcp(LOCAL, 50002, Ipv4Addr::new(1, 1, 1, 1), 443)
            .flags(TCP_RST)
            .build();
        transform(&t, &mut pkt, Instant::now()).unwrap();
        let flags = tnl_protocol::ipv4::parse(&pkt).unwrap().tcp_flags.unwrap();
        assert_eq!(flags.as_u8(), TCP_ACK | TCP_RST);

        let mut t = translator();
        t.normalize_rst = false;
        let mut pkt = IpPacketBuilder::tcp(LOCAL, 50002, Ipv4Addr::new(1, 1, 1, 1), 443)
            .flags(TCP_RST)
            .build();
        transform(&t, &mut pkt, Instant::now()).unwrap();
        let flags = tnl_protocol::ipv4::parse(&pkt).unwrap().tcp_flags.unwrap();
        assert_eq!(flags.as_u8(), TCP_RST);
    }

    #[test]
    fn test_no_slot_drops_internet_traffic() {
        let mut t = translator();
        t.ports = None;
        let mut pkt = IpPacketBuilder::udp(LOCAL, 5000, Ipv4Addr::new(8, 8, 8, 8), 53).build();
        let err = transform(&t, &mut pkt, Instant::now()).unwrap_err();
        assert_eq!(DropReason::from_protocol(&err), Some(DropReason::NoMapping));
    }

    #[test]
    fn test_non_ipv4_is_dropped() {
        let t = translator();
        let mut pkt = vec![0x60u8; 40];
        let err = transform(&t, &mut pkt, Instant::now()).unwrap_err();
        assert_eq!(DropReason::from_protocol(&err), Some(DropReason::NonIpv4));
    }
}
