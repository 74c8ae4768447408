//! End-to-end protocol flows without sockets
//!
//! A client and a server derive keys through the hybrid handshake, then push
//! rewritten packets through sealers and the port/NAT tables the way the
//! engine's pipelines do.

use std::net::Ipv4Addr;

use ed25519_dalek::SigningKey;
use rand_core::OsRng;
use tnl_protocol::flags::consts::*;
use tnl_protocol::transport::mock::IpPacketBuilder;
use tnl_protocol::{
    checksum, ipv4, kex, EncType, Error, FlowKey, Ipv4Packet, NatMaps, NatRule, PortMappers,
    PortRange, Role, Sealer, TcpFlags, Transport,
};

const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const REMOTE: Ipv4Addr = Ipv4Addr::new(1, 1, 1, 1);

fn handshake(enc: EncType, index: u16) -> (Sealer, Sealer) {
    let server_key = SigningKey::generate(&mut OsRng);

    let mut client = kex::ClientHandshake::new();
    let (answer, server_keys) = kex::respond(&client.offer()).unwrap();
    let signature = kex::sign_answer(&server_key, &answer, index);

    kex::verify_answer(&server_key.verifying_key(), &answer, index, &signature).unwrap();
    let client_keys = client.finalize(&answer).unwrap();
    assert!(client.is_wiped());

    (
        Sealer::new(index, enc, &client_keys, Role::Client).unwrap(),
        Sealer::new(index, enc, &server_keys, Role::Server).unwrap(),
    )
}

/// Client-side egress rewrite: source becomes the server address and mapped port
fn egress(mappers: &PortMappers, nat: &NatMaps, packet: &mut [u8]) -> tnl_protocol::Result<()> {
    let info = ipv4::parse(packet)?;
    let mapping = mappers.for_transport(info.transport).get_or_map(FlowKey {
        src: info.src,
        dst: info.dst,
        src_port: info.src_port,
        dst_port: info.dst_port,
    })?;

    let mut view = Ipv4Packet::new(packet)?;
    view.set_src(SERVER_IP);
    view.set_src_port(mapping.mapped_port);
    if let Some(dst) = nat.egress(info.dst) {
        view.set_dst(dst);
    }
    if let Some(flags) = info.tcp_flags {
        mapping.observe(flags);
    }
    view.recalculate_checksums()
}

/// Client-side ingress rewrite: restore the original flow
fn ingress(mappers: &PortMappers, nat: &NatMaps, packet: &mut [u8]) -> tnl_protocol::Result<()> {
    let info = ipv4::parse(packet)?;
    let src = nat.ingress(info.src).unwrap_or(info.src);
    let mapping = mappers
        .for_transport(info.transport)
        .lookup_reverse(info.dst_port, src, info.src_port)
        .ok_or(Error::NoMapping)?;

    let mut view = Ipv4Packet::new(packet)?;
    view.set_src(src);
    view.set_dst(mapping.orig_src());
    view.set_dst_port(mapping.orig_src_port());
    if let Some(flags) = info.tcp_flags {
        mapping.observe(flags);
    }
    view.recalculate_checksums()
}

#[test]
fn test_tcp_flow_round_trip_through_sealers() {
    let (client, server) = handshake(EncType::Chacha20Poly1305, 12);
    let mappers = PortMappers::new(PortRange::new(40000, 41000).unwrap(), vec![]);
    let nat = NatMaps::default();

    let mut syn = IpPacketBuilder::tcp(CLIENT_IP, 50000, REMOTE, 443)
        .flags(TCP_SYN)
        .build();
    egress(&mappers, &nat, &mut syn).unwrap();

    let mut wire = Vec::new();
    client.seal_into(&syn, &mut wire).unwrap();
    let mut at_server = Vec::new();
    server.open_into(&wire, &mut at_server).unwrap();

    let info = ipv4::parse(&at_server).unwrap();
    assert_eq!(info.src, SERVER_IP);
    assert!((40000..41000).contains(&info.src_port));
    assert_eq!(info.dst, REMOTE);
    assert_eq!(info.dst_port, 443);
    assert!(checksum::verify_ipv4_checksum(&at_server[..20]));

    let mut reply = IpPacketBuilder::tcp(REMOTE, 443, SERVER_IP, info.src_port)
        .flags(TCP_SYN | TCP_ACK)
        .build();
    server.seal_into(&reply, &mut wire).unwrap();
    client.open_into(&wire, &mut reply).unwrap();
    ingress(&mappers, &nat, &mut reply).unwrap();

    let back = ipv4::parse(&reply).unwrap();
    assert_eq!(back.src, REMOTE);
    assert_eq!(back.dst, CLIENT_IP);
    assert_eq!(back.dst_port, 50000);
}

#[test]
fn test_udp_flow_with_nat() {
    let (client, server) = handshake(EncType::Aes256Gcm, 3);
    let mappers = PortMappers::new(PortRange::new(40000, 40100).unwrap(), vec![]);
    let nat = NatMaps::new(vec![NatRule::new(
        "192.168.1.0/24".parse().unwrap(),
        "10.99.1.0/24".parse().unwrap(),
    )
    .unwrap()]);

    let mut query = IpPacketBuilder::udp(CLIENT_IP, 6000, Ipv4Addr::new(10, 99, 1, 20), 161)
        .payload(b"get")
        .build();
    egress(&mappers, &nat, &mut query).unwrap();

    let mut wire = Vec::new();
    let mut at_server = Vec::new();
    client.seal_into(&query, &mut wire).unwrap();
    server.open_into(&wire, &mut at_server).unwrap();
    let info = ipv4::parse(&at_server).unwrap();
    assert_eq!(info.dst, Ipv4Addr::new(192, 168, 1, 20));

    let mut reply = IpPacketBuilder::udp(info.dst, 161, SERVER_IP, info.src_port)
        .payload(b"value")
        .build();
    ingress(&mappers, &nat, &mut reply).unwrap();
    let back = ipv4::parse(&reply).unwrap();
    assert_eq!(back.src, Ipv4Addr::new(10, 99, 1, 20));
    assert_eq!(back.dst_port, 6000);
}

#[test]
fn test_port_exhaustion_is_reported() {
    let mappers = PortMappers::new(PortRange::new(40000, 40001).unwrap(), vec![]);
    let nat = NatMaps::default();

    let mut first = IpPacketBuilder::tcp(CLIENT_IP, 50000, REMOTE, 443).build();
    egress(&mappers, &nat, &mut first).unwrap();

    let mut second = IpPacketBuilder::tcp(CLIENT_IP, 50001, REMOTE, 443).build();
    let err = egress(&mappers, &nat, &mut second).unwrap_err();
    assert!(matches!(err, Error::Exhausted(_)));
    assert!(err.is_drop());
}

#[test]
fn test_reply_without_mapping_dropped() {
    let mappers = PortMappers::new(PortRange::new(40000, 40010).unwrap(), vec![]);
    let mut stray = IpPacketBuilder::udp(REMOTE, 53, SERVER_IP, 40005).build();
    assert!(matches!(
        ingress(&mappers, &NatMaps::default(), &mut stray),
        Err(Error::NoMapping)
    ));
}

#[test]
fn test_rst_normalization_keeps_checksum_valid() {
    let mut rst = IpPacketBuilder::tcp(CLIENT_IP, 50000, REMOTE, 443)
        .flags(TCP_RST)
        .build();
    let mut view = Ipv4Packet::new(&mut rst).unwrap();
    let flags = view.tcp_flags().unwrap();
    assert!(flags.is_bare_rst());
    view.set_tcp_flags(TcpFlags::ack_rst());
    view.recalculate_checksums().unwrap();

    let info = ipv4::parse(&rst).unwrap();
    assert_eq!(info.transport, Transport::Tcp);
    assert_eq!(info.tcp_flags.unwrap().as_u8(), 0b0001_0100);
}

#[test]
fn test_forged_signature_rejected() {
    let server_key = SigningKey::generate(&mut OsRng);
    let impostor = SigningKey::generate(&mut OsRng);

    let client = kex::ClientHandshake::new();
    let (answer, _) = kex::respond(&client.offer()).unwrap();
    let signature = kex::sign_answer(&impostor, &answer, 1);
    assert!(matches!(
        kex::verify_answer(&server_key.verifying_key(), &answer, 1, &signature),
        Err(Error::BadSignature)
    ));
}
