//! Server data plane with two clients: LAN fan-out, LAN firewall, raw
//! egress and slot exhaustion

use std::net::Ipv4Addr;
use std::time::Duration;

use tnl_protocol::flags::consts::*;
use tnl_protocol::transport::mock::IpPacketBuilder;
use tnl_protocol::{heartbeat::ClientPing, ipv4, HostStats};
use tunnels_engine::error::ErrorKind;
use tunnels_engine::handshake::FirewallRequest;
use tunnels_engine::mock::{self, HarnessClient, ServerHarness};
use tunnels_engine::server::raw::deliver_inbound;
use tunnels_engine::DropReason;

const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);
const WAIT: Duration = Duration::from_secs(5);

fn ping() -> Vec<u8> {
    ClientPing {
        stats: HostStats::default(),
        counter: 1,
    }
    .encode()
    .to_vec()
}

/// Poll `cond` until it holds or the wait runs out
async fn eventually(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

/// Two connected clients whose UDP addresses the server has learned
async fn two_clients(harness: &ServerHarness) -> (HarnessClient, HarnessClient) {
    let a = harness.connect("dev-a", true).await.unwrap();
    let b = harness.connect("dev-b", true).await.unwrap();
    for client in [&a, &b] {
        harness.send(client, &ping()).unwrap();
    }
    let ctx = harness.ctx.clone();
    let (ia, ib) = (a.index(), b.index());
    eventually(|| {
        ctx.session(ia).is_some_and(|s| s.peer().is_some())
            && ctx.session(ib).is_some_and(|s| s.peer().is_some())
    })
    .await;
    (a, b)
}

#[tokio::test]
async fn test_lan_syn_blocked_until_host_allowed() {
    let harness = ServerHarness::new(mock::server_config());
    harness.start_listener();
    let (a, b) = two_clients(&harness).await;
    let (ip_a, ip_b) = (a.lease().unwrap(), b.lease().unwrap());

    let syn = IpPacketBuilder::tcp(ip_a, 50000, ip_b, 22)
        .flags(TCP_SYN)
        .build();
    harness.send(&a, &syn).unwrap();
    let stats = harness.ctx.stats.clone();
    eventually(|| stats.drops.get(DropReason::Firewall) == 1).await;

    let token = b.response.dhcp.as_ref().unwrap().token.clone();
    harness
        .acceptor
        .handle_firewall(&FirewallRequest {
            dhcp_token: token,
            ip: ip_b,
            hosts: vec![ip_a],
            disable_firewall: false,
        })
        .await
        .unwrap();

    harness.send(&a, &syn).unwrap();
    let delivered = tokio::time::timeout(WAIT, harness.recv(&b))
        .await
        .unwrap()
        .unwrap();
    let info = ipv4::parse(&delivered).unwrap();
    assert_eq!((info.src, info.dst, info.dst_port), (ip_a, ip_b, 22));

    // A opened the flow, so B's answer passes A's firewall
    let syn_ack = IpPacketBuilder::tcp(ip_b, 22, ip_a, 50000)
        .flags(TCP_SYN | TCP_ACK)
        .build();
    harness.send(&b, &syn_ack).unwrap();
    let answer = tokio::time::timeout(WAIT, harness.recv(&a))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ipv4::parse(&answer).unwrap().src_port, 22);
}

#[tokio::test]
async fn test_spoofed_lan_source_dropped() {
    let harness = ServerHarness::new(mock::server_config());
    harness.start_listener();
    let (a, b) = two_clients(&harness).await;

    let spoofed = IpPacketBuilder::udp(Ipv4Addr::new(10, 0, 0, 99), 5353, b.lease().unwrap(), 53)
        .build();
    harness.send(&a, &spoofed).unwrap();
    let stats = harness.ctx.stats.clone();
    eventually(|| stats.drops.get(DropReason::Policy) == 1).await;
}

#[tokio::test]
async fn test_internet_round_trip_through_slot() {
    let harness = ServerHarness::new(mock::server_config());
    harness.start_listener();
    let (a, _b) = two_clients(&harness).await;
    let port = a.response.start_port;
    assert_ne!(port, 0);

    let server_ip = a.response.interface_ip;
    let syn = IpPacketBuilder::tcp(server_ip, port, REMOTE, 443)
        .flags(TCP_SYN)
        .build();
    harness.send(&a, &syn).unwrap();
    let sent = tokio::time::timeout(WAIT, harness.raw.next_sent())
        .await
        .unwrap();
    assert_eq!(sent, syn);

    let reply = IpPacketBuilder::tcp(REMOTE, 443, server_ip, port)
        .flags(TCP_SYN | TCP_ACK)
        .build();
    assert!(deliver_inbound(&harness.ctx.slots, &harness.ctx.pool, &reply));
    let delivered = tokio::time::timeout(WAIT, harness.recv(&a))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivered, reply);
}

#[tokio::test]
async fn test_foreign_port_and_local_destination_refused() {
    let harness = ServerHarness::new(mock::server_config());
    harness.start_listener();
    let (a, b) = two_clients(&harness).await;
    let server_ip = a.response.interface_ip;

    // B's port, sent by A
    let stolen = IpPacketBuilder::udp(server_ip, b.response.start_port, REMOTE, 53).build();
    harness.send(&a, &stolen).unwrap();
    // Private destination with local network access off
    let local = IpPacketBuilder::udp(server_ip, a.response.start_port, Ipv4Addr::new(192, 168, 1, 1), 53)
        .build();
    harness.send(&a, &local).unwrap();

    let stats = harness.ctx.stats.clone();
    eventually(|| stats.drops.get(DropReason::Policy) == 2).await;
    assert!(harness.raw.sent_now().is_empty());
}

#[tokio::test]
async fn test_slots_exhausted_then_freed() {
    let mut config = mock::server_config();
    config.available_user_mbps = config.available_mbps;
    let harness = ServerHarness::new(config);

    let first = harness.connect("dev-a", true).await.unwrap();
    let err = harness.connect("dev-b", true).await.err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Congestion);
    assert_eq!(harness.ctx.registry.len(), 1);

    harness.ctx.teardown(first.index(), "test").await;
    let second = harness.connect("dev-b", true).await.unwrap();
    assert_eq!(second.response.start_port, first.response.start_port);
}
