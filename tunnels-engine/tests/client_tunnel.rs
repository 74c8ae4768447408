//! Client engine against an in-memory server: packet round trip, heartbeat
//! loss and the reconnect policy

use std::net::Ipv4Addr;
use std::time::Duration;

use tnl_protocol::flags::consts::*;
use tnl_protocol::transport::mock::IpPacketBuilder;
use tnl_protocol::{frame, ipv4, HostStats, ServerPing, SessionState};
use tunnels_engine::mock::{ClientHarness, LoopbackPeer, TUNNEL_TAG};
use tunnels_engine::EngineEvent;

const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 255, 0, 2);
const SERVER: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);
const REMOTE: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

/// Next non-heartbeat packet the server received
async fn next_packet(peer: &LoopbackPeer) -> Vec<u8> {
    loop {
        let plain = tokio::time::timeout(Duration::from_secs(5), peer.recv_plain())
            .await
            .unwrap()
            .unwrap();
        if !frame::is_ping(&plain) {
            return plain;
        }
    }
}

/// Poll `cond` once a second of (possibly paused) time, up to two minutes
async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..120 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_tcp_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let harness = ClientHarness::new(dir.path()).unwrap();
    harness.engine.connect(TUNNEL_TAG).await.unwrap();
    let nic = harness.nics.last().unwrap();
    let peer = harness.server.latest().unwrap();

    nic.inject(
        IpPacketBuilder::tcp(LOCAL, 50000, REMOTE, 443)
            .flags(TCP_SYN)
            .payload(b"hello")
            .build(),
    );
    let out = next_packet(&peer).await;
    let info = ipv4::parse(&out).unwrap();
    assert_eq!(info.src, SERVER);
    assert!((40000..=41000).contains(&info.src_port));
    assert_eq!((info.dst, info.dst_port), (REMOTE, 443));

    peer.send_plain(
        &IpPacketBuilder::tcp(REMOTE, 443, SERVER, info.src_port)
            .flags(TCP_SYN | TCP_ACK)
            .payload(b"world")
            .build(),
    )
    .await
    .unwrap();
    let back = tokio::time::timeout(Duration::from_secs(5), nic.next_written())
        .await
        .unwrap()
        .unwrap();
    let info = ipv4::parse(&back).unwrap();
    assert_eq!((info.src, info.src_port), (REMOTE, 443));
    assert_eq!((info.dst, info.dst_port), (LOCAL, 50000));

    let stats = harness.engine.stats().snapshot();
    assert_eq!(stats.packets_tx, 1);
    assert_eq!(stats.packets_rx, 1);
}

#[tokio::test]
async fn test_lan_packet_readdressed_to_lease() {
    let dir = tempfile::tempdir().unwrap();
    let harness = ClientHarness::new(dir.path()).unwrap();
    harness.engine.connect(TUNNEL_TAG).await.unwrap();
    let nic = harness.nics.last().unwrap();
    let peer = harness.server.latest().unwrap();

    nic.inject(IpPacketBuilder::udp(LOCAL, 5000, Ipv4Addr::new(10, 0, 0, 6), 53).build());
    let out = ipv4::parse(&next_packet(&peer).await).unwrap();
    assert_eq!(out.src, Ipv4Addr::new(10, 0, 0, 5));
    assert_eq!(out.dst, Ipv4Addr::new(10, 0, 0, 6));
    assert_eq!(out.src_port, 5000);
}

#[tokio::test]
async fn test_server_ping_keeps_session_alive() {
    let dir = tempfile::tempdir().unwrap();
    let harness = ClientHarness::new(dir.path()).unwrap();
    let session = harness.engine.connect(TUNNEL_TAG).await.unwrap();
    let peer = harness.server.latest().unwrap();

    let before = session.last_ping_at();
    let stats = HostStats {
        cpu: 12,
        mem: 34,
        disk: 56,
    };
    peer.send_plain(&ServerPing::now(stats).encode()).await.unwrap();
    eventually(|| session.last_ping_at() > before).await;
    assert_eq!(session.server_stats(), stats);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loss_reconnects_on_same_interface() {
    let dir = tempfile::tempdir().unwrap();
    let mut harness = ClientHarness::new(dir.path()).unwrap();
    let engine = harness.engine.clone();
    tokio::spawn(engine.clone().run());

    let first = engine.connect(TUNNEL_TAG).await.unwrap();
    let server = harness.server.clone();
    eventually(|| server.accepted() == 2).await;
    eventually(|| {
        engine
            .session(TUNNEL_TAG)
            .is_some_and(|s| s.id != first.id && s.state() == SessionState::Connected)
    })
    .await;

    assert!(first.is_closed());
    assert_eq!(harness.nics.opened().len(), 1);
    assert!(!harness.nics.last().unwrap().is_closed());
    assert_eq!(harness.control.sessions_created(), 2);

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::StateChanged { new: SessionState::NotReady, .. }
    )));
    let connects = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Connected { .. }))
        .count();
    assert_eq!(connects, 2);
    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loss_without_reconnect_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let harness = ClientHarness::new(dir.path()).unwrap();
    harness
        .engine
        .state()
        .update_root(|root| {
            root.auto_reconnect = false;
            root.kill_switch = false;
        })
        .unwrap();
    let engine = harness.engine.clone();
    tokio::spawn(engine.clone().run());

    let session = engine.connect(TUNNEL_TAG).await.unwrap();
    eventually(|| engine.session(TUNNEL_TAG).is_none()).await;

    assert!(session.is_closed());
    assert!(harness.nics.last().unwrap().is_closed());
    assert_eq!(harness.server.accepted(), 1);
    engine.stop();
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_loss_with_kill_switch_holds_interface() {
    let dir = tempfile::tempdir().unwrap();
    let harness = ClientHarness::new(dir.path()).unwrap();
    harness
        .engine
        .state()
        .update_root(|root| {
            root.auto_reconnect = false;
            root.kill_switch = true;
        })
        .unwrap();
    let engine = harness.engine.clone();
    tokio::spawn(engine.clone().run());

    let session = engine.connect(TUNNEL_TAG).await.unwrap();
    eventually(|| session.is_closed()).await;
    // Long enough for any reconnect backoff to have fired
    tokio::time::sleep(Duration::from_secs(120)).await;

    let nic = harness.nics.last().unwrap();
    assert!(!nic.is_closed());
    assert!(nic.routes().contains(&"10.0.0.0/16".parse().unwrap()));
    assert_eq!(harness.nics.opened().len(), 1);
    assert_eq!(harness.server.accepted(), 1);
    assert_eq!(harness.control.sessions_created(), 1);
    assert!(engine
        .session(TUNNEL_TAG)
        .is_some_and(|s| s.id == session.id && s.is_closed()));
    engine.stop();
}
