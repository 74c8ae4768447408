//! UDP → TUN
//!
//! Opens datagrams from the server. Short plaintexts are heartbeats; the
//! rest are IPv4 packets whose translation is reversed before they are
//! written to the interface.

use std::sync::Arc;
use std::time::Instant;

use tnl_protocol::{frame, nat, Ipv4Packet};

use super::session::{ClientSession, ExitReason, Translator};
use crate::error::{Error, Result};
use crate::stats::DropReason;

/// Restore one inbound packet in place
pub fn transform(t: &Translator, packet: &mut [u8], now: Instant) -> tnl_protocol::Result<()> {
    let mut pkt = Ipv4Packet::new(packet)?;
    let src = pkt.src();

    match t.vpl.filter(|v| v.is_vpl(src)) {
        Some(vpl) => {
            pkt.set_src(nat::rewrite_prefix(src, vpl.lan.nat));
            pkt.set_dst(t.local_ip);
        }
        None => {
            let ports = t.ports.as_ref().ok_or(tnl_protocol::Error::NoMapping)?;
            let peer = t.nat.ingress(src).unwrap_or(src);
            let mapping = ports
                .for_transport(pkt.transport())
                .lookup_reverse_at(pkt.dst_port(), peer, pkt.src_port(), now)
                .ok_or(tnl_protocol::Error::NoMapping)?;
            if let Some(flags) = pkt.tcp_flags() {
                mapping.observe(flags);
            }
            pkt.set_src(peer);
            pkt.set_dst(mapping.orig_src());
            pkt.set_dst_port(mapping.orig_src_port());
        }
    }
    pkt.recalculate_checksums()
}

/// Ingress loop; returns `Ok(None)` when the session closes
pub(crate) async fn run(session: Arc<ClientSession>) -> Result<Option<ExitReason>> {
    let mut closed = session.closed_signal();
    let mut datagram = vec![0u8; tnl_protocol::IFACE_BUFSIZE + tnl_protocol::FRAME_OVERHEAD];
    let mut plain = Vec::with_capacity(tnl_protocol::IFACE_BUFSIZE);
    let counters = &session.stats;

    loop {
        let n = tokio::select! {
            _ = closed.wait_for(|c| *c) => return Ok(None),
            recv = session.socket.recv(&mut datagram) => match recv {
                Ok(n) => n,
                Err(_) if session.is_closed() => return Ok(None),
                Err(e) => return Err(Error::Transport(format!("udp recv: {}", e))),
            },
        };

        plain.clear();
        match session.sealer.open_into(&datagram[..n], &mut plain) {
            Ok(_) => {}
            Err(tnl_protocol::Error::AuthFailed) => {
                return Err(Error::Auth(format!(
                    "datagram failed authentication on session {}",
                    session.index
                )));
            }
            Err(e) => {
                let reason = DropReason::from_protocol(&e).unwrap_or(DropReason::Malformed);
                log::trace!("[{}] ingress drop: {}", session.tag, e);
                counters.record_drop(reason);
                continue;
            }
        }

        if frame::is_ping(&plain) {
            session.on_server_ping(&plain);
            continue;
        }

        if let Err(e) = transform(&session.translator, &mut plain, tokio::time::Instant::now().into_std()) {
            match DropReason::from_protocol(&e) {
                Some(reason) => {
                    log::trace!("[{}] ingress drop: {}", session.tag, e);
                    counters.record_drop(reason);
                    continue;
                }
                None => return Err(e.into()),
            }
        }

        if let Err(e) = session.nic.write(&plain).await {
            if session.is_closed() {
                return Ok(None);
            }
            return Err(Error::Transport(format!("interface write: {}", e)));
        }
        counters.record_rx(plain.len());
    }
}
