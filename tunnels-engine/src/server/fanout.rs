//! Per-client packet fan-out
//!
//! The data-port listener opens each datagram with the sealer its index
//! names and queues the plaintext on that session's `from_user` channel.
//! Two tasks per session drain the channels:
//!
//! - `from_user`: heartbeats update liveness; LAN packets go straight onto
//!   the target session's `to_user` queue; the rest leave through the raw
//!   socket after the access policy.
//! - `to_user`: LAN packets pass the session's firewall, then everything is
//!   sealed and sent to the client's UDP address.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tnl_protocol::{frame, ipv4, ClientPing, PooledBuffer, SessionIndex};

use super::context::ServerContext;
use super::session::ServerSession;
use crate::error::Result;
use crate::stats::DropReason;

/// Destinations on the server's own or any private network
fn is_local_destination(dst: Ipv4Addr) -> bool {
    dst.is_private()
        || dst.is_loopback()
        || dst.is_link_local()
        || dst.is_broadcast()
        || dst.is_unspecified()
}

/// Route one opened client packet
pub async fn handle_from_user(
    ctx: &ServerContext,
    session: &ServerSession,
    packet: PooledBuffer,
) -> Result<()> {
    if frame::is_ping(&packet) {
        session.on_client_ping(ClientPing::decode(&packet).stats);
        return Ok(());
    }
    let info = match ipv4::parse(&packet) {
        Ok(info) => info,
        Err(e) => {
            ctx.stats
                .record_drop(DropReason::from_protocol(&e).unwrap_or(DropReason::Malformed));
            return Ok(());
        }
    };

    if ctx.vpl.contains(info.dst) {
        if session.lease.as_ref().map(|l| l.ip) != Some(info.src) {
            ctx.stats.record_drop(DropReason::Policy);
            return Ok(());
        }
        let target = ctx.vpl.lookup(info.dst);
        session
            .firewall
            .on_outbound(info.dst, info.dst_port, info.tcp_flags, target.is_some());
        match target {
            Some(target) => {
                target.enqueue_to_user(packet);
            }
            None => ctx.stats.record_drop(DropReason::NoSession),
        }
        return Ok(());
    }

    let owns_port = session
        .slot()
        .is_some_and(|(_, range)| range.contains(info.src_port));
    let allowed = ctx.config.internet_access
        && (ctx.config.local_network_access || !is_local_destination(info.dst));
    if !owns_port || !allowed {
        ctx.stats.record_drop(DropReason::Policy);
        return Ok(());
    }
    ctx.raw.send_raw(&packet).await
}

/// Deliver one packet to the client
pub async fn handle_to_user(
    ctx: &ServerContext,
    session: &ServerSession,
    packet: PooledBuffer,
    wire: &mut Vec<u8>,
) -> Result<()> {
    let Some(peer) = session.peer() else {
        ctx.stats.record_drop(DropReason::NoSession);
        return Ok(());
    };
    let info = match ipv4::parse(&packet) {
        Ok(info) => info,
        Err(_) => {
            ctx.stats.record_drop(DropReason::Malformed);
            return Ok(());
        }
    };
    if ctx.vpl.contains(info.src) {
        let enforce = !ctx.config.lan_firewall_disabled && !session.net_admin;
        if !session
            .firewall
            .on_inbound(info.src, info.src_port, info.tcp_flags, enforce)
        {
            ctx.stats.record_drop(DropReason::Firewall);
            return Ok(());
        }
    }

    wire.clear();
    session.sealer.seal_into(&packet, wire)?;
    ctx.socket.send_to(wire, peer).await?;
    ctx.stats.record_tx(packet.len());
    Ok(())
}

/// Start the two fan-out tasks of `session`; a failing task tears it down
pub fn spawn_session_tasks(ctx: &Arc<ServerContext>, session: &Arc<ServerSession>) {
    let Some(queues) = session.take_queues() else {
        return;
    };

    let mut from_user = queues.from_user;
    let (task_ctx, task_session) = (ctx.clone(), session.clone());
    tokio::spawn(async move {
        let mut closed = task_session.closed_signal();
        let result = loop {
            let packet = tokio::select! {
                _ = closed.wait_for(|c| *c) => break Ok(()),
                packet = from_user.recv() => match packet {
                    Some(packet) => packet,
                    None => break Ok(()),
                },
            };
            if let Err(e) = handle_from_user(&task_ctx, &task_session, packet).await {
                break Err(e);
            }
        };
        finish(&task_ctx, task_session.index, "from-user", result).await;
    });

    let mut to_user = queues.to_user;
    let (task_ctx, task_session) = (ctx.clone(), session.clone());
    tokio::spawn(async move {
        let mut closed = task_session.closed_signal();
        let mut wire = Vec::with_capacity(tnl_protocol::IFACE_BUFSIZE + tnl_protocol::FRAME_OVERHEAD);
        let result = loop {
            let packet = tokio::select! {
                _ = closed.wait_for(|c| *c) => break Ok(()),
                packet = to_user.recv() => match packet {
                    Some(packet) => packet,
                    None => break Ok(()),
                },
            };
            if let Err(e) = handle_to_user(&task_ctx, &task_session, packet, &mut wire).await {
                break Err(e);
            }
        };
        finish(&task_ctx, task_session.index, "to-user", result).await;
    });
}

async fn finish(ctx: &ServerContext, index: SessionIndex, task: &str, result: Result<()>) {
    if let Err(e) = result {
        log::warn!("Session {} {} task failed: {}", index, task, e);
        ctx.teardown(index, &format!("{} task failed: {}", task, e))
            .await;
    }
}

/// Open datagrams on the data port and queue them per session
pub async fn run_datagram_listener(ctx: Arc<ServerContext>) -> Result<()> {
    let mut buf = vec![0u8; tnl_protocol::IFACE_BUFSIZE + tnl_protocol::FRAME_OVERHEAD];
    loop {
        let (n, from) = ctx.socket.recv_from(&mut buf).await?;
        let datagram = &buf[..n];

        let Some(index) = frame::peek_index(datagram) else {
            ctx.stats.record_drop(DropReason::Malformed);
            continue;
        };
        let Some(session) = ctx.session(SessionIndex(index)) else {
            ctx.stats.record_drop(DropReason::NoSession);
            continue;
        };

        let mut plain = ctx.pool.get();
        if let Err(e) = session.sealer.open_into(datagram, &mut plain) {
            // A forged datagram must not tear down the session it names
            log::trace!("Datagram from {} for session {} dropped: {}", from, index, e);
            ctx.stats
                .record_drop(DropReason::from_protocol(&e).unwrap_or(DropReason::Malformed));
            continue;
        }
        session.set_peer(from);
        ctx.stats.record_rx(n);
        session.enqueue_from_user(plain);
    }
}
