//! Heartbeats, liveness and periodic sweeps
//!
//! Clients send a sealed [`ClientPing`] every [`PING_INTERVAL`]; the server
//! answers on its own timer with a [`ServerPing`]. A client that hears
//! nothing for [`LIVENESS_TIMEOUT`] marks its session `NotReady` and reports
//! a heartbeat timeout to the engine monitor.

use std::sync::Arc;
use std::time::Duration;

use tnl_protocol::{ports::SWEEP_INTERVAL, ClientPing, HostStats, ServerPing, SessionState};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::client::session::{ClientSession, ExitReason};
use crate::error::Result;
use crate::server::context::ServerContext;
use crate::telemetry;

pub const PING_INTERVAL: Duration = Duration::from_secs(10);

pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);

/// Interval between idle-session scans on the server
pub const REAP_INTERVAL: Duration = Duration::from_secs(10);

fn local_stats(send_stats: bool) -> HostStats {
    if send_stats {
        telemetry::host_stats()
    } else {
        HostStats::default()
    }
}

/// True when the server has been silent for longer than the liveness window
pub fn is_stale(last_ping_at: Instant, now: Instant) -> bool {
    now.saturating_duration_since(last_ping_at) > LIVENESS_TIMEOUT
}

/// Client heartbeat; returns `HeartbeatTimeout` when the server goes quiet
pub async fn run_client(
    session: Arc<ClientSession>,
    send_stats: bool,
) -> Result<Option<ExitReason>> {
    let mut closed = session.closed_signal();
    let mut ticker = interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires at once; the negotiator already sent a ping
    ticker.tick().await;

    let mut wire = Vec::with_capacity(64);
    loop {
        tokio::select! {
            _ = closed.wait_for(|c| *c) => return Ok(None),
            _ = ticker.tick() => {}
        }

        if is_stale(session.last_ping_at(), Instant::now()) {
            log::warn!(
                "[{}] no server ping for {:?}, session {} not ready",
                session.tag,
                LIVENESS_TIMEOUT,
                session.index
            );
            session.transition(SessionState::NotReady)?;
            return Ok(Some(ExitReason::HeartbeatTimeout));
        }

        let ping = ClientPing {
            stats: local_stats(send_stats),
            counter: session.next_ping_counter(),
        };
        wire.clear();
        session.sealer.seal_into(&ping.encode(), &mut wire)?;
        session.socket.send(&wire).await?;
        log::trace!("[{}] ping #{}", session.tag, ping.counter);
    }
}

/// Reclaim idle port mappings of a client session until it closes
pub async fn run_sweeper(session: Arc<ClientSession>) {
    let Some(ports) = &session.translator.ports else {
        return;
    };
    let mut closed = session.closed_signal();
    let mut ticker = interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = closed.wait_for(|c| *c) => return,
            _ = ticker.tick() => {}
        }
        let removed = ports.sweep_at(Instant::now().into_std());
        if removed > 0 {
            log::debug!("[{}] swept {} port mappings", session.tag, removed);
        }
    }
}

/// Send one server ping to every session with a known peer
pub async fn ping_clients(ctx: &ServerContext) -> usize {
    let payload = ServerPing::now(telemetry::host_stats()).encode();
    let mut wire = Vec::with_capacity(64);
    let mut sent = 0;
    for session in ctx.registry.sessions() {
        let Some(peer) = session.peer() else {
            continue;
        };
        wire.clear();
        if let Err(e) = session.sealer.seal_into(&payload, &mut wire) {
            log::warn!("Session {} ping not sealed: {}", session.index, e);
            continue;
        }
        match ctx.socket.send_to(&wire, peer).await {
            Ok(_) => sent += 1,
            Err(e) => log::debug!("Session {} ping to {} failed: {}", session.index, peer, e),
        }
    }
    sent
}

/// Server ping timer
pub async fn run_server(ctx: Arc<ServerContext>) -> Result<()> {
    let mut ticker = interval(PING_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        ping_clients(&ctx).await;
    }
}

/// Tear down sessions whose clients stopped pinging
pub async fn run_reaper(ctx: Arc<ServerContext>) -> Result<()> {
    let mut ticker = interval(REAP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        for index in ctx.idle_sessions_at(Instant::now()) {
            ctx.teardown(index, "idle timeout").await;
        }
    }
}
