//! Client engine: tunnels by tag, their reconnect policy and the local resolver
//!
//! Session tasks report abnormal exits on a monitor channel. [`ClientEngine::run`]
//! drains it and applies the policy from the root config:
//!
//! - `autoReconnect`: negotiate a new session against the same server and
//!   keep the interface, retrying with backoff;
//! - otherwise with `killSwitch`: stop the session but leave the interface
//!   and its routes in place so nothing leaks around the tunnel;
//! - otherwise: tear the tunnel down.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tnl_dns::{
    Blocklist, DnsCache, DnsServer, HttpListFetcher, ListFetcher, Overrides, Resolver, TunnelDns,
    UpstreamClient,
};
use tnl_protocol::{NicFactory, SessionState, VirtualNic};
use tokio::sync::{broadcast, mpsc};

use super::session::{ClientSession, ExitReason, SessionExit};
use crate::config::{RootConfig, TunnelConfig};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::event::{EngineEvent, EventHandler, LoggingEventHandler};
use crate::handshake::FirewallRequest;
use crate::negotiator::{NegotiateRequest, Negotiated, SessionNegotiator};
use crate::state::{AppState, StatePaths};
use crate::stats::{SharedStats, SharedStatsRef};
use crate::supervisor::spawn_supervised;

pub const RECONNECT_BACKOFF_MIN: Duration = Duration::from_secs(1);

pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Local resolver built from the root config
pub fn build_resolver(root: &RootConfig, paths: &StatePaths) -> Result<Arc<Resolver>> {
    let config = root.resolver_config();
    let upstream = UpstreamClient::new(config.upstream_specs()?, config.upstream_timeout())?;
    Ok(Arc::new(Resolver::new(
        Arc::new(upstream),
        Arc::new(DnsCache::new(config.cache_size)),
        Arc::new(Blocklist::new(paths.blocklist_dir(), root.blocklists.clone())),
        Arc::new(Overrides::new()),
    )))
}

pub struct ClientEngine {
    state: Arc<AppState>,
    credentials: Credentials,
    negotiator: SessionNegotiator,
    nics: Arc<dyn NicFactory>,
    resolver: Option<Arc<Resolver>>,
    events: Arc<dyn EventHandler>,
    stats: SharedStatsRef,
    sessions: Mutex<HashMap<String, Arc<ClientSession>>>,
    monitor_tx: mpsc::UnboundedSender<SessionExit>,
    monitor_rx: Mutex<Option<mpsc::UnboundedReceiver<SessionExit>>>,
    shutdown: broadcast::Sender<()>,
}

impl ClientEngine {
    pub fn new(
        state: Arc<AppState>,
        credentials: Credentials,
        negotiator: SessionNegotiator,
        nics: Arc<dyn NicFactory>,
    ) -> Self {
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Self {
            state,
            credentials,
            negotiator,
            nics,
            resolver: None,
            events: Arc::new(LoggingEventHandler),
            stats: Arc::new(SharedStats::new()),
            sessions: Mutex::new(HashMap::new()),
            monitor_tx,
            monitor_rx: Mutex::new(Some(monitor_rx)),
            shutdown,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    pub fn stats(&self) -> SharedStatsRef {
        self.stats.clone()
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn resolver(&self) -> Option<&Arc<Resolver>> {
        self.resolver.as_ref()
    }

    /// Current session of `tag`, closed or not
    pub fn session(&self, tag: &str) -> Option<Arc<ClientSession>> {
        self.lock_sessions().get(tag).cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.lock_sessions().values().cloned().collect()
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<ClientSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether `tag` is still served by the session `id`
    fn holds(&self, tag: &str, id: tnl_protocol::SessionId) -> bool {
        self.lock_sessions().get(tag).is_some_and(|s| s.id == id)
    }

    fn request_for(&self, tunnel: &TunnelConfig) -> NegotiateRequest {
        let mut request = NegotiateRequest::for_tunnel(tunnel, &self.credentials);
        if request.server_id.is_empty() {
            request.server_id = self.state.root().server_id.clone();
        }
        request
    }

    async fn emit(&self, event: EngineEvent) {
        self.events.on_event(event).await;
    }

    async fn set_state(&self, session: &ClientSession, to: SessionState) -> Result<()> {
        let old = session.transition(to)?;
        self.emit(EngineEvent::StateChanged {
            tag: session.tag.clone(),
            old,
            new: to,
        })
        .await;
        Ok(())
    }

    /// Negotiate and bring up `tag`
    pub async fn connect(&self, tag: &str) -> Result<Arc<ClientSession>> {
        let tunnel = self
            .state
            .tunnel(tag)
            .ok_or_else(|| Error::NotFound(format!("tunnel '{}'", tag)))?;
        let existing = self.session(tag);
        if existing.as_ref().is_some_and(|s| !s.is_closed()) {
            return Err(Error::Conflict(format!("tunnel '{}' is already connected", tag)));
        }

        self.emit(EngineEvent::StateChanged {
            tag: tag.to_string(),
            old: SessionState::Init,
            new: SessionState::Negotiating,
        })
        .await;
        let request = self.request_for(&tunnel);
        let negotiated = {
            let _dns = self.resolver.as_ref().map(|r| r.lock());
            self.negotiator.negotiate(&request).await
        };
        let negotiated = match negotiated {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.emit(EngineEvent::error(&e)).await;
                return Err(e);
            }
        };

        let (nic, reused) = match existing {
            Some(previous) => (previous.nic().clone(), true),
            None => (self.nics.open(&tunnel.nic_config()).await?, false),
        };
        match self.install(&tunnel, negotiated, nic.clone(), reused).await {
            Ok(session) => Ok(session),
            Err(e) => {
                if !reused {
                    let _ = nic.close().await;
                }
                self.emit(EngineEvent::error(&e)).await;
                Err(e)
            }
        }
    }

    /// Routes, DNS, firewall sync, then the session itself
    async fn install(
        &self,
        tunnel: &TunnelConfig,
        negotiated: Negotiated,
        nic: Arc<dyn VirtualNic>,
        reused: bool,
    ) -> Result<Arc<ClientSession>> {
        let params = &negotiated.params;

        let mut nets = params.routes.clone();
        nets.extend(params.networks.iter().map(|rule| rule.nat));
        if let Some(lan) = params.lan {
            nets.push(lan.nat);
        }
        for net in nets {
            if let Err(e) = nic.add_route(net).await {
                if !reused {
                    return Err(e.into());
                }
                log::debug!("[{}] route {} kept from the previous session: {}", tunnel.tag, net, e);
            }
        }

        if let Some(resolver) = &self.resolver {
            let tunnel_dns = params.dns_servers.first().map(|ip| TunnelDns {
                tag: tunnel.tag.clone(),
                server: SocketAddr::new(IpAddr::V4(*ip), 53),
                bind: nic.info().address,
            });
            resolver
                .overrides()
                .install(&tunnel.tag, &tunnel.dns_records, tunnel_dns);
            resolver.cache().clear();
        }

        if let Some(lease) = &params.dhcp {
            let firewall = &tunnel.lan_firewall;
            if firewall.disabled || !firewall.hosts.is_empty() {
                let request = FirewallRequest {
                    dhcp_token: lease.token.clone(),
                    ip: lease.ip,
                    hosts: firewall.hosts.clone(),
                    disable_firewall: firewall.disabled,
                };
                if let Err(e) = self
                    .negotiator
                    .connector()
                    .sync_firewall(&negotiated.server, &request)
                    .await
                {
                    log::warn!("[{}] LAN firewall sync failed: {}", tunnel.tag, e);
                }
            }
        }

        let session = ClientSession::new(
            &tunnel.tag,
            negotiated,
            nic.clone(),
            tunnel.normalize_rst,
            self.stats.clone(),
        );
        self.set_state(&session, SessionState::Connected).await?;
        session.start(self.state.root().send_stats, self.monitor_tx.clone());

        let active = {
            let mut sessions = self.lock_sessions();
            sessions.insert(tunnel.tag.clone(), session.clone());
            sessions.values().filter(|s| !s.is_closed()).count()
        };
        self.stats.set_active_sessions(active);

        log::info!(
            "[{}] connected: session {}, interface {}, LAN {:?}",
            tunnel.tag,
            session.index,
            nic.info().address,
            session.vpl_ip()
        );
        self.emit(EngineEvent::Connected {
            tag: tunnel.tag.clone(),
            index: session.index,
            interface_ip: nic.info().address,
            vpl_ip: session.vpl_ip(),
        })
        .await;
        Ok(session)
    }

    /// Tear `tag` down and close its interface
    pub async fn disconnect(&self, tag: &str) -> Result<()> {
        let session = self
            .lock_sessions()
            .remove(tag)
            .ok_or_else(|| Error::NotFound(format!("tunnel '{}' is not connected", tag)))?;
        self.teardown(&session, "disconnected", true).await;
        Ok(())
    }

    /// Queries stay stalled until the teardown, its event included, is done
    async fn teardown(&self, session: &ClientSession, reason: &str, close_nic: bool) {
        let _dns = self.resolver.as_ref().map(|r| r.lock());
        session.close();
        if let Some(resolver) = &self.resolver {
            resolver.overrides().remove(&session.tag);
        }
        if close_nic {
            if let Err(e) = session.nic().close().await {
                log::warn!("[{}] closing interface: {}", session.tag, e);
            }
        }
        let active = self.lock_sessions().values().filter(|s| !s.is_closed()).count();
        self.stats.set_active_sessions(active);
        log::info!("[{}] disconnected: {}", session.tag, reason);
        self.emit(EngineEvent::Disconnected {
            tag: session.tag.clone(),
            reason: reason.to_string(),
        })
        .await;
    }

    /// Apply the reconnect policy to a session whose task stopped
    async fn handle_exit(self: &Arc<Self>, exit: SessionExit) {
        let Some(session) = self.session(&exit.tag) else {
            return;
        };
        if session.id != exit.id || session.is_closed() {
            return;
        }

        let reason = match &exit.reason {
            ExitReason::Failed(e) => {
                log::warn!("[{}] {} failed: {}", exit.tag, exit.task, e);
                self.emit(EngineEvent::error(e)).await;
                format!("{} failed: {}", exit.task, e)
            }
            ExitReason::HeartbeatTimeout => "heartbeat timeout".to_string(),
        };
        // The heartbeat task has already moved to NotReady on timeout
        let _ = session.transition(SessionState::NotReady);
        self.emit(EngineEvent::StateChanged {
            tag: exit.tag.clone(),
            old: SessionState::Connected,
            new: SessionState::NotReady,
        })
        .await;

        let root = self.state.root();
        if root.auto_reconnect {
            tokio::spawn(self.clone().reconnect(session));
        } else if root.kill_switch {
            // Entry stays so a later disconnect closes the interface
            self.teardown(&session, &format!("{}; kill switch holds routes", reason), false)
                .await;
        } else {
            self.lock_sessions().remove(&exit.tag);
            self.teardown(&session, &reason, true).await;
        }
    }

    /// New session against the same server, on the same interface
    async fn reconnect(self: Arc<Self>, old: Arc<ClientSession>) {
        old.close();
        let tag = old.tag.clone();
        let mut shutdown = self.shutdown.subscribe();
        let mut backoff = RECONNECT_BACKOFF_MIN;

        loop {
            if !self.holds(&tag, old.id) {
                return;
            }
            let Some(tunnel) = self.state.tunnel(&tag) else {
                self.lock_sessions().remove(&tag);
                self.teardown(&old, "tunnel removed", true).await;
                return;
            };

            self.emit(EngineEvent::StateChanged {
                tag: tag.clone(),
                old: SessionState::NotReady,
                new: SessionState::Negotiating,
            })
            .await;
            let request = self.request_for(&tunnel);
            let result = {
                let _dns = self.resolver.as_ref().map(|r| r.lock());
                self.negotiator
                    .negotiate_with_server(old.server().clone(), &request)
                    .await
            };
            match result {
                Ok(negotiated) if self.holds(&tag, old.id) => {
                    match self.install(&tunnel, negotiated, old.nic().clone(), true).await {
                        Ok(session) => {
                            log::info!("[{}] reconnected as session {}", tag, session.index);
                            return;
                        }
                        Err(e) => log::warn!("[{}] reconnect failed: {}", tag, e),
                    }
                }
                Ok(_) => return,
                Err(e) => {
                    log::warn!("[{}] reconnect failed: {}, retrying in {:?}", tag, e, backoff);
                    self.emit(EngineEvent::error(&e)).await;
                }
            }

            tokio::select! {
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }
    }

    /// Download blocklists, swap the merged set and persist the counts
    pub async fn refresh_blocklists(&self, fetcher: &dyn ListFetcher) -> Result<usize> {
        let Some(resolver) = &self.resolver else {
            return Ok(0);
        };
        let blocklist = resolver.blocklist();
        let count = blocklist.refresh(fetcher).await?;
        let sources = blocklist.sources();
        self.state.update_root(|root| {
            for source in &sources {
                if let Some(slot) = root.blocklists.iter_mut().find(|s| s.tag == source.tag) {
                    slot.count = source.count;
                    slot.last_download = source.last_download;
                }
            }
        })?;
        Ok(count)
    }

    fn spawn_dns_tasks(self: &Arc<Self>, resolver: &Arc<Resolver>) -> Result<()> {
        let root = self.state.root();

        let listen = root.dns_listen;
        let shutdown = self.shutdown.clone();
        let listener_resolver = resolver.clone();
        spawn_supervised("dns listener", &self.shutdown, move || {
            let resolver = listener_resolver.clone();
            let stop = shutdown.subscribe();
            async move {
                DnsServer::bind(listen, resolver, stop).await?.run().await?;
                Ok(())
            }
        });

        tokio::spawn(
            resolver
                .cache()
                .clone()
                .run_cleaner(root.resolver_config().cache_clean_interval(), self.shutdown.subscribe()),
        );

        let fetcher: Arc<dyn ListFetcher> = Arc::new(HttpListFetcher::new()?);
        let engine = self.clone();
        let period = root.blocklist_refresh_interval();
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            if let Some(resolver) = &engine.resolver {
                if let Err(e) = resolver.blocklist().load_from_disk().await {
                    log::warn!("Blocklists not loaded from disk: {}", e);
                }
            }
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stop.recv() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = engine.refresh_blocklists(fetcher.as_ref()).await {
                            log::warn!("Blocklist refresh failed: {}", e);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Serve the resolver and the session monitor until [`ClientEngine::stop`]
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut monitor = self
            .monitor_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Conflict("engine is already running".into()))?;
        let mut shutdown = self.shutdown.subscribe();

        if let Some(resolver) = self.resolver.clone() {
            self.spawn_dns_tasks(&resolver)?;
        }

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                exit = monitor.recv() => match exit {
                    Some(exit) => self.handle_exit(exit).await,
                    None => break,
                },
            }
        }

        let sessions: Vec<_> = self.lock_sessions().drain().map(|(_, s)| s).collect();
        for session in sessions {
            self.teardown(&session, "engine stopped", true).await;
        }
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}
