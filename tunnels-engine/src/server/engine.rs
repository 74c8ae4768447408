//! Server data plane assembly

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::broadcast;

use super::acceptor::Acceptor;
use super::context::ServerContext;
use super::{fanout, http};
use crate::config::ServerConfig;
use crate::control_plane::ControlPlane;
use crate::error::{Error, Result};
use crate::event::{EventHandler, LoggingEventHandler};
use crate::heartbeat;
use crate::stats::{SharedStats, SharedStatsRef};
use crate::supervisor::spawn_supervised;
use crate::telemetry;

/// Runs every global server task until [`ServerEngine::stop`]
pub struct ServerEngine {
    config: Arc<ServerConfig>,
    events: Arc<dyn EventHandler>,
    control: Option<Arc<dyn ControlPlane>>,
    stats: SharedStatsRef,
    shutdown: broadcast::Sender<()>,
}

impl ServerEngine {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown, _) = broadcast::channel(1);
        Ok(Self {
            config: Arc::new(config),
            events: Arc::new(LoggingEventHandler),
            control: None,
            stats: Arc::new(SharedStats::new()),
            shutdown,
        })
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.events = handler;
        self
    }

    /// Also validate firewall tokens with the controller
    pub fn with_control_plane(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn stats(&self) -> SharedStatsRef {
        self.stats.clone()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Bind every socket, then serve until stopped
    pub async fn run(&self) -> Result<()> {
        telemetry::require_privileges()?;
        let mut stopped = self.shutdown.subscribe();

        let data_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.data_port);
        let socket = UdpSocket::bind(data_addr)
            .await
            .map_err(|e| Error::Transport(format!("bind data port {}: {}", data_addr, e)))?;
        log::info!(
            "Data port {} (public {})",
            data_addr,
            self.config.data_addr()
        );

        let raw = open_raw_sender()?;
        let ctx = ServerContext::new(
            self.config.clone(),
            Arc::new(socket),
            raw,
            self.events.clone(),
            self.stats.clone(),
        )?;

        let mut acceptor = Acceptor::from_config(ctx.clone())?;
        if let Some(control) = &self.control {
            acceptor = acceptor.with_control_plane(control.clone());
        }
        let acceptor = Arc::new(acceptor);
        let tls = http::load_tls_acceptor(&self.config.tls_cert, &self.config.tls_key)?;
        let listener = Arc::new(
            TcpListener::bind(self.config.handshake_listen)
                .await
                .map_err(|e| {
                    Error::Transport(format!("bind {}: {}", self.config.handshake_listen, e))
                })?,
        );

        let mut tasks = Vec::new();
        {
            let ctx = ctx.clone();
            tasks.push(spawn_supervised("data listener", &self.shutdown, move || {
                fanout::run_datagram_listener(ctx.clone())
            }));
        }
        tasks.extend(spawn_raw_listeners(&ctx, &self.shutdown)?);
        {
            let ctx = ctx.clone();
            tasks.push(spawn_supervised("server heartbeat", &self.shutdown, move || {
                heartbeat::run_server(ctx.clone())
            }));
        }
        {
            let ctx = ctx.clone();
            tasks.push(spawn_supervised("idle reaper", &self.shutdown, move || {
                heartbeat::run_reaper(ctx.clone())
            }));
        }
        tasks.push(spawn_supervised("handshake endpoint", &self.shutdown, move || {
            http::serve(acceptor.clone(), listener.clone(), tls.clone())
        }));

        log::info!(
            "Server {} up: {} port slots, LAN {}",
            self.config.server_id,
            ctx.slots.free_slots(),
            self.config.lan_cidr
        );

        let _ = stopped.recv().await;
        log::info!("Server shutting down");
        ctx.teardown_all("server shutting down").await;
        futures::future::join_all(tasks).await;
        Ok(())
    }
}

#[cfg(unix)]
fn open_raw_sender() -> Result<Arc<dyn super::raw::RawSender>> {
    Ok(Arc::new(super::raw::RawSocketSender::open()?))
}

#[cfg(not(unix))]
fn open_raw_sender() -> Result<Arc<dyn super::raw::RawSender>> {
    Err(Error::Permission("raw sockets are only supported on unix".into()))
}

#[cfg(unix)]
fn spawn_raw_listeners(
    ctx: &Arc<ServerContext>,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    use super::raw::{run_listener, RawListener, RawReceiver};
    use tnl_protocol::Transport;

    let mut tasks = Vec::new();
    for (name, transport) in [("raw tcp", Transport::Tcp), ("raw udp", Transport::Udp)] {
        let receiver: Arc<dyn RawReceiver> =
            Arc::new(RawListener::open(transport, ctx.config.raw_bind())?);
        let ctx = ctx.clone();
        tasks.push(spawn_supervised(name, shutdown, move || {
            run_listener(
                receiver.clone(),
                ctx.slots.clone(),
                ctx.pool.clone(),
                ctx.stats.clone(),
            )
        }));
    }
    Ok(tasks)
}

#[cfg(not(unix))]
fn spawn_raw_listeners(
    _ctx: &Arc<ServerContext>,
    _shutdown: &broadcast::Sender<()>,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    Err(Error::Permission("raw sockets are only supported on unix".into()))
}
