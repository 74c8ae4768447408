//! In-memory collaborators for tests
//!
//! - [`StaticControlPlane`]: knows one server and signs grants with a fixed
//!   controller key.
//! - [`LoopbackServer`]: answers `/v3/connect` like a VPN server would and
//!   hands out [`MockDatagram`] pairs as data sockets. Each accepted session
//!   is exposed as a [`LoopbackPeer`] that can read and write sealed frames.
//! - [`ServerHarness`]: a real server context over [`MemoryDatagram`] and
//!   [`CapturingSender`], plus a client side that handshakes against it.
//! - [`ClientHarness`]: a [`ClientEngine`] wired to a [`LoopbackServer`] and
//!   mock interfaces, with one tunnel tagged [`TUNNEL_TAG`].
//! - [`offline_resolver`]: a resolver whose upstream refuses every query.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::EncodePublicKey;
use ed25519_dalek::SigningKey;
use ipnet::Ipv4Net;
use tnl_dns::{Blocklist, DnsCache, Overrides, Resolver, Upstream};
use tnl_protocol::kex;
use tnl_protocol::transport::mock::{MockDatagram, MockNicFactory};
use tnl_protocol::{DatagramSocket, EncType, NatRule, Role, Sealer, SessionIndex};
use tokio::sync::mpsc;

use crate::client::ClientEngine;
use crate::config::{ServerConfig, TunnelConfig};
use crate::control_plane::{ControlPlane, MappingHandle, ServerInfo, SessionRequest};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::event::{ChannelEventHandler, EngineEvent};
use crate::handshake::{
    ConnectRequest, ConnectResponse, DhcpLease, FirewallRequest, LanInfo, SessionGrant, SignedBlob,
};
use crate::negotiator::{Dialer, ServerConnector, SessionNegotiator};
use crate::server::{Acceptor, RawSender, ServerContext, ServerDatagram};
use crate::state::AppState;
use crate::stats::SharedStats;

pub const SERVER_ID: &str = "loopback";

/// Fixed controller key
pub fn controller_key() -> SigningKey {
    SigningKey::from_bytes(&[0x11; 32])
}

/// Fixed VPN server key
pub fn server_key() -> SigningKey {
    SigningKey::from_bytes(&[0x22; 32])
}

pub fn public_pem(key: &SigningKey) -> String {
    key.verifying_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap_or_default()
}

pub fn credentials() -> Credentials {
    Credentials {
        user_id: "user-1".into(),
        device_token: "device-1".into(),
        device_key: None,
    }
}

/// Grant as the controller would sign it
pub fn grant_for(request: &SessionRequest) -> SessionGrant {
    SessionGrant {
        user_id: request.user_id.clone(),
        device_token: request
            .device_token
            .clone()
            .or_else(|| request.device_key.clone())
            .unwrap_or_default(),
        server_id: request.server_id.clone(),
        enc_type: request.enc_type,
        requesting_ports: request.requesting_ports,
        expires_at: Utc::now() + chrono::Duration::minutes(5),
    }
}

pub struct StaticControlPlane {
    server: ServerInfo,
    controller: SigningKey,
    sessions: AtomicUsize,
}

impl StaticControlPlane {
    /// Controller that knows `server` under [`SERVER_ID`]
    pub fn new(server: &LoopbackServer) -> Arc<Self> {
        Self::with_server(server.info())
    }

    pub fn with_server(server: ServerInfo) -> Arc<Self> {
        Arc::new(Self {
            server,
            controller: controller_key(),
            sessions: AtomicUsize::new(0),
        })
    }

    /// Grants issued so far
    pub fn sessions_created(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ControlPlane for StaticControlPlane {
    async fn resolve_server(&self, server_id: &str) -> Result<ServerInfo> {
        if server_id != SERVER_ID {
            return Err(Error::NotFound(format!("server {}", server_id)));
        }
        Ok(self.server.clone())
    }

    async fn create_session(&self, request: &SessionRequest) -> Result<SignedBlob> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        SignedBlob::sign(&self.controller, &grant_for(request))
    }

    async fn validate_firewall_request(&self, token: &str) -> Result<MappingHandle> {
        if token.is_empty() {
            return Err(Error::Auth("empty firewall token".into()));
        }
        Ok(MappingHandle {
            device_token: token.to_string(),
            user_id: String::new(),
        })
    }
}

/// Server-side view of one accepted session
pub struct LoopbackPeer {
    pub index: SessionIndex,
    pub grant: SessionGrant,
    pub sealer: Sealer,
    /// Server end of the data link
    pub socket: Arc<MockDatagram>,
    /// Client end, as handed to the dialer
    pub client_socket: Arc<MockDatagram>,
}

impl LoopbackPeer {
    /// Next datagram from the client, opened
    pub async fn recv_plain(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; tnl_protocol::IFACE_BUFSIZE];
        let n = self.socket.recv(&mut buf).await?;
        let mut plain = Vec::new();
        self.sealer.open_into(&buf[..n], &mut plain)?;
        Ok(plain)
    }

    pub async fn send_plain(&self, plain: &[u8]) -> Result<()> {
        let mut wire = Vec::new();
        self.sealer.seal_into(plain, &mut wire)?;
        self.socket.send(&wire).await?;
        Ok(())
    }
}

/// Settings echoed in every connect answer
#[derive(Debug, Clone)]
pub struct LoopbackParams {
    pub interface_ip: Ipv4Addr,
    pub data_port: u16,
    pub start_port: u16,
    pub end_port: u16,
    pub lease: Option<Ipv4Addr>,
    pub lan: Option<LanInfo>,
    pub networks: Vec<NatRule>,
    pub routes: Vec<Ipv4Net>,
    pub dns_servers: Vec<Ipv4Addr>,
}

impl Default for LoopbackParams {
    fn default() -> Self {
        let lan: Ipv4Net = Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 16).unwrap_or_default();
        Self {
            interface_ip: Ipv4Addr::new(192, 0, 2, 10),
            data_port: 444,
            start_port: 40000,
            end_port: 41000,
            lease: Some(Ipv4Addr::new(10, 0, 0, 5)),
            lan: Some(LanInfo { network: lan, nat: lan }),
            networks: Vec::new(),
            routes: Vec::new(),
            dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
        }
    }
}

/// Simulated VPN server for client-side tests
pub struct LoopbackServer {
    key: SigningKey,
    params: Mutex<LoopbackParams>,
    next_index: AtomicU16,
    peers: Mutex<HashMap<SessionIndex, Arc<LoopbackPeer>>>,
    pending: Mutex<Option<Arc<MockDatagram>>>,
    forge: AtomicBool,
    stall: AtomicBool,
    firewall_requests: Mutex<Vec<FirewallRequest>>,
}

impl LoopbackServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            key: server_key(),
            params: Mutex::new(LoopbackParams::default()),
            next_index: AtomicU16::new(1),
            peers: Mutex::new(HashMap::new()),
            pending: Mutex::new(None),
            forge: AtomicBool::new(false),
            stall: AtomicBool::new(false),
            firewall_requests: Mutex::new(Vec::new()),
        })
    }

    pub fn info(&self) -> ServerInfo {
        let params = self.params();
        ServerInfo {
            ip: params.interface_ip,
            port: 443,
            pubkey: public_pem(&self.key),
        }
    }

    pub fn params(&self) -> LoopbackParams {
        self.params.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_params(&self, params: LoopbackParams) {
        *self.params.lock().unwrap_or_else(|e| e.into_inner()) = params;
    }

    /// Sign answers with garbage
    pub fn forge_signatures(&self, forge: bool) {
        self.forge.store(forge, Ordering::SeqCst);
    }

    /// Never answer connect requests
    pub fn stall(&self, stall: bool) {
        self.stall.store(stall, Ordering::SeqCst);
    }

    pub fn session(&self, index: SessionIndex) -> Option<Arc<LoopbackPeer>> {
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&index)
            .cloned()
    }

    /// Most recently accepted session
    pub fn latest(&self) -> Option<Arc<LoopbackPeer>> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.values().max_by_key(|p| p.index).cloned()
    }

    pub fn accepted(&self) -> usize {
        self.peers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn firewall_requests(&self) -> Vec<FirewallRequest> {
        self.firewall_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ServerConnector for LoopbackServer {
    async fn connect(&self, _server: &ServerInfo, request: &ConnectRequest) -> Result<ConnectResponse> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let grant = request
            .signed_payload
            .verify(&controller_key().verifying_key())?;
        let (answer, keys) = kex::respond(&request.offer()?)?;

        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        let signature = if self.forge.load(Ordering::SeqCst) {
            vec![0u8; 64]
        } else {
            kex::sign_answer(&self.key, &answer, index).to_vec()
        };
        let sealer = Sealer::new(index, grant.enc_type, &keys, Role::Server)?;

        let (client_end, server_end) = MockDatagram::pair();
        let client_end = Arc::new(client_end);
        let peer = Arc::new(LoopbackPeer {
            index: SessionIndex(index),
            grant: grant.clone(),
            sealer,
            socket: Arc::new(server_end),
            client_socket: client_end.clone(),
        });
        self.peers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(SessionIndex(index), peer);
        *self.pending.lock().unwrap_or_else(|e| e.into_inner()) = Some(client_end);

        let params = self.params();
        let (start_port, end_port) = if grant.requesting_ports {
            (params.start_port, params.end_port)
        } else {
            (0, 0)
        };
        Ok(ConnectResponse {
            x25519_pub: answer.x25519_pub.to_vec(),
            mlkem_cipher: answer.mlkem_cipher.clone(),
            signature,
            index,
            interface_ip: params.interface_ip,
            data_port: params.data_port,
            start_port,
            end_port,
            networks: params.networks,
            routes: params.routes,
            dns_servers: params.dns_servers,
            dhcp: params.lease.map(|ip| DhcpLease {
                ip,
                token: grant.device_token.clone(),
                hostname: request.hostname.clone(),
            }),
            lan: params.lan,
        })
    }

    async fn sync_firewall(&self, _server: &ServerInfo, request: &FirewallRequest) -> Result<()> {
        self.firewall_requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        Ok(())
    }
}

#[async_trait]
impl Dialer for LoopbackServer {
    async fn dial(&self, addr: SocketAddr) -> Result<Arc<dyn DatagramSocket>> {
        let socket = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| Error::Transport(format!("nothing listening on {}", addr)))?;
        Ok(socket)
    }
}

/// Raw sender that records packets instead of sending them
#[derive(Default)]
pub struct CapturingSender {
    sent: Mutex<Vec<Vec<u8>>>,
    notify: tokio::sync::Notify,
    fail: AtomicBool,
}

impl CapturingSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every later send fail
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Packets sent so far
    pub fn sent_now(&self) -> Vec<Vec<u8>> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Wait for the next packet
    pub async fn next_sent(&self) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            {
                let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
                if !sent.is_empty() {
                    return sent.remove(0);
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl RawSender for CapturingSender {
    async fn send_raw(&self, packet: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Transport("raw send refused".into()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(packet.to_vec());
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Data-port socket backed by queues
pub struct MemoryDatagram {
    inbound_tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    inbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    notify: tokio::sync::Notify,
}

impl MemoryDatagram {
    pub fn new() -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            inbound_tx,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
            sent: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        })
    }

    /// Queue a datagram as if it arrived from `from`
    pub fn inject(&self, datagram: Vec<u8>, from: SocketAddr) {
        let _ = self.inbound_tx.send((datagram, from));
    }

    /// Wait for the next datagram sent to `to`
    pub async fn next_sent_to(&self, to: SocketAddr) -> Vec<u8> {
        loop {
            let notified = self.notify.notified();
            {
                let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(pos) = sent.iter().position(|(_, addr)| *addr == to) {
                    return sent.remove(pos).0;
                }
            }
            notified.await;
        }
    }

    /// Datagrams sent and not yet taken
    pub fn pending(&self) -> usize {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[async_trait]
impl ServerDatagram for MemoryDatagram {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((buf.to_vec(), addr));
        self.notify.notify_waiters();
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let (datagram, from) = self
            .inbound_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| Error::Transport("memory socket closed".into()))?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok((n, from))
    }
}

/// Small server: one /16 LAN, ten port slots of 100 ports
pub fn server_config() -> ServerConfig {
    ServerConfig {
        server_id: SERVER_ID.into(),
        interface_ip: Ipv4Addr::new(192, 0, 2, 10),
        data_port: 444,
        handshake_listen: SocketAddr::from(([127, 0, 0, 1], 0)),
        start_port: 40000,
        end_port: 41000,
        available_mbps: 1000,
        available_user_mbps: 100,
        enc_types: vec![EncType::Chacha20Poly1305, EncType::Aes256Gcm],
        vpl_enabled: true,
        lan_cidr: Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 16).unwrap_or_default(),
        vpl_nat: None,
        lan_firewall_disabled: false,
        dhcp_lease_timeout_secs: 3600,
        internet_access: true,
        local_network_access: false,
        net_admins: Vec::new(),
        dns_servers: vec![Ipv4Addr::new(1, 1, 1, 1)],
        networks: Vec::new(),
        routes: Vec::new(),
        controller_key_file: "controller.pem".into(),
        signing_key_file: "server.pem".into(),
        tls_cert: "cert.pem".into(),
        tls_key: "key.pem".into(),
        channel_depth: 64,
        session_idle_timeout_secs: 90,
    }
}

/// A connected client as seen from outside the server
pub struct HarnessClient {
    pub response: ConnectResponse,
    pub sealer: Sealer,
    /// UDP address the client's datagrams come from
    pub addr: SocketAddr,
}

impl HarnessClient {
    pub fn index(&self) -> SessionIndex {
        SessionIndex(self.response.index)
    }

    pub fn lease(&self) -> Option<Ipv4Addr> {
        self.response.dhcp.as_ref().map(|d| d.ip)
    }
}

/// Server context with in-memory sockets and the fixed test keys
pub struct ServerHarness {
    pub ctx: Arc<ServerContext>,
    pub socket: Arc<MemoryDatagram>,
    pub raw: Arc<CapturingSender>,
    pub acceptor: Acceptor,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
    clients: AtomicU16,
}

impl ServerHarness {
    /// Panics on an invalid config
    pub fn new(config: ServerConfig) -> Self {
        let socket = MemoryDatagram::new();
        let raw = CapturingSender::new();
        let (handler, events) = ChannelEventHandler::new();
        let ctx = ServerContext::new(
            Arc::new(config),
            socket.clone(),
            raw.clone(),
            Arc::new(handler),
            Arc::new(SharedStats::new()),
        )
        .unwrap_or_else(|e| panic!("test server config rejected: {}", e));
        let acceptor = Acceptor::new(
            ctx.clone(),
            controller_key().verifying_key(),
            server_key(),
        );
        Self {
            ctx,
            socket,
            raw,
            acceptor,
            events,
            clients: AtomicU16::new(1),
        }
    }

    /// Run the data-port listener in the background
    pub fn start_listener(&self) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(crate::server::fanout::run_datagram_listener(self.ctx.clone()))
    }

    /// Handshake a new client for `device`
    pub async fn connect(&self, device: &str, requesting_ports: bool) -> Result<HarnessClient> {
        let grant = SessionGrant {
            user_id: format!("user-{}", device),
            device_token: device.to_string(),
            server_id: SERVER_ID.into(),
            enc_type: EncType::Chacha20Poly1305,
            requesting_ports,
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        };
        let mut handshake = kex::ClientHandshake::new();
        let request = ConnectRequest::new(
            SignedBlob::sign(&controller_key(), &grant)?,
            &handshake.offer(),
            device,
        );
        let response = self.acceptor.handle_connect(&request).await?;
        let answer = response.answer()?;
        kex::verify_answer(
            &server_key().verifying_key(),
            &answer,
            response.index,
            &response.signature,
        )?;
        let keys = handshake.finalize(&answer)?;
        let sealer = Sealer::new(response.index, grant.enc_type, &keys, Role::Client)?;
        let n = self.clients.fetch_add(1, Ordering::SeqCst);
        Ok(HarnessClient {
            response,
            sealer,
            addr: SocketAddr::from(([198, 51, 100, (n % 250) as u8], 5000 + n)),
        })
    }

    /// Seal `plain` as `client` and deliver it to the data port
    pub fn send(&self, client: &HarnessClient, plain: &[u8]) -> Result<()> {
        let mut wire = Vec::new();
        client.sealer.seal_into(plain, &mut wire)?;
        self.socket.inject(wire, client.addr);
        Ok(())
    }

    /// Next datagram the server sent to `client`, opened
    pub async fn recv(&self, client: &HarnessClient) -> Result<Vec<u8>> {
        let wire = self.socket.next_sent_to(client.addr).await;
        let mut plain = Vec::new();
        client.sealer.open_into(&wire, &mut plain)?;
        Ok(plain)
    }
}

/// Tag of the tunnel [`ClientHarness`] creates
pub const TUNNEL_TAG: &str = "work";

/// Client engine against a [`LoopbackServer`], state under a caller-owned dir
pub struct ClientHarness {
    pub engine: Arc<ClientEngine>,
    pub server: Arc<LoopbackServer>,
    pub control: Arc<StaticControlPlane>,
    pub nics: Arc<MockNicFactory>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl ClientHarness {
    pub fn new(base: &Path) -> Result<Self> {
        Self::with_engine(base, |engine| engine)
    }

    /// Like [`ClientHarness::new`], letting `configure` finish the engine
    pub fn with_engine(
        base: &Path,
        configure: impl FnOnce(ClientEngine) -> ClientEngine,
    ) -> Result<Self> {
        let state = Arc::new(AppState::load(base)?);
        state.update_root(|root| root.dns_enabled = false)?;
        state.add_tunnel(TunnelConfig::new(TUNNEL_TAG, SERVER_ID))?;

        let server = LoopbackServer::new();
        let control = StaticControlPlane::new(&server);
        let negotiator = SessionNegotiator::new(control.clone(), server.clone(), server.clone());
        let nics = MockNicFactory::new();
        let (handler, events) = ChannelEventHandler::new();
        let engine = configure(
            ClientEngine::new(state, credentials(), negotiator, nics.clone())
                .with_event_handler(Arc::new(handler)),
        );
        Ok(Self {
            engine: Arc::new(engine),
            server,
            control,
            nics,
            events,
        })
    }

    /// Events received so far
    pub fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Upstream with no network behind it
pub struct RefusingUpstream;

#[async_trait]
impl Upstream for RefusingUpstream {
    async fn exchange(&self, _query: &[u8]) -> tnl_dns::Result<Vec<u8>> {
        Err(tnl_dns::Error::Upstream("offline".into()))
    }

    async fn exchange_via(
        &self,
        server: SocketAddr,
        _bind: Ipv4Addr,
        _query: &[u8],
    ) -> tnl_dns::Result<Vec<u8>> {
        Err(tnl_dns::Error::Upstream(format!("{} offline", server)))
    }
}

/// Resolver over [`RefusingUpstream`], blocklists under `dir`
pub fn offline_resolver(dir: &Path) -> Arc<Resolver> {
    Arc::new(Resolver::new(
        Arc::new(RefusingUpstream),
        Arc::new(DnsCache::new(64)),
        Arc::new(Blocklist::new(dir.join("blocklists"), Vec::new())),
        Arc::new(Overrides::new()),
    ))
}
