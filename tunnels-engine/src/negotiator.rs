//! Three-party session setup: client, controller, VPN server
//!
//! 1. resolve the server through the controller (`{ip, port, pubkey}`)
//! 2. ask the controller for a signed session grant
//! 3. post the grant with our X25519 and ML-KEM shares to the server
//! 4. verify the server's signature with the pinned key, derive keys
//! 5. take the index, port slot and lease from the server's answer
//! 6. dial the data socket and send one sealed empty ping
//!
//! Each network step has its own deadline. Only one negotiation runs at a
//! time per negotiator; a second caller gets [`Error::Conflict`].

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tnl_protocol::kex::{self, ClientHandshake};
use tnl_protocol::{DatagramSocket, EncType, Role, Sealer, SessionIndex, PROTOCOL_VERSION};
use tokio::net::UdpSocket;

use crate::config::TunnelConfig;
use crate::control_plane::{map_reqwest, check_status, ControlPlane, ServerInfo, SessionRequest};
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::handshake::{ConnectRequest, ConnectResponse, FirewallRequest};

/// Deadline for each handshake step
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// Talks to a VPN server's handshake endpoint
#[async_trait]
pub trait ServerConnector: Send + Sync {
    async fn connect(&self, server: &ServerInfo, request: &ConnectRequest) -> Result<ConnectResponse>;

    async fn sync_firewall(&self, server: &ServerInfo, request: &FirewallRequest) -> Result<()>;
}

/// Opens the data socket towards `interfaceIP:dataPort`
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> Result<Arc<dyn DatagramSocket>>;
}

/// [`ServerConnector`] over HTTPS with TLS 1.3
pub struct HttpsConnector {
    client: reqwest::Client,
}

impl HttpsConnector {
    pub fn new(secure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_3)
            .danger_accept_invalid_certs(!secure)
            .timeout(STEP_TIMEOUT)
            .build()
            .map_err(|e| Error::BadInput(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(server: &ServerInfo, path: &str) -> String {
        format!("https://{}:{}{}", server.ip, server.port, path)
    }
}

#[async_trait]
impl ServerConnector for HttpsConnector {
    async fn connect(&self, server: &ServerInfo, request: &ConnectRequest) -> Result<ConnectResponse> {
        let response = self
            .client
            .post(Self::url(server, "/v3/connect"))
            .json(request)
            .send()
            .await
            .map_err(|e| map_reqwest("connect", e))?;
        check_status("connect", response.status())?;
        response
            .json::<ConnectResponse>()
            .await
            .map_err(|e| map_reqwest("connect", e))
    }

    async fn sync_firewall(&self, server: &ServerInfo, request: &FirewallRequest) -> Result<()> {
        let response = self
            .client
            .post(Self::url(server, "/v3/firewall"))
            .json(request)
            .send()
            .await
            .map_err(|e| map_reqwest("firewall", e))?;
        check_status("firewall", response.status())
    }
}

/// Connected UDP sockets
pub struct UdpDialer;

#[async_trait]
impl Dialer for UdpDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<Arc<dyn DatagramSocket>> {
        let local: SocketAddr = match addr.ip() {
            IpAddr::V4(_) => "0.0.0.0:0",
            IpAddr::V6(_) => "[::]:0",
        }
        .parse()
        .map_err(|e| Error::BadInput(format!("{}", e)))?;
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::Transport(format!("udp bind: {}", e)))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("udp connect {}: {}", addr, e)))?;
        Ok(Arc::new(socket))
    }
}

/// What the client asks for
#[derive(Debug, Clone)]
pub struct NegotiateRequest {
    pub server_id: String,
    pub credentials: Credentials,
    pub enc_type: EncType,
    pub requesting_ports: bool,
    pub hostname: String,
}

impl NegotiateRequest {
    pub fn for_tunnel(tunnel: &TunnelConfig, credentials: &Credentials) -> Self {
        Self {
            server_id: tunnel.server_id.clone(),
            credentials: credentials.clone(),
            enc_type: tunnel.enc_type,
            requesting_ports: tunnel.requesting_ports,
            hostname: tunnel.hostname.clone(),
        }
    }

    fn session_request(&self) -> SessionRequest {
        let creds = &self.credentials;
        let (device_token, device_key) = if creds.uses_device_key() {
            (None, creds.device_key.clone())
        } else {
            (Some(creds.device_token.clone()), None)
        };
        SessionRequest {
            version: PROTOCOL_VERSION,
            user_id: creds.user_id.clone(),
            server_id: self.server_id.clone(),
            device_token,
            device_key,
            enc_type: self.enc_type,
            requesting_ports: self.requesting_ports,
        }
    }
}

/// A freshly established session, ready for its pipelines
pub struct Negotiated {
    pub index: SessionIndex,
    pub sealer: Arc<Sealer>,
    pub socket: Arc<dyn DatagramSocket>,
    pub params: ConnectResponse,
    pub server: ServerInfo,
}

impl std::fmt::Debug for Negotiated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiated")
            .field("index", &self.index)
            .field("server", &self.server.ip)
            .finish_non_exhaustive()
    }
}

struct Flight<'a>(&'a AtomicBool);

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SessionNegotiator {
    control: Arc<dyn ControlPlane>,
    connector: Arc<dyn ServerConnector>,
    dialer: Arc<dyn Dialer>,
    in_flight: AtomicBool,
    step_timeout: Duration,
}

impl SessionNegotiator {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        connector: Arc<dyn ServerConnector>,
        dialer: Arc<dyn Dialer>,
    ) -> Self {
        Self {
            control,
            connector,
            dialer,
            in_flight: AtomicBool::new(false),
            step_timeout: STEP_TIMEOUT,
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn connector(&self) -> &Arc<dyn ServerConnector> {
        &self.connector
    }

    pub fn is_negotiating(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn begin(&self) -> Result<Flight<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| Flight(&self.in_flight))
            .map_err(|_| Error::Conflict("a negotiation is already running".into()))
    }

    async fn step<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::time::timeout(self.step_timeout, fut)
            .await
            .map_err(|_| Error::Timeout(format!("{} exceeded {:?}", what, self.step_timeout)))?
    }

    /// Full negotiation starting from server resolution
    pub async fn negotiate(&self, request: &NegotiateRequest) -> Result<Negotiated> {
        let _flight = self.begin()?;
        let server = self
            .step("resolve server", self.control.resolve_server(&request.server_id))
            .await?;
        log::debug!(
            "Server {} resolved to {}:{}",
            request.server_id,
            server.ip,
            server.port
        );
        self.establish(server, request).await
    }

    /// Re-run from the session grant against an already resolved server
    pub async fn negotiate_with_server(
        &self,
        server: ServerInfo,
        request: &NegotiateRequest,
    ) -> Result<Negotiated> {
        let _flight = self.begin()?;
        self.establish(server, request).await
    }

    async fn establish(&self, server: ServerInfo, request: &NegotiateRequest) -> Result<Negotiated> {
        let pinned = server.verifying_key()?;

        let grant = self
            .step(
                "create session",
                self.control.create_session(&request.session_request()),
            )
            .await?;

        let mut handshake = ClientHandshake::new();
        let connect = ConnectRequest::new(grant, &handshake.offer(), &request.hostname);
        let params = self
            .step("server handshake", self.connector.connect(&server, &connect))
            .await?;

        let answer = params.answer()?;
        kex::verify_answer(&pinned, &answer, params.index, &params.signature)
            .map_err(|_| Error::Auth("server answer signature mismatch".into()))?;
        let keys = handshake.finalize(&answer)?;

        let index = SessionIndex(params.index);
        if !index.is_assignable() {
            return Err(Error::BadInput(format!("server assigned invalid index {}", index)));
        }
        let sealer = Arc::new(Sealer::new(params.index, request.enc_type, &keys, Role::Client)?);
        drop(keys);

        let data_addr = SocketAddr::new(IpAddr::V4(params.interface_ip), params.data_port);
        let socket = self
            .step("dial data socket", self.dialer.dial(data_addr))
            .await?;

        let mut wire = Vec::with_capacity(tnl_protocol::FRAME_OVERHEAD);
        sealer.seal_into(&[], &mut wire)?;
        self.step("first heartbeat", async { Ok(socket.send(&wire).await?) })
            .await?;

        log::info!(
            "Session {} established with {} (data {})",
            index,
            server.ip,
            data_addr
        );
        Ok(Negotiated {
            index,
            sealer,
            socket,
            params,
            server,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::mock::{LoopbackServer, StaticControlPlane};

    fn request() -> NegotiateRequest {
        NegotiateRequest::for_tunnel(
            &TunnelConfig::new("home", crate::mock::SERVER_ID),
            &crate::mock::credentials(),
        )
    }

    fn negotiator(server: &Arc<LoopbackServer>, control: Arc<StaticControlPlane>) -> SessionNegotiator {
        SessionNegotiator::new(control, server.clone(), server.clone())
    }

    #[tokio::test]
    async fn test_negotiate_establishes_session() {
        let server = LoopbackServer::new();
        let control = StaticControlPlane::new(&server);
        let negotiated = negotiator(&server, control).negotiate(&request()).await.unwrap();

        assert_eq!(negotiated.index, SessionIndex(1));
        assert_eq!(negotiated.params.start_port, 40000);

        // The server end received the empty ping
        let peer = server.session(negotiated.index).unwrap();
        let ping = peer.recv_plain().await.unwrap();
        assert!(ping.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_server_not_found() {
        let server = LoopbackServer::new();
        let control = StaticControlPlane::new(&server);
        let mut req = request();
        req.server_id = "nope".into();
        let err = negotiator(&server, control).negotiate(&req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_forged_answer_is_auth_error() {
        let server = LoopbackServer::new();
        server.forge_signatures(true);
        let control = StaticControlPlane::new(&server);
        let err = negotiator(&server, control).negotiate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout() {
        let server = LoopbackServer::new();
        server.stall(true);
        let control = StaticControlPlane::new(&server);
        let err = negotiator(&server, control).negotiate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_flight() {
        let server = LoopbackServer::new();
        server.stall(true);
        let control = StaticControlPlane::new(&server);
        let negotiator = Arc::new(negotiator(&server, control));

        let first = tokio::spawn({
            let negotiator = negotiator.clone();
            async move { negotiator.negotiate(&request()).await }
        });
        tokio::task::yield_now().await;
        while !negotiator.is_negotiating() {
            tokio::task::yield_now().await;
        }
        let err = negotiator.negotiate(&request()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        assert!(first.await.unwrap().is_err());
        assert!(!negotiator.is_negotiating());
    }
}
