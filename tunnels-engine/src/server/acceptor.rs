//! Responder side of the session handshake
//!
//! A `/v3/connect` request carries the controller's signed grant and the
//! client's half of the hybrid key exchange. Admission reserves an index,
//! leases a LAN address, optionally assigns a port slot, and answers with the
//! server's half signed by the server key so clients can pin it.

use std::sync::Arc;

use chrono::Utc;
use ed25519_dalek::{SigningKey, VerifyingKey};
use tnl_protocol::{kex, HandshakeAnswer, Role, Sealer, SessionIndex, SessionKeys, VplLease};

use super::context::ServerContext;
use super::fanout;
use super::session::ServerSession;
use crate::control_plane::ControlPlane;
use crate::error::{Error, Result};
use crate::event::EngineEvent;
use crate::handshake::{
    ConnectRequest, ConnectResponse, DhcpLease, FirewallRequest, LanInfo, SessionGrant,
};

pub struct Acceptor {
    ctx: Arc<ServerContext>,
    controller_key: VerifyingKey,
    signing_key: SigningKey,
    control: Option<Arc<dyn ControlPlane>>,
}

fn read_pem(what: &str, path: &std::path::Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::BadInput(format!("{} {}: {}", what, path.display(), e)))
}

impl Acceptor {
    pub fn new(ctx: Arc<ServerContext>, controller_key: VerifyingKey, signing_key: SigningKey) -> Self {
        Self {
            ctx,
            controller_key,
            signing_key,
            control: None,
        }
    }

    /// Load both keys from the PEM files named in the server config
    pub fn from_config(ctx: Arc<ServerContext>) -> Result<Self> {
        let controller = read_pem("controller key", &ctx.config.controller_key_file)?;
        let signing = read_pem("signing key", &ctx.config.signing_key_file)?;
        Ok(Self::new(
            ctx,
            kex::verifying_key_from_pem(&controller)?,
            kex::signing_key_from_pem(&signing)?,
        ))
    }

    /// Check firewall tokens with the controller as well as locally
    pub fn with_control_plane(mut self, control: Arc<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    fn check_grant(&self, grant: &SessionGrant) -> Result<()> {
        let config = &self.ctx.config;
        if !config.server_id.is_empty() && grant.server_id != config.server_id {
            return Err(Error::Auth(format!(
                "grant is for server {}, not {}",
                grant.server_id, config.server_id
            )));
        }
        if grant.is_expired_at(Utc::now()) {
            return Err(Error::Auth("grant expired".into()));
        }
        if !config.accepts(grant.enc_type) {
            return Err(Error::BadInput(format!("enc type {} not accepted", grant.enc_type)));
        }
        Ok(())
    }

    /// Admit a client and build the `/v3/connect` answer
    pub async fn handle_connect(&self, request: &ConnectRequest) -> Result<ConnectResponse> {
        let grant = request.signed_payload.verify(&self.controller_key)?;
        self.check_grant(&grant)?;
        let (answer, keys) = kex::respond(&request.offer()?)?;

        let index = self.ctx.registry.reserve()?;
        let session = match self.admit(index, grant, &keys, &request.hostname).await {
            Ok(session) => session,
            Err(e) => {
                self.ctx.registry.release(index);
                log::info!("Rejected session {}: {}", index, e);
                return Err(e);
            }
        };

        self.ctx.registry.insert(session.clone());
        fanout::spawn_session_tasks(&self.ctx, &session);
        self.ctx.stats.set_active_sessions(self.ctx.registry.len());

        log::info!(
            "Session {} admitted for {} ({}), lease {:?}, ports {:?}",
            index,
            session.grant.user_id,
            session.grant.enc_type,
            session.lease.as_ref().map(|l| l.ip),
            session.slot().map(|(_, range)| range),
        );
        self.ctx
            .events
            .on_event(EngineEvent::ClientConnected {
                index,
                peer: None,
                vpl_ip: session.lease.as_ref().map(|l| l.ip),
            })
            .await;

        Ok(self.response(&session, &answer))
    }

    /// Build the session and claim its lease and slot; nothing leaks on error
    async fn admit(
        &self,
        index: SessionIndex,
        grant: SessionGrant,
        keys: &SessionKeys,
        hostname: &str,
    ) -> Result<Arc<ServerSession>> {
        let ctx = &self.ctx;
        let sealer = Sealer::new(index.value(), grant.enc_type, keys, Role::Server)?;
        let lease = match ctx.config.vpl_enabled {
            true => Some(self.lease(&grant.device_token, hostname).await?),
            false => None,
        };
        let net_admin = ctx.config.is_net_admin(&grant.user_id);
        let requesting_ports = grant.requesting_ports;

        let session = ServerSession::new(
            index,
            grant,
            sealer,
            lease.clone(),
            net_admin,
            ctx.config.channel_depth,
            ctx.stats.clone(),
        );

        if requesting_ports {
            match ctx.slots.assign(session.clone()) {
                Ok((slot, range)) => session.set_slot(slot, range),
                Err(e) => {
                    if let Some(lease) = &lease {
                        ctx.vpl.release(lease.ip);
                    }
                    return Err(Error::Congestion(format!("no free port slot: {}", e)));
                }
            }
        }
        if let Some(lease) = &lease {
            if let Err(e) = ctx.vpl.attach(lease.ip, session.clone()) {
                if let Some((slot, _)) = session.slot() {
                    ctx.slots.release(slot);
                }
                ctx.vpl.release(lease.ip);
                return Err(e.into());
            }
        }
        Ok(session)
    }

    /// Lease a LAN address; a device reconnecting replaces its old session
    async fn lease(&self, token: &str, hostname: &str) -> Result<VplLease> {
        let assign = || {
            self.ctx.vpl.assign(token, hostname).map_err(|e| match e {
                tnl_protocol::Error::Exhausted(_) => {
                    Error::Conflict("LAN address pool exhausted".into())
                }
                other => other.into(),
            })
        };
        let lease = assign()?;
        match self.ctx.vpl.lookup(lease.ip) {
            Some(previous) => {
                self.ctx
                    .teardown(previous.index, "replaced by a new session")
                    .await;
                assign()
            }
            None => Ok(lease),
        }
    }

    fn response(&self, session: &ServerSession, answer: &HandshakeAnswer) -> ConnectResponse {
        let config = &self.ctx.config;
        let index = session.index.value();
        let (start_port, end_port) = session
            .slot()
            .map_or((0, 0), |(_, range)| (range.start, range.end));
        ConnectResponse {
            x25519_pub: answer.x25519_pub.to_vec(),
            mlkem_cipher: answer.mlkem_cipher.clone(),
            signature: kex::sign_answer(&self.signing_key, answer, index).to_vec(),
            index,
            interface_ip: config.interface_ip,
            data_port: config.data_port,
            start_port,
            end_port,
            networks: config.networks.clone(),
            routes: config.routes.clone(),
            dns_servers: config.dns_servers.clone(),
            dhcp: session.lease.as_ref().map(|lease| DhcpLease {
                ip: lease.ip,
                token: lease.token.clone(),
                hostname: lease.hostname.clone(),
            }),
            lan: config.vpl_enabled.then(|| LanInfo {
                network: config.lan_cidr,
                nat: config.vpl_nat(),
            }),
        }
    }

    /// Replace a session's manual LAN allow-list
    pub async fn handle_firewall(&self, request: &FirewallRequest) -> Result<()> {
        let session = self
            .ctx
            .vpl
            .lookup(request.ip)
            .ok_or_else(|| Error::NotFound(format!("no session holds {}", request.ip)))?;
        let token_matches = session
            .lease
            .as_ref()
            .is_some_and(|lease| lease.token == request.dhcp_token);
        if !token_matches {
            return Err(Error::Auth(format!("lease token mismatch for {}", request.ip)));
        }
        if let Some(control) = &self.control {
            control.validate_firewall_request(&request.dhcp_token).await?;
        }

        session.firewall.set_manual_hosts(&request.hosts);
        session.firewall.set_disabled(request.disable_firewall);
        log::info!(
            "Session {} firewall: {} manual hosts, disabled={}",
            session.index,
            request.hosts.len(),
            request.disable_firewall
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::error::ErrorKind;
    use crate::handshake::SignedBlob;
    use crate::mock::{self, ServerHarness};
    use tnl_protocol::EncType;

    fn grant(device: &str) -> SessionGrant {
        SessionGrant {
            user_id: "user-1".into(),
            device_token: device.into(),
            server_id: mock::SERVER_ID.into(),
            enc_type: EncType::Chacha20Poly1305,
            requesting_ports: true,
            expires_at: Utc::now() + chrono::Duration::minutes(5),
        }
    }

    fn request(grant: &SessionGrant) -> ConnectRequest {
        let blob = SignedBlob::sign(&mock::controller_key(), grant).unwrap();
        ConnectRequest::new(blob, &kex::ClientHandshake::new().offer(), "laptop")
    }

    #[tokio::test]
    async fn test_connect_assigns_index_slot_and_lease() {
        let harness = ServerHarness::new(mock::server_config());
        let response = harness.acceptor.handle_connect(&request(&grant("d1"))).await.unwrap();

        assert_eq!(response.index, 1);
        assert_eq!(response.interface_ip, Ipv4Addr::new(192, 0, 2, 10));
        assert!(response.port_range().is_some());
        let lease = response.dhcp.unwrap();
        assert_eq!(lease.token, "d1");
        assert_eq!(lease.hostname, "laptop");
        assert!(harness.ctx.vpl.lookup(lease.ip).is_some());
        assert_eq!(harness.ctx.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_answer_signature_verifies() {
        let harness = ServerHarness::new(mock::server_config());
        let response = harness.acceptor.handle_connect(&request(&grant("d1"))).await.unwrap();
        let key = mock::server_key().verifying_key();
        kex::verify_answer(&key, &response.answer().unwrap(), response.index, &response.signature)
            .unwrap();
    }

    #[tokio::test]
    async fn test_rejects_forged_and_foreign_grants() {
        let harness = ServerHarness::new(mock::server_config());

        let mut forged = request(&grant("d1"));
        forged.signed_payload.signature[0] ^= 1;
        let err = harness.acceptor.handle_connect(&forged).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        let mut foreign = grant("d1");
        foreign.server_id = "elsewhere".into();
        let err = harness.acceptor.handle_connect(&request(&foreign)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        let mut expired = grant("d1");
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let err = harness.acceptor.handle_connect(&request(&expired)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        assert!(harness.ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_unaccepted_cipher_is_bad_input() {
        let mut config = mock::server_config();
        config.enc_types = vec![EncType::Aes256Gcm];
        let harness = ServerHarness::new(config);
        let err = harness.acceptor.handle_connect(&request(&grant("d1"))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadInput);
    }

    #[tokio::test]
    async fn test_slot_exhaustion_rolls_back() {
        let mut config = mock::server_config();
        config.available_mbps = 100;
        config.available_user_mbps = 100;
        let harness = ServerHarness::new(config);

        harness.acceptor.handle_connect(&request(&grant("d1"))).await.unwrap();
        let err = harness.acceptor.handle_connect(&request(&grant("d2"))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Congestion);
        assert_eq!(harness.ctx.registry.len(), 1);
        assert_eq!(harness.ctx.vpl.active(), 1);

        // Sessions without ports still fit
        let mut portless = grant("d3");
        portless.requesting_ports = false;
        let response = harness.acceptor.handle_connect(&request(&portless)).await.unwrap();
        assert!(response.port_range().is_none());
    }

    #[tokio::test]
    async fn test_vpl_disabled_skips_lease() {
        let mut config = mock::server_config();
        config.vpl_enabled = false;
        let harness = ServerHarness::new(config);

        for device in ["d1", "d2"] {
            let response = harness.acceptor.handle_connect(&request(&grant(device))).await.unwrap();
            assert!(response.dhcp.is_none());
            assert!(response.lan.is_none());
            assert!(response.port_range().is_some());
            let session = harness.ctx.session(SessionIndex(response.index)).unwrap();
            assert!(session.lease.is_none());
        }
        assert_eq!(harness.ctx.vpl.active(), 0);
        assert_eq!(harness.ctx.registry.len(), 2);
    }

    #[tokio::test]
    async fn test_reconnecting_device_replaces_session() {
        let harness = ServerHarness::new(mock::server_config());
        let first = harness.acceptor.handle_connect(&request(&grant("d1"))).await.unwrap();
        let second = harness.acceptor.handle_connect(&request(&grant("d1"))).await.unwrap();

        let ip = first.dhcp.unwrap().ip;
        assert_eq!(second.dhcp.unwrap().ip, ip);
        assert!(harness.ctx.session(SessionIndex(first.index)).is_none());
        let holder = harness.ctx.vpl.lookup(ip).unwrap();
        assert_eq!(holder.index, SessionIndex(second.index));
    }

    #[tokio::test]
    async fn test_firewall_sync_requires_lease_token() {
        let harness = ServerHarness::new(mock::server_config());
        let response = harness.acceptor.handle_connect(&request(&grant("d1"))).await.unwrap();
        let lease = response.dhcp.unwrap();
        let peer = Ipv4Addr::new(10, 0, 0, 9);

        let mut sync = FirewallRequest {
            dhcp_token: "other".into(),
            ip: lease.ip,
            hosts: vec![peer],
            disable_firewall: false,
        };
        let err = harness.acceptor.handle_firewall(&sync).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        sync.dhcp_token = lease.token.clone();
        harness.acceptor.handle_firewall(&sync).await.unwrap();
        let session = harness.ctx.vpl.lookup(lease.ip).unwrap();
        assert!(session.firewall.is_host_allowed(peer, 22).is_some());

        sync.ip = Ipv4Addr::new(10, 0, 0, 200);
        let err = harness.acceptor.handle_firewall(&sync).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
