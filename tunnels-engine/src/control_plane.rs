//! Client for the controller
//!
//! The controller owns users, devices and servers; the data plane only needs
//! three calls from it, captured by [`ControlPlane`].

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tnl_protocol::{kex, EncType};

use crate::error::{Error, Result};
use crate::handshake::{SessionResponse, SignedBlob};

/// Per-request deadline for controller calls
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a server can be reached and the key its answers are signed with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub ip: Ipv4Addr,
    /// Handshake (HTTPS) port
    pub port: u16,
    /// Ed25519 public key, SPKI PEM
    pub pubkey: String,
}

impl ServerInfo {
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        kex::verifying_key_from_pem(&self.pubkey)
            .map_err(|e| Error::BadInput(format!("server public key: {}", e)))
    }
}

/// `POST /v3/session` body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRequest {
    pub version: u8,
    pub user_id: String,
    pub server_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_key: Option<String>,
    pub enc_type: EncType,
    pub requesting_ports: bool,
}

/// Who a firewall sync request belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingHandle {
    pub device_token: String,
    #[serde(default)]
    pub user_id: String,
}

#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn resolve_server(&self, server_id: &str) -> Result<ServerInfo>;

    async fn create_session(&self, request: &SessionRequest) -> Result<SignedBlob>;

    /// Resolve the token carried by a `/v3/firewall` request
    async fn validate_firewall_request(&self, token: &str) -> Result<MappingHandle>;
}

/// [`ControlPlane`] over HTTPS (TLS 1.3 only)
pub struct HttpControlPlane {
    base_url: String,
    client: reqwest::Client,
}

impl HttpControlPlane {
    /// `secure = false` skips certificate validation
    pub fn new(base_url: impl Into<String>, secure: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .min_tls_version(reqwest::tls::Version::TLS_1_3)
            .danger_accept_invalid_certs(!secure)
            .timeout(CONTROL_TIMEOUT)
            .build()
            .map_err(|e| Error::BadInput(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        what: &str,
        response: reqwest::Response,
    ) -> Result<T> {
        check_status(what, response.status())?;
        response.json::<T>().await.map_err(|e| map_reqwest(what, e))
    }
}

/// Map an HTTP status onto an error kind
pub fn check_status(what: &str, status: reqwest::StatusCode) -> Result<()> {
    use reqwest::StatusCode;
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::NOT_FOUND => Err(Error::NotFound(what.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(Error::Auth(format!("{}: HTTP {}", what, status)))
        }
        StatusCode::CONFLICT => Err(Error::Conflict(format!("{}: HTTP {}", what, status))),
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
            Err(Error::Congestion(format!("{}: HTTP {}", what, status)))
        }
        StatusCode::BAD_REQUEST => Err(Error::BadInput(format!("{}: HTTP {}", what, status))),
        _ => Err(Error::Transport(format!("{}: HTTP {}", what, status))),
    }
}

/// Map a client error: unreachable peers are transport errors, bad bodies bad input
pub fn map_reqwest(what: &str, err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout(format!("{}: {}", what, err))
    } else if err.is_decode() {
        Error::BadInput(format!("{}: malformed response: {}", what, err))
    } else {
        Error::Transport(format!("{}: {}", what, err))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn resolve_server(&self, server_id: &str) -> Result<ServerInfo> {
        let what = format!("server {}", server_id);
        let response = self
            .client
            .get(self.url(&format!("/v3/server/{}", server_id)))
            .send()
            .await
            .map_err(|e| map_reqwest(&what, e))?;
        let info: ServerInfo = Self::decode(&what, response).await?;
        info.verifying_key()?;
        Ok(info)
    }

    async fn create_session(&self, request: &SessionRequest) -> Result<SignedBlob> {
        let response = self
            .client
            .post(self.url("/v3/session"))
            .json(request)
            .send()
            .await
            .map_err(|e| map_reqwest("session", e))?;
        let body: SessionResponse = Self::decode("session", response).await?;
        Ok(body.signed_payload)
    }

    async fn validate_firewall_request(&self, token: &str) -> Result<MappingHandle> {
        let response = self
            .client
            .post(self.url("/v3/firewall/validate"))
            .json(&serde_json::json!({ "dhcpToken": token }))
            .send()
            .await
            .map_err(|e| map_reqwest("firewall validation", e))?;
        Self::decode("firewall validation", response).await
    }
}
