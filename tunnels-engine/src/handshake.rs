//! JSON bodies of the session handshake
//!
//! - controller: `POST /v3/session` returns a [`SignedBlob`] wrapping a
//!   [`SessionGrant`], signed with the controller's Ed25519 key.
//! - server: `POST /v3/connect` takes a [`ConnectRequest`] and answers with a
//!   [`ConnectResponse`]; `POST /v3/firewall` takes a [`FirewallRequest`].
//!
//! Binary fields travel as standard base64.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tnl_protocol::{kex, EncType, HandshakeAnswer, HandshakeOffer, NatRule, PortRange};

use crate::error::{Error, Result};

/// Serde adapter for base64 byte fields
pub mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// What the controller authorizes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub user_id: String,
    /// Sticky key for the LAN lease
    pub device_token: String,
    pub server_id: String,
    pub enc_type: EncType,
    pub requesting_ports: bool,
    pub expires_at: DateTime<Utc>,
}

impl SessionGrant {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Opaque payload plus the controller's signature over it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedBlob {
    #[serde(with = "b64")]
    pub payload: Vec<u8>,
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
}

impl SignedBlob {
    /// Controller side: serialize and sign a grant
    pub fn sign(key: &SigningKey, grant: &SessionGrant) -> Result<Self> {
        let payload = serde_json::to_vec(grant)?;
        let signature = key.sign(&payload).to_bytes().to_vec();
        Ok(Self { payload, signature })
    }

    /// Check the signature, then decode the grant
    pub fn verify(&self, key: &VerifyingKey) -> Result<SessionGrant> {
        kex::verify_detached(key, &self.payload, &self.signature)
            .map_err(|_| Error::Auth("controller signature mismatch".into()))?;
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::BadInput(format!("session grant: {}", e)))
    }
}

/// `POST /v3/session` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub signed_payload: SignedBlob,
}

/// `POST /v3/connect` request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub signed_payload: SignedBlob,
    #[serde(with = "b64")]
    pub x25519_pub: Vec<u8>,
    #[serde(with = "b64")]
    pub mlkem_encap: Vec<u8>,
    /// Name to record on the LAN lease
    #[serde(default)]
    pub hostname: String,
}

impl ConnectRequest {
    pub fn new(signed_payload: SignedBlob, offer: &HandshakeOffer, hostname: &str) -> Self {
        Self {
            signed_payload,
            x25519_pub: offer.x25519_pub.to_vec(),
            mlkem_encap: offer.mlkem_encap.clone(),
            hostname: hostname.to_string(),
        }
    }

    pub fn offer(&self) -> Result<HandshakeOffer> {
        Ok(HandshakeOffer {
            x25519_pub: key32(&self.x25519_pub)?,
            mlkem_encap: self.mlkem_encap.clone(),
        })
    }
}

fn key32(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| Error::BadInput(format!("x25519 key is {} bytes, expected 32", bytes.len())))
}

/// LAN lease granted to the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DhcpLease {
    pub ip: Ipv4Addr,
    pub token: String,
    #[serde(default)]
    pub hostname: String,
}

/// Real LAN prefix and the prefix clients address it by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanInfo {
    pub network: Ipv4Net,
    pub nat: Ipv4Net,
}

impl LanInfo {
    /// Whether `addr` belongs to the LAN as clients address it
    pub fn is_vpl(&self, addr: Ipv4Addr) -> bool {
        self.nat.contains(&addr) || self.network.contains(&addr)
    }
}

/// `POST /v3/connect` response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    #[serde(with = "b64")]
    pub x25519_pub: Vec<u8>,
    #[serde(with = "b64")]
    pub mlkem_cipher: Vec<u8>,
    /// Server signature over `x25519_pub || mlkem_cipher || index`
    #[serde(with = "b64")]
    pub signature: Vec<u8>,
    pub index: u16,
    #[serde(rename = "interfaceIP")]
    pub interface_ip: Ipv4Addr,
    #[serde(rename = "dataPort")]
    pub data_port: u16,
    /// Zero when no slot was requested
    #[serde(rename = "startPort", default)]
    pub start_port: u16,
    #[serde(rename = "endPort", default)]
    pub end_port: u16,
    #[serde(default)]
    pub networks: Vec<NatRule>,
    #[serde(default)]
    pub routes: Vec<Ipv4Net>,
    #[serde(rename = "dnsServers", default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub dhcp: Option<DhcpLease>,
    #[serde(default)]
    pub lan: Option<LanInfo>,
}

impl ConnectResponse {
    pub fn answer(&self) -> Result<HandshakeAnswer> {
        Ok(HandshakeAnswer {
            x25519_pub: key32(&self.x25519_pub)?,
            mlkem_cipher: self.mlkem_cipher.clone(),
        })
    }

    /// The session's port slot, if one was assigned
    pub fn port_range(&self) -> Option<PortRange> {
        (self.start_port < self.end_port)
            .then(|| PortRange::new(self.start_port, self.end_port).ok())
            .flatten()
    }
}

/// `POST /v3/firewall` request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRequest {
    #[serde(rename = "dhcpToken")]
    pub dhcp_token: String,
    /// Lease address the request is for
    pub ip: Ipv4Addr,
    #[serde(default)]
    pub hosts: Vec<Ipv4Addr>,
    #[serde(rename = "disableFirewall", default)]
    pub disable_firewall: bool,
}
