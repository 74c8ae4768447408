//! Configuration types for the client and server engines
//!
//! The client keeps JSON files under its base path (see [`crate::state`]):
//! one [`RootConfig`] and one [`TunnelConfig`] per tunnel. The server reads a
//! single TOML file:
//!
//! ```toml
//! [common]
//! log_level = "info"
//!
//! [server]
//! server_id = "5f1c..."
//! interface_ip = "192.0.2.10"
//! data_port = 444
//! start_port = 2000
//! end_port = 62000
//! available_mbps = 10000
//! available_user_mbps = 50
//! controller_key_file = "/etc/tunnels/controller.pem"
//! signing_key_file = "/etc/tunnels/server.key"
//! tls_cert = "/etc/tunnels/cert.pem"
//! tls_key = "/etc/tunnels/key.pem"
//! ```

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tnl_dns::{BlockListSource, DnsRecord, ResolverConfig};
use tnl_protocol::{EncType, NatRule, NicConfig, SlotLayout};

use crate::error::{Error, Result};

/// Smallest MTU accepted for a tunnel interface
pub const MIN_MTU: u16 = 576;

/// Process-wide client settings (`tunnels.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RootConfig {
    /// Controller host
    pub auth_host: String,
    pub device_id: String,
    /// Server to connect to when no tunnel names one
    pub server_id: String,

    /// Run the local resolver
    pub dns_enabled: bool,
    pub dns_listen: SocketAddr,
    /// Upstream resolvers, in fail-over order
    pub dns_servers: Vec<String>,
    /// Use the DoH defaults instead of `dns_servers`
    pub dns_over_https: bool,
    pub blocklists: Vec<BlockListSource>,
    pub blocklist_refresh_hours: u64,

    /// Keep a dead tunnel's routes instead of tearing it down
    pub kill_switch: bool,
    pub auto_reconnect: bool,
    /// Validate TLS certificates
    pub secure: bool,
    /// Report host telemetry in heartbeats
    pub send_stats: bool,
    pub log_level: String,
}

impl Default for RootConfig {
    fn default() -> Self {
        Self {
            auth_host: default_auth_host(),
            device_id: String::new(),
            server_id: String::new(),
            dns_enabled: true,
            dns_listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
            dns_servers: vec!["1.1.1.1".into(), "8.8.8.8".into()],
            dns_over_https: false,
            blocklists: Vec::new(),
            blocklist_refresh_hours: 24,
            kill_switch: false,
            auto_reconnect: true,
            secure: true,
            send_stats: true,
            log_level: default_log_level(),
        }
    }
}

impl RootConfig {
    pub fn validate(&self) -> Result<()> {
        if self.auth_host.trim().is_empty() {
            return Err(Error::BadInput("authHost is required".into()));
        }
        if self.blocklist_refresh_hours == 0 {
            return Err(Error::BadInput("blocklistRefreshHours must be at least 1".into()));
        }
        if self.dns_enabled {
            self.resolver_config()
                .validate()
                .map_err(|e| Error::BadInput(e.to_string()))?;
        }
        Ok(())
    }

    /// Settings for the local resolver
    pub fn resolver_config(&self) -> ResolverConfig {
        let upstreams = if self.dns_over_https {
            ResolverConfig::doh_defaults()
        } else {
            self.dns_servers.clone()
        };
        ResolverConfig {
            listen: self.dns_listen,
            upstreams,
            ..ResolverConfig::default()
        }
    }

    pub fn blocklist_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.blocklist_refresh_hours.max(1) * 3600)
    }

    /// Base URL of the controller
    pub fn controller_url(&self) -> String {
        if self.auth_host.starts_with("http://") || self.auth_host.starts_with("https://") {
            self.auth_host.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", self.auth_host.trim_end_matches('/'))
        }
    }
}

/// Per-tunnel LAN firewall preferences sent to the server after connect
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LanFirewallConfig {
    pub disabled: bool,
    /// Peers always allowed to reach this device
    pub hosts: Vec<Ipv4Addr>,
}

/// One tunnel (`tunnel/<tag>.tun.json`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    pub tag: String,
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub enc_type: EncType,
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Local address of the tunnel interface
    #[serde(default = "default_interface_ip")]
    pub interface_ip: Ipv4Addr,
    #[serde(default = "default_interface_prefix")]
    pub interface_prefix: u8,
    /// Interface name; the platform picks one when unset
    #[serde(default)]
    pub interface_name: Option<String>,

    /// Ask the server for a port slot
    #[serde(default = "default_true")]
    pub requesting_ports: bool,
    /// Name announced on the virtual LAN
    #[serde(default)]
    pub hostname: String,

    /// Static DNS answers, and names forwarded through this tunnel
    #[serde(default)]
    pub dns_records: Vec<DnsRecord>,
    #[serde(default)]
    pub lan_firewall: LanFirewallConfig,

    /// Rewrite outbound bare RST to ACK|RST
    #[serde(default = "default_true")]
    pub normalize_rst: bool,
}

impl TunnelConfig {
    pub fn new(tag: impl Into<String>, server_id: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            server_id: server_id.into(),
            enc_type: EncType::default(),
            mtu: default_mtu(),
            interface_ip: default_interface_ip(),
            interface_prefix: default_interface_prefix(),
            interface_name: None,
            requesting_ports: true,
            hostname: String::new(),
            dns_records: Vec::new(),
            lan_firewall: LanFirewallConfig::default(),
            normalize_rst: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tag.is_empty()
            || !self
                .tag
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::BadInput(format!(
                "tag '{}' must be non-empty and use only letters, digits, '-' and '_'",
                self.tag
            )));
        }
        if self.mtu < MIN_MTU {
            return Err(Error::BadInput(format!(
                "MTU {} is too small (minimum {})",
                self.mtu, MIN_MTU
            )));
        }
        if self.interface_prefix == 0 || self.interface_prefix > 30 {
            return Err(Error::BadInput(format!(
                "interfacePrefix /{} must be between /1 and /30",
                self.interface_prefix
            )));
        }
        for record in &self.dns_records {
            if record.domain.trim().is_empty() {
                return Err(Error::BadInput("DNS record without a domain".into()));
            }
        }
        Ok(())
    }

    /// Settings for opening this tunnel's interface
    pub fn nic_config(&self) -> NicConfig {
        NicConfig {
            name: self.interface_name.clone(),
            address: self.interface_ip,
            prefix_len: self.interface_prefix,
            mtu: self.mtu,
        }
    }
}

/// Server configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub common: CommonConfig,

    pub server: Option<ServerConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref server) = self.server {
            server.validate()?;
        }
        Ok(())
    }

    /// Get the server configuration, or error if not present
    pub fn server_config(&self) -> Result<&ServerConfig> {
        self.server
            .as_ref()
            .ok_or_else(|| Error::BadInput("server configuration is required".into()))
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# Tunnels server configuration

[common]
# Log level: "error", "warn", "info", "debug", "trace"
log_level = "info"

# Directory for daily log files (optional, stdout only when unset)
# log_dir = "/var/log/tunnels"

[server]
# Identifier the controller knows this server by
server_id = ""

# Public IPv4 address; clients send data to interface_ip:data_port
interface_ip = "192.0.2.10"
data_port = 444

# Handshake endpoint (HTTPS, TLS 1.3)
handshake_listen = "0.0.0.0:443"
tls_cert = "/etc/tunnels/cert.pem"
tls_key = "/etc/tunnels/key.pem"

# Controller verifying key and this server's signing key (PEM)
controller_key_file = "/etc/tunnels/controller.pem"
signing_key_file = "/etc/tunnels/server.key"

# Ports split into available_mbps / available_user_mbps slots
start_port = 2000
end_port = 62000
available_mbps = 10000
available_user_mbps = 50

# Accepted ciphers
enc_types = ["chacha20poly1305", "aes256gcm"]

# Virtual LAN
vpl_enabled = true
lan_cidr = "10.0.0.0/16"
# vpl_nat = "10.0.0.0/16"
lan_firewall_disabled = false
dhcp_lease_timeout_secs = 3600

# Policy for packets leaving towards the Internet
internet_access = true
local_network_access = false

# Users whose sessions bypass the LAN firewall
net_admins = []

dns_servers = ["1.1.1.1"]
routes = []

# [[server.networks]]
# network = "192.168.1.0/24"
# nat = "10.10.1.0/24"
"#
        .to_string()
    }
}

/// Settings outside the data plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for `YYYY-MM-DD.log` files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

/// Server data plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server_id: String,

    /// Public address; raw-socket source and data endpoint
    pub interface_ip: Ipv4Addr,
    #[serde(default = "default_data_port")]
    pub data_port: u16,
    #[serde(default = "default_handshake_listen")]
    pub handshake_listen: SocketAddr,

    pub start_port: u16,
    pub end_port: u16,
    pub available_mbps: u32,
    pub available_user_mbps: u32,

    #[serde(default = "default_enc_types")]
    pub enc_types: Vec<EncType>,

    /// Give each session a lease on the virtual LAN
    #[serde(default = "default_true")]
    pub vpl_enabled: bool,
    /// Virtual LAN range
    #[serde(default = "default_lan_cidr")]
    pub lan_cidr: Ipv4Net,
    /// Prefix clients address the LAN by; `lan_cidr` when unset
    #[serde(default)]
    pub vpl_nat: Option<Ipv4Net>,
    #[serde(default)]
    pub lan_firewall_disabled: bool,
    #[serde(default = "default_lease_timeout")]
    pub dhcp_lease_timeout_secs: u64,

    #[serde(default = "default_true")]
    pub internet_access: bool,
    /// Allow private destinations on the server's own network
    #[serde(default)]
    pub local_network_access: bool,
    /// User ids that bypass the LAN firewall
    #[serde(default)]
    pub net_admins: Vec<String>,

    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
    #[serde(default)]
    pub networks: Vec<NatRule>,
    #[serde(default)]
    pub routes: Vec<Ipv4Net>,

    pub controller_key_file: PathBuf,
    pub signing_key_file: PathBuf,
    pub tls_cert: PathBuf,
    pub tls_key: PathBuf,

    /// Per-session queue depth
    #[serde(default = "default_channel_depth")]
    pub channel_depth: usize,
    /// Sessions silent for longer are reaped
    #[serde(default = "default_idle_timeout")]
    pub session_idle_timeout_secs: u64,
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Result<()> {
        if self.start_port >= self.end_port {
            return Err(Error::BadInput(format!(
                "start_port {} must be below end_port {}",
                self.start_port, self.end_port
            )));
        }
        if self.available_user_mbps == 0 {
            return Err(Error::BadInput("available_user_mbps must not be zero".into()));
        }
        if self.available_mbps / self.available_user_mbps == 0 {
            return Err(Error::BadInput(
                "available_mbps / available_user_mbps yields no slots".into(),
            ));
        }
        self.slot_layout()?;

        if self.enc_types.is_empty() {
            return Err(Error::BadInput("enc_types must not be empty".into()));
        }
        if self.data_port == 0 {
            return Err(Error::BadInput("data_port must not be zero".into()));
        }
        if self.channel_depth == 0 {
            return Err(Error::BadInput("channel_depth must not be zero".into()));
        }

        let lan = self.lan_cidr;
        if lan.prefix_len() < tnl_protocol::vpl::MIN_PREFIX_LEN || lan.prefix_len() > 30 {
            return Err(Error::BadInput(format!(
                "lan_cidr {} must be between /{} and /30",
                lan,
                tnl_protocol::vpl::MIN_PREFIX_LEN
            )));
        }
        if let Some(nat) = self.vpl_nat {
            if nat.prefix_len() != lan.prefix_len() {
                return Err(Error::BadInput(format!(
                    "vpl_nat {} must have the same prefix length as lan_cidr {}",
                    nat, lan
                )));
            }
        }
        for rule in &self.networks {
            NatRule::new(rule.network, rule.nat).map_err(|e| Error::BadInput(e.to_string()))?;
        }
        Ok(())
    }

    pub fn slot_layout(&self) -> Result<SlotLayout> {
        SlotLayout::new(
            self.start_port,
            self.end_port,
            self.available_mbps,
            self.available_user_mbps,
        )
        .map_err(|e| Error::BadInput(e.to_string()))
    }

    /// LAN prefix as clients see it
    pub fn vpl_nat(&self) -> Ipv4Net {
        self.vpl_nat.unwrap_or(self.lan_cidr)
    }

    pub fn accepts(&self, enc: EncType) -> bool {
        self.enc_types.contains(&enc)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.dhcp_lease_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs.max(1))
    }

    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.interface_ip), self.data_port)
    }

    /// Address the raw listeners are bound to; `None` listens on every interface
    pub fn raw_bind(&self) -> Option<Ipv4Addr> {
        Some(self.interface_ip).filter(|ip| !ip.is_unspecified())
    }

    pub fn is_net_admin(&self, user_id: &str) -> bool {
        self.net_admins.iter().any(|u| u == user_id)
    }
}

fn default_auth_host() -> String {
    "api.tunnels.is".to_string()
}

fn default_mtu() -> u16 {
    tnl_protocol::DEFAULT_MTU as u16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_interface_ip() -> Ipv4Addr {
    Ipv4Addr::new(10, 255, 0, 2)
}

fn default_interface_prefix() -> u8 {
    24
}

fn default_data_port() -> u16 {
    444
}

fn default_handshake_listen() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 443)
}

fn default_enc_types() -> Vec<EncType> {
    vec![EncType::Chacha20Poly1305, EncType::Aes256Gcm]
}

fn default_lan_cidr() -> Ipv4Net {
    Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 16).unwrap_or_default()
}

fn default_lease_timeout() -> u64 {
    3600
}

fn default_channel_depth() -> usize {
    500_000
}

fn default_idle_timeout() -> u64 {
    90
}
