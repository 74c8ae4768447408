//! Resolver configuration
//!
//! Upstream servers are written as:
//! - `IP`, `IP:port` or `IP[:port]/udp` - plain UDP
//! - `https://...` - DNS over HTTPS
//!
//! They are tried in the order given: the first is the primary, the second
//! the secondary.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// An upstream DNS server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsServerSpec {
    Udp { addr: SocketAddr },
    Doh { url: String },
}

impl DnsServerSpec {
    pub fn server_type(&self) -> &'static str {
        match self {
            DnsServerSpec::Udp { .. } => "UDP",
            DnsServerSpec::Doh { .. } => "DoH",
        }
    }
}

impl std::fmt::Display for DnsServerSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsServerSpec::Udp { addr } => write!(f, "{}/udp", addr),
            DnsServerSpec::Doh { url } => write!(f, "{}", url),
        }
    }
}

impl FromStr for DnsServerSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_dns_server(s)
    }
}

/// Parse an upstream server specification
///
/// - `8.8.8.8` - UDP to 8.8.8.8:53
/// - `8.8.8.8:5353/udp` - UDP to 8.8.8.8:5353
/// - `https://cloudflare-dns.com/dns-query` - DoH
pub fn parse_dns_server(s: &str) -> Result<DnsServerSpec> {
    let s = s.trim();

    if s.starts_with("https://") {
        return Ok(DnsServerSpec::Doh { url: s.to_string() });
    }

    let addr_part = match s.rsplit_once('/') {
        Some((addr, proto)) if proto.eq_ignore_ascii_case("udp") => addr,
        Some((_, proto)) => {
            return Err(Error::Config(format!(
                "unknown DNS protocol '{}', expected 'udp' or an https:// URL",
                proto
            )))
        }
        None => s,
    };

    Ok(DnsServerSpec::Udp {
        addr: parse_socket_addr(addr_part, 53)?,
    })
}

/// Parse an IP address with optional port, defaulting to the given port
fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }

    // [::1] without a port
    if let Some(inner) = s.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        let ip = inner
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", inner, e)))?;
        return Ok(SocketAddr::new(ip, default_port));
    }

    s.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| Error::Config(format!("cannot parse DNS server address '{}'", s)))
}

/// Settings for the local resolver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResolverConfig {
    /// Listener address
    pub listen: SocketAddr,
    /// Upstreams in fail-over order
    pub upstreams: Vec<String>,
    pub cache_size: usize,
    pub cache_clean_interval_secs: u64,
    /// Per-attempt upstream timeout
    pub upstream_timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 53),
            upstreams: vec!["1.1.1.1".into(), "8.8.8.8".into()],
            cache_size: 10_000,
            cache_clean_interval_secs: 30,
            upstream_timeout_secs: 10,
        }
    }
}

impl ResolverConfig {
    /// DoH endpoints of the default providers
    pub fn doh_defaults() -> Vec<String> {
        vec![
            "https://1.1.1.1/dns-query".into(),
            "https://8.8.8.8/dns-query".into(),
        ]
    }

    pub fn upstream_specs(&self) -> Result<Vec<DnsServerSpec>> {
        if self.upstreams.is_empty() {
            return Err(Error::Config("no upstream DNS servers configured".into()));
        }
        self.upstreams.iter().map(|s| parse_dns_server(s)).collect()
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs.max(1))
    }

    pub fn cache_clean_interval(&self) -> Duration {
        Duration::from_secs(self.cache_clean_interval_secs.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        self.upstream_specs()?;
        if self.cache_size == 0 {
            return Err(Error::Config("cacheSize must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    #[test]
    fn test_parse_udp_ip_only() {
        let spec = parse_dns_server("8.8.8.8").unwrap();
        assert_eq!(
            spec,
            DnsServerSpec::Udp {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53)
            }
        );
    }

    #[test]
    fn test_parse_udp_with_port_explicit() {
        let spec = parse_dns_server("8.8.8.8:5353/udp").unwrap();
        assert_eq!(
            spec,
            DnsServerSpec::Udp {
                addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 5353)
            }
        );
    }

    #[test]
    fn test_parse_doh() {
        let spec = parse_dns_server("https://cloudflare-dns.com/dns-query").unwrap();
        assert_eq!(spec.server_type(), "DoH");
        assert_eq!(spec.to_string(), "https://cloudflare-dns.com/dns-query");
    }

    #[test]
    fn test_parse_ipv6() {
        let spec = parse_dns_server("[2001:4860:4860::8888]").unwrap();
        assert_eq!(
            spec,
            DnsServerSpec::Udp {
                addr: SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
                    53
                )
            }
        );
    }

    #[test]
    fn test_parse_rejects_tcp_and_garbage() {
        assert!(parse_dns_server("8.8.8.8/tcp").is_err());
        assert!(parse_dns_server("not-an-ip").is_err());
    }

    #[test]
    fn test_resolver_config_json() {
        let config: ResolverConfig =
            serde_json::from_str(r#"{"listen":"127.0.0.1:5353","upstreams":["9.9.9.9"]}"#)
                .unwrap();
        assert_eq!(config.listen.port(), 5353);
        assert_eq!(config.cache_size, 10_000);
        assert_eq!(config.upstream_specs().unwrap().len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_upstreams_rejected() {
        let config = ResolverConfig {
            upstreams: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
