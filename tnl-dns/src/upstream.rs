//! Upstream DNS client
//!
//! Queries go to the configured servers in order: primary first, then the
//! secondary if the primary fails or times out. UDP and DoH upstreams can be
//! mixed. [`Upstream::exchange_via`] sends a query from a tunnel's local
//! address so the resolution rides that tunnel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;

use crate::config::DnsServerSpec;
use crate::error::{Error, Result};

/// Maximum UDP DNS response size
const MAX_UDP_RESPONSE_SIZE: usize = 4096;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Where the resolver sends what it cannot answer itself
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Resolve through the configured servers in fail-over order
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>>;

    /// Resolve through `server`, sending from `bind`
    async fn exchange_via(&self, server: SocketAddr, bind: Ipv4Addr, query: &[u8])
        -> Result<Vec<u8>>;
}

pub struct UpstreamClient {
    upstreams: Vec<DnsServerSpec>,
    http_client: reqwest::Client,
    timeout: Duration,
    /// Source address for plain UDP queries
    bind_addr: Option<IpAddr>,
}

impl UpstreamClient {
    pub fn new(upstreams: Vec<DnsServerSpec>, timeout: Duration) -> Result<Self> {
        Self::with_bind_addr(upstreams, timeout, None)
    }

    pub fn with_bind_addr(
        upstreams: Vec<DnsServerSpec>,
        timeout: Duration,
        bind_addr: Option<IpAddr>,
    ) -> Result<Self> {
        if upstreams.is_empty() {
            return Err(Error::Config("no upstream DNS servers configured".into()));
        }

        log::info!(
            "DNS upstreams: {}",
            upstreams
                .iter()
                .map(|u| u.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );

        let http_client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            upstreams,
            http_client,
            timeout,
            bind_addr,
        })
    }

    pub fn upstreams(&self) -> &[DnsServerSpec] {
        &self.upstreams
    }

    async fn query_one(&self, upstream: &DnsServerSpec, query: &[u8]) -> Result<Vec<u8>> {
        match upstream {
            DnsServerSpec::Udp { addr } => {
                query_udp(*addr, query, self.bind_addr, self.timeout).await
            }
            DnsServerSpec::Doh { url } => query_doh(&self.http_client, url, query).await,
        }
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn exchange(&self, query: &[u8]) -> Result<Vec<u8>> {
        let mut errors = Vec::new();
        for upstream in &self.upstreams {
            match self.query_one(upstream, query).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    log::debug!("Upstream {} failed: {}", upstream, e);
                    errors.push(format!("{}: {}", upstream, e));
                }
            }
        }
        Err(Error::Upstream(errors.join("; ")))
    }

    async fn exchange_via(
        &self,
        server: SocketAddr,
        bind: Ipv4Addr,
        query: &[u8],
    ) -> Result<Vec<u8>> {
        query_udp(server, query, Some(IpAddr::V4(bind)), self.timeout).await
    }
}

/// One UDP exchange; replies with a foreign id are ignored
async fn query_udp(
    addr: SocketAddr,
    query: &[u8],
    bind_addr: Option<IpAddr>,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let bind_socket_addr = match bind_addr {
        Some(ip) => SocketAddr::new(ip, 0),
        None if addr.is_ipv6() => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), 0),
        None => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
    };

    let socket = UdpSocket::bind(bind_socket_addr).await.map_err(|e| {
        Error::Upstream(format!("failed to bind UDP socket to {}: {}", bind_socket_addr, e))
    })?;
    socket
        .connect(addr)
        .await
        .map_err(|e| Error::Upstream(format!("failed to reach {}: {}", addr, e)))?;
    socket
        .send(query)
        .await
        .map_err(|e| Error::Upstream(format!("failed to send DNS query: {}", e)))?;

    let expected_id = query.get(..2);
    let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];
    let exchange = async {
        loop {
            let len = socket
                .recv(&mut buf)
                .await
                .map_err(|e| Error::Upstream(format!("failed to receive DNS response: {}", e)))?;
            if len >= 2 && buf.get(..2) == expected_id {
                return Ok::<usize, Error>(len);
            }
            log::debug!("Discarding stray {} byte reply from {}", len, addr);
        }
    };

    let len = tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout)??;
    buf.truncate(len);
    Ok(buf)
}

async fn query_doh(http_client: &reqwest::Client, url: &str, query: &[u8]) -> Result<Vec<u8>> {
    let response = http_client
        .post(url)
        .header("Content-Type", "application/dns-message")
        .header("Accept", "application/dns-message")
        .body(query.to_vec())
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                Error::Timeout
            } else {
                Error::Upstream(format!("DoH request failed: {}", e))
            }
        })?;

    if !response.status().is_success() {
        return Err(Error::Upstream(format!(
            "DoH server returned error: {}",
            response.status()
        )));
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Upstream(format!("failed to read DoH response: {}", e)))?;

    Ok(body.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every query on a local socket by echoing it with the QR bit set
    async fn echo_server(answer: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                if answer {
                    buf[2] |= 0x80;
                    let _ = socket.send_to(&buf[..n], from).await;
                }
            }
        });
        addr
    }

    fn query_bytes() -> Vec<u8> {
        vec![0xab, 0xcd, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0]
    }

    #[test]
    fn test_client_requires_upstreams() {
        assert!(UpstreamClient::new(vec![], DEFAULT_TIMEOUT).is_err());
    }

    #[tokio::test]
    async fn test_udp_exchange() {
        let addr = echo_server(true).await;
        let client =
            UpstreamClient::new(vec![DnsServerSpec::Udp { addr }], Duration::from_secs(2)).unwrap();
        let response = client.exchange(&query_bytes()).await.unwrap();
        assert_eq!(&response[..2], &[0xab, 0xcd]);
        assert_eq!(response[2] & 0x80, 0x80);
    }

    #[tokio::test]
    async fn test_falls_over_to_secondary() {
        let dead = echo_server(false).await;
        let alive = echo_server(true).await;
        let client = UpstreamClient::new(
            vec![
                DnsServerSpec::Udp { addr: dead },
                DnsServerSpec::Udp { addr: alive },
            ],
            Duration::from_millis(200),
        )
        .unwrap();
        assert!(client.exchange(&query_bytes()).await.is_ok());
    }

    #[tokio::test]
    async fn test_all_upstreams_failing() {
        let dead = echo_server(false).await;
        let client = UpstreamClient::new(
            vec![DnsServerSpec::Udp { addr: dead }],
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(matches!(
            client.exchange(&query_bytes()).await,
            Err(Error::Upstream(_))
        ));
    }

    #[tokio::test]
    async fn test_exchange_via_binds_source() {
        let addr = echo_server(true).await;
        let client =
            UpstreamClient::new(vec![DnsServerSpec::Udp { addr }], Duration::from_secs(2)).unwrap();
        let response = client
            .exchange_via(addr, Ipv4Addr::LOCALHOST, &query_bytes())
            .await
            .unwrap();
        assert_eq!(response.len(), 12);
    }
}
