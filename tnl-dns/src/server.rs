//! UDP listener in front of the [`Resolver`]

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::resolver::Resolver;

/// Maximum DNS message size for UDP
const MAX_DNS_MESSAGE_SIZE: usize = 4096;

/// Smallest well-formed message: the 12-byte header
const DNS_HEADER_LEN: usize = 12;

pub struct DnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<Resolver>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl DnsServer {
    pub async fn bind(
        bind_addr: SocketAddr,
        resolver: Arc<Resolver>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.map_err(|e| {
            Error::Dns(format!("failed to bind DNS listener to {}: {}", bind_addr, e))
        })?;
        log::info!("DNS listener on {}", bind_addr);
        Ok(Self {
            socket: Arc::new(socket),
            resolver,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until shutdown; each query runs in its own task
    pub async fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DNS_MESSAGE_SIZE];

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    log::info!("DNS listener shutting down");
                    return Ok(());
                }

                result = self.socket.recv_from(&mut buf) => {
                    let (len, src) = result.map_err(|e| {
                        log::error!("DNS listener recv error: {}", e);
                        Error::Io(e)
                    })?;
                    let query = buf[..len].to_vec();
                    let socket = self.socket.clone();
                    let resolver = self.resolver.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_query(&socket, &resolver, &query, src).await {
                            log::debug!("DNS query from {} failed: {}", src, e);
                        }
                    });
                }
            }
        }
    }
}

async fn handle_query(
    socket: &UdpSocket,
    resolver: &Resolver,
    query: &[u8],
    src: SocketAddr,
) -> Result<()> {
    if query.len() < DNS_HEADER_LEN {
        return Err(Error::Dns("DNS query too short".into()));
    }

    if let Some(response) = resolver.resolve(query).await? {
        socket
            .send_to(&response, src)
            .await
            .map_err(|e| Error::Dns(format!("failed to send DNS response: {}", e)))?;
    }

    Ok(())
}
