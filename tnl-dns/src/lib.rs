//! tnl-dns - local resolver for the tunnels client
//!
//! A UDP listener answers queries in this order: global lock, cache,
//! static overrides, blocklist, per-tunnel forwarding, upstream (plain UDP
//! or DoH with primary/secondary fail-over).
//!
//! ```no_run
//! use std::sync::Arc;
//! use tnl_dns::{Blocklist, DnsCache, DnsServer, Overrides, Resolver, ResolverConfig, UpstreamClient};
//!
//! # async fn example() -> tnl_dns::Result<()> {
//! let config = ResolverConfig::default();
//! let upstream = UpstreamClient::new(config.upstream_specs()?, config.upstream_timeout())?;
//! let resolver = Arc::new(Resolver::new(
//!     Arc::new(upstream),
//!     Arc::new(DnsCache::new(config.cache_size)),
//!     Arc::new(Blocklist::new("/var/lib/tunnels/blocklists", vec![])),
//!     Arc::new(Overrides::new()),
//! ));
//!
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
//! DnsServer::bind(config.listen, resolver, shutdown_rx).await?.run().await
//! # }
//! ```

pub mod blocklist;
mod cache;
mod config;
pub mod error;
mod overrides;
mod resolver;
mod server;
mod upstream;

pub use blocklist::{BlockListSource, Blocklist, HttpListFetcher, ListFetcher};
pub use cache::{CacheKey, CacheStats, DnsCache};
pub use config::{parse_dns_server, DnsServerSpec, ResolverConfig};
pub use error::{Error, Result};
pub use overrides::{DnsRecord, OverrideEntry, Overrides, TunnelDns};
pub use resolver::{DnsLock, Resolver, ResolverStats, OVERRIDE_A_TTL, OVERRIDE_TXT_TTL};
pub use server::DnsServer;
pub use upstream::{Upstream, UpstreamClient};
