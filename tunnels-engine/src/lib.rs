//! Tunnels engine
//!
//! Client and server data planes of the tunnels VPN, shared by the CLI and
//! any embedding application.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     tunnels-cli                              │
//! │   client mode: ClientEngine       server mode: ServerEngine  │
//! └───────────────┬──────────────────────────────┬───────────────┘
//!                 ▼                              ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   tunnels-engine                             │
//! │  negotiator ── control plane, HTTPS connect, key exchange    │
//! │  client     ── egress / ingress / heartbeat per session      │
//! │  server     ── acceptor, fan-out, raw sockets, reaper        │
//! │  state      ── tunnels.json, tunnel/*.tun.json               │
//! └───────────────┬──────────────────┬───────────────┬───────────┘
//!                 ▼                  ▼               ▼
//!          tnl-protocol           tnl-tun         tnl-dns
//!   frames, sealer, NAT,      TUN device,     local resolver,
//!   port slots, VPL switch    routes          blocklists
//! ```

pub mod client;
pub mod config;
pub mod control_plane;
pub mod credentials;
pub mod error;
pub mod event;
pub mod handshake;
pub mod heartbeat;
pub mod negotiator;
pub mod server;
pub mod state;
pub mod stats;
pub mod supervisor;
pub mod telemetry;

/// In-memory servers, sockets and control planes for tests
pub mod mock;

pub use client::{build_resolver, ClientEngine, ClientSession};
pub use config::{Config, LanFirewallConfig, RootConfig, ServerConfig, TunnelConfig};
pub use control_plane::{ControlPlane, HttpControlPlane, ServerInfo};
pub use credentials::Credentials;
pub use error::{Error, ErrorKind, Result};
pub use event::{ChannelEventHandler, EngineEvent, EventHandler, LoggingEventHandler};
pub use negotiator::{HttpsConnector, NegotiateRequest, SessionNegotiator, UdpDialer};
pub use server::{ServerEngine, ServerSession};
pub use state::{AppState, StatePaths};
pub use stats::{DropReason, SharedStats, SharedStatsRef, StatsSnapshot};
