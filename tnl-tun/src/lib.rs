//! Platform virtual interface for the tunnels client
//!
//! [`TunDevice`] implements [`tnl_protocol::VirtualNic`] on top of `tun-rs`,
//! with routes managed through `net-route`. [`TunNicFactory`] is the
//! [`tnl_protocol::NicFactory`] the engine uses to open interfaces.
//!
//! # Platform Requirements
//!
//! - **Linux**: root or `CAP_NET_ADMIN`, TUN module loaded (`modprobe tun`)
//! - **macOS**: root; raw utun descriptors carry a 4-byte AF prefix (see [`framing`])
//! - **Windows**: Administrator, WinTun driver (<https://www.wintun.net/>)

pub mod config;
pub mod device;
pub mod error;
pub mod framing;
pub mod route;

pub use config::{Ipv4Config, TunConfig, TunConfigBuilder};
pub use device::{TunDevice, TunNicFactory};
pub use error::{Error, Result};
pub use framing::Framing;
pub use route::{Route, RouteManager};

/// Default MTU for tunnel interfaces
pub const DEFAULT_MTU: u16 = tnl_protocol::DEFAULT_MTU as u16;
