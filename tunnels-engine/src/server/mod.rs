//! Server data plane
//!
//! ```text
//!  client UDP ──► data listener ──► from_user ──┬─► raw socket ──► Internet
//!                                               └─► to_user (LAN peer)
//!  Internet ──► raw listeners ──► slot table ──► to_user ──► client UDP
//! ```
//!
//! [`Acceptor`] admits sessions over the HTTPS endpoint in [`http`];
//! [`ServerEngine`] binds the sockets and supervises the global tasks.

pub mod acceptor;
pub mod context;
pub mod engine;
pub mod fanout;
pub mod http;
pub mod raw;
pub mod registry;
pub mod session;

pub use acceptor::Acceptor;
pub use context::{ServerContext, ServerDatagram};
pub use engine::ServerEngine;
pub use raw::{RawReceiver, RawSender};
pub use registry::SessionRegistry;
pub use session::ServerSession;
