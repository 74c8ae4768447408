//! Client data plane
//!
//! ```text
//!  TUN ──► egress (rewrite, seal) ──► UDP ──► server
//!  TUN ◄── ingress (open, rewrite) ◄── UDP ◄── server
//! ```
//!
//! [`ClientEngine`] negotiates sessions per tunnel tag and reacts when a
//! session's tasks stop.

pub mod egress;
pub mod engine;
pub mod ingress;
pub mod session;

pub use engine::{build_resolver, ClientEngine};
pub use session::{ClientSession, ExitReason, SessionExit, Translator};
