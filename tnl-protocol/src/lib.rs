//! Tunnels data-plane protocol
//!
//! Everything both peers agree on byte-for-byte, plus the tables that make the
//! packet path symmetric:
//!
//! - [`frame`] and [`sealer`]: `[index u16][nonce u64][ciphertext+tag]`
//!   datagrams under ChaCha20-Poly1305 or AES-256-GCM.
//! - [`kex`]: hybrid X25519 + ML-KEM-1024 handshake and answer signatures.
//! - [`ipv4`], [`checksum`], [`flags`]: in-place header rewriting.
//! - [`ports`], [`nat`], [`vpl`], [`firewall`]: port slots and mappings, prefix
//!   NAT, LAN leases and the per-session LAN allow-list.
//! - [`heartbeat`]: ping payloads.
//! - [`transport`]: the `VirtualNic` / `DatagramSocket` seams and their mocks.
//!
//! ```rust
//! use tnl_protocol::{kex, EncType, Role, Sealer};
//!
//! let mut client = kex::ClientHandshake::new();
//! let (answer, server_keys) = kex::respond(&client.offer()).unwrap();
//! let client_keys = client.finalize(&answer).unwrap();
//!
//! let tx = Sealer::new(1, EncType::Chacha20Poly1305, &client_keys, Role::Client).unwrap();
//! let rx = Sealer::new(1, EncType::Chacha20Poly1305, &server_keys, Role::Server).unwrap();
//!
//! let mut wire = Vec::new();
//! let mut plain = Vec::new();
//! tx.seal_into(b"hello", &mut wire).unwrap();
//! rx.open_into(&wire, &mut plain).unwrap();
//! assert_eq!(plain, b"hello");
//! ```

mod buffer_pool;
pub mod checksum;
mod error;
pub mod firewall;
pub mod flags;
pub mod frame;
pub mod heartbeat;
pub mod ipv4;
pub mod kex;
pub mod nat;
pub mod ports;
pub mod sealer;
mod session;
pub mod transport;
pub mod vpl;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use error::{Error, Result};
pub use firewall::{AllowedHost, HostKind, LanFirewall};
pub use flags::TcpFlags;
pub use frame::{FrameHeader, FRAME_HEADER_LEN, FRAME_OVERHEAD};
pub use heartbeat::{ClientPing, HostStats, ServerPing};
pub use ipv4::{Ipv4Packet, PacketInfo, Transport};
pub use kex::{HandshakeAnswer, HandshakeOffer, SessionKeys};
pub use nat::{NatMaps, NatRule};
pub use ports::{FlowKey, Mapping, PortMapper, PortMappers, PortRange, SlotLayout, SlotTable};
pub use sealer::{EncType, Role, Sealer};
pub use session::{
    AtomicSessionState, SessionId, SessionIndex, SessionState, MAX_SESSION_INDEX,
    MIN_SESSION_INDEX,
};
pub use transport::{DatagramSocket, NicConfig, NicFactory, NicInfo, VirtualNic};
pub use vpl::{VplLease, VplSwitch};

/// Wire protocol version sent in session requests
pub const PROTOCOL_VERSION: u8 = 3;

/// Default tunnel MTU
pub const DEFAULT_MTU: usize = 1420;

/// Scratch buffer size for interface and socket reads
pub const IFACE_BUFSIZE: usize = 2048;
