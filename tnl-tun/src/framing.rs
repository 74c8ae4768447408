//! Platform packet framing
//!
//! Raw utun descriptors prefix every packet with a 4-byte address family
//! word (`[0, 0, 0, AF_INET]`). Reads strip it, writes prepend it.

use crate::error::{Error, Result};

/// Length of the utun address-family prefix
pub const AF_PREFIX_LEN: usize = 4;

/// `[0, 0, 0, 2]`: AF_INET in network byte order
pub const AF_INET_PREFIX: [u8; AF_PREFIX_LEN] = [0, 0, 0, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Frames are bare IP packets (Linux, BSD tun, wintun)
    Raw,
    /// Frames carry the utun address-family prefix
    AfPrefix,
}

impl Framing {
    pub fn from_packet_info(packet_info: bool) -> Self {
        if packet_info {
            Framing::AfPrefix
        } else {
            Framing::Raw
        }
    }

    /// Bytes the platform adds in front of each packet
    pub fn overhead(self) -> usize {
        match self {
            Framing::Raw => 0,
            Framing::AfPrefix => AF_PREFIX_LEN,
        }
    }

    /// Copy the packet inside `frame` into `out`, returning its length
    pub fn strip(self, frame: &[u8], out: &mut [u8]) -> Result<usize> {
        let packet = match self {
            Framing::Raw => frame,
            Framing::AfPrefix => {
                if frame.len() < AF_PREFIX_LEN {
                    return Err(Error::Framing(format!("{} byte frame", frame.len())));
                }
                &frame[AF_PREFIX_LEN..]
            }
        };
        if packet.len() > out.len() {
            return Err(Error::Framing(format!(
                "{} byte packet exceeds {} byte buffer",
                packet.len(),
                out.len()
            )));
        }
        out[..packet.len()].copy_from_slice(packet);
        Ok(packet.len())
    }

    /// Frame `packet` for the platform into `out`
    pub fn frame(self, packet: &[u8], out: &mut Vec<u8>) {
        out.clear();
        if self == Framing::AfPrefix {
            out.extend_from_slice(&AF_INET_PREFIX);
        }
        out.extend_from_slice(packet);
    }
}
