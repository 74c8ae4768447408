//! Data-plane datagram framing
//!
//! ```text
//! offset 0  [session_index u16 BE]
//! offset 2  [nonce u64 BE]
//! offset 10 [ciphertext + 16-byte tag]
//! ```

use crate::{Error, Result};

/// Bytes before the ciphertext
pub const FRAME_HEADER_LEN: usize = 10;

/// AEAD tag length for both supported ciphers
pub const TAG_LEN: usize = 16;

/// Per-datagram overhead on top of the plaintext
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + TAG_LEN;

/// Plaintext shorter than this is a heartbeat, not an IPv4 packet
pub const PING_THRESHOLD: usize = 20;

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub index: u16,
    pub nonce: u64,
}

impl FrameHeader {
    pub fn encode(&self, out: &mut [u8; FRAME_HEADER_LEN]) {
        out[0..2].copy_from_slice(&self.index.to_be_bytes());
        out[2..10].copy_from_slice(&self.nonce.to_be_bytes());
    }

    /// Parse the header of a datagram that must also carry a full tag
    pub fn decode(datagram: &[u8]) -> Result<Self> {
        if datagram.len() < FRAME_OVERHEAD {
            return Err(Error::PacketTooShort {
                expected: FRAME_OVERHEAD,
                actual: datagram.len(),
            });
        }
        Ok(Self {
            index: u16::from_be_bytes([datagram[0], datagram[1]]),
            nonce: u64::from_be_bytes([
                datagram[2],
                datagram[3],
                datagram[4],
                datagram[5],
                datagram[6],
                datagram[7],
                datagram[8],
                datagram[9],
            ]),
        })
    }
}

/// Session index of a datagram, without checking the rest
pub fn peek_index(datagram: &[u8]) -> Option<u16> {
    (datagram.len() >= 2).then(|| u16::from_be_bytes([datagram[0], datagram[1]]))
}

/// Whether an opened plaintext is a heartbeat rather than an IPv4 packet
pub fn is_ping(plaintext: &[u8]) -> bool {
    plaintext.len() < PING_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let hdr = FrameHeader {
            index: 0x0102,
            nonce: 0x0304_0506_0708_090A,
        };
        let mut out = [0u8; FRAME_HEADER_LEN];
        hdr.encode(&mut out);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        let mut datagram = out.to_vec();
        datagram.extend_from_slice(&[0u8; TAG_LEN]);
        assert_eq!(FrameHeader::decode(&datagram).unwrap(), hdr);
        assert_eq!(peek_index(&datagram), Some(0x0102));
    }

    #[test]
    fn test_short_datagram() {
        assert!(FrameHeader::decode(&[0u8; 25]).is_err());
        assert_eq!(peek_index(&[7]), None);
    }

    #[test]
    fn test_ping_threshold() {
        assert!(is_ping(&[]));
        assert!(is_ping(&[0u8; 12]));
        assert!(!is_ping(&[0u8; 20]));
    }
}
