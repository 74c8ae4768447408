//! Authenticated encryption of data-plane datagrams
//!
//! Each direction has its own 32-byte key (see [`crate::kex`]). The 96-bit
//! AEAD nonce is four zero bytes followed by the sender's 64-bit counter, and
//! the associated data is the receiving session's index, so a datagram whose
//! header index or nonce was altered fails authentication.
//!
//! The receiver keeps a 1024-entry sliding window. Reordered datagrams inside
//! the window are accepted once; duplicates and anything older are dropped
//! with [`Error::Replay`], which is not fatal. A tag mismatch is
//! [`Error::AuthFailed`] and is fatal to the session.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};

use crate::frame::{FrameHeader, FRAME_HEADER_LEN, FRAME_OVERHEAD, TAG_LEN};
use crate::kex::SessionKeys;
use crate::{Error, Result};

/// Size of the replay window in nonces
pub const REPLAY_WINDOW: u64 = 1024;

/// AEAD selected for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EncType {
    #[default]
    Chacha20Poly1305,
    Aes256Gcm,
}

impl FromStr for EncType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "chacha20poly1305" | "chacha20" => Ok(EncType::Chacha20Poly1305),
            "aes256gcm" | "aes256" => Ok(EncType::Aes256Gcm),
            _ => Err(Error::UnknownEncType(s.to_string())),
        }
    }
}

impl fmt::Display for EncType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncType::Chacha20Poly1305 => write!(f, "chacha20poly1305"),
            EncType::Aes256Gcm => write!(f, "aes256gcm"),
        }
    }
}

/// Which side of the session this sealer serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

enum Aead {
    Chacha(Box<ChaCha20Poly1305>),
    Aes(Box<Aes256Gcm>),
}

impl Aead {
    fn new(enc: EncType, key: &[u8; 32]) -> Result<Self> {
        let bad_key = |_| Error::Encryption("invalid key length".into());
        Ok(match enc {
            EncType::Chacha20Poly1305 => {
                Aead::Chacha(Box::new(ChaCha20Poly1305::new_from_slice(key).map_err(bad_key)?))
            }
            EncType::Aes256Gcm => {
                Aead::Aes(Box::new(Aes256Gcm::new_from_slice(key).map_err(bad_key)?))
            }
        })
    }

    fn seal(&self, nonce: &[u8; 12], aad: &[u8], buf: &mut [u8]) -> Result<[u8; TAG_LEN]> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = match self {
            Aead::Chacha(c) => c.encrypt_in_place_detached(nonce, aad, buf),
            Aead::Aes(c) => c.encrypt_in_place_detached(nonce, aad, buf),
        }
        .map_err(|_| Error::Encryption("seal failed".into()))?;

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(&tag);
        Ok(out)
    }

    fn open(&self, nonce: &[u8; 12], aad: &[u8], buf: &mut [u8], tag: &[u8]) -> Result<()> {
        let nonce = GenericArray::from_slice(nonce);
        let tag = GenericArray::from_slice(tag);
        match self {
            Aead::Chacha(c) => c.decrypt_in_place_detached(nonce, aad, buf, tag),
            Aead::Aes(c) => c.decrypt_in_place_detached(nonce, aad, buf, tag),
        }
        .map_err(|_| Error::AuthFailed)
    }
}

fn aead_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Sliding bitmap of recently accepted nonces
#[derive(Debug, Default)]
pub struct ReplayWindow {
    top: u64,
    bits: [u64; (REPLAY_WINDOW / 64) as usize],
    seen_any: bool,
}

impl ReplayWindow {
    fn bit(nonce: u64) -> (usize, u64) {
        let slot = nonce % REPLAY_WINDOW;
        ((slot / 64) as usize, 1u64 << (slot % 64))
    }

    /// Whether `nonce` would be accepted
    pub fn check(&self, nonce: u64) -> bool {
        if !self.seen_any || nonce > self.top {
            return true;
        }
        if self.top - nonce >= REPLAY_WINDOW {
            return false;
        }
        let (word, mask) = Self::bit(nonce);
        self.bits[word] & mask == 0
    }

    /// Record `nonce`; returns false if it was already seen or is too old
    pub fn commit(&mut self, nonce: u64) -> bool {
        if !self.check(nonce) {
            return false;
        }
        if !self.seen_any || nonce > self.top {
            let advance = if self.seen_any {
                nonce - self.top
            } else {
                REPLAY_WINDOW
            };
            if advance >= REPLAY_WINDOW {
                self.bits = [0; (REPLAY_WINDOW / 64) as usize];
            } else {
                for n in self.top + 1..=nonce {
                    let (word, mask) = Self::bit(n);
                    self.bits[word] &= !mask;
                }
            }
            self.top = nonce;
            self.seen_any = true;
        }
        let (word, mask) = Self::bit(nonce);
        self.bits[word] |= mask;
        true
    }
}

/// Per-session datagram sealer
pub struct Sealer {
    index: u16,
    enc: EncType,
    tx: Aead,
    rx: Aead,
    next_nonce: AtomicU64,
    window: Mutex<ReplayWindow>,
}

impl Sealer {
    /// Build a sealer for `role` from the derived session keys
    pub fn new(index: u16, enc: EncType, keys: &SessionKeys, role: Role) -> Result<Self> {
        let (tx, rx) = match role {
            Role::Client => (&keys.client_to_server, &keys.server_to_client),
            Role::Server => (&keys.server_to_client, &keys.client_to_server),
        };
        Ok(Self {
            index,
            enc,
            tx: Aead::new(enc, tx)?,
            rx: Aead::new(enc, rx)?,
            next_nonce: AtomicU64::new(0),
            window: Mutex::new(ReplayWindow::default()),
        })
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn enc_type(&self) -> EncType {
        self.enc
    }

    /// Number of datagrams sealed so far
    pub fn sent(&self) -> u64 {
        self.next_nonce.load(Ordering::Relaxed)
    }

    /// Seal `plaintext` into `out` as a complete datagram
    ///
    /// `out` is cleared first; its allocation is reused.
    pub fn seal_into(&self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<()> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        if nonce == u64::MAX {
            return Err(Error::Encryption("nonce space exhausted".into()));
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        FrameHeader {
            index: self.index,
            nonce,
        }
        .encode(&mut header);

        out.clear();
        out.reserve(plaintext.len() + FRAME_OVERHEAD);
        out.extend_from_slice(&header);
        out.extend_from_slice(plaintext);

        let aad = self.index.to_be_bytes();
        let tag = self
            .tx
            .seal(&aead_nonce(nonce), &aad, &mut out[FRAME_HEADER_LEN..])?;
        out.extend_from_slice(&tag);
        Ok(())
    }

    /// Open a datagram into `out`, returning its nonce
    pub fn open_into(&self, datagram: &[u8], out: &mut Vec<u8>) -> Result<u64> {
        let header = FrameHeader::decode(datagram)?;
        if !self.lock_window().check(header.nonce) {
            return Err(Error::Replay(header.nonce));
        }

        let (ciphertext, tag) = datagram[FRAME_HEADER_LEN..].split_at(datagram.len() - FRAME_OVERHEAD);
        out.clear();
        out.extend_from_slice(ciphertext);

        let aad = self.index.to_be_bytes();
        self.rx.open(&aead_nonce(header.nonce), &aad, out, tag)?;

        if !self.lock_window().commit(header.nonce) {
            out.clear();
            return Err(Error::Replay(header.nonce));
        }
        Ok(header.nonce)
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, ReplayWindow> {
        self.window.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for Sealer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sealer")
            .field("index", &self.index)
            .field("enc", &self.enc)
            .field("sent", &self.sent())
            .finish()
    }
}
