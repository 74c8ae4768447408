//! User credentials encrypted at rest
//!
//! The file holds `iv(16) || ciphertext` where the ciphertext is the JSON
//! credentials under AES-256-CTR with a fixed local key. This keeps the
//! token out of casual view; it is not protection against a local attacker.

use std::path::Path;

use aes::cipher::{KeyIvInit, StreamCipher};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::error::{Error, Result};
use crate::state::write_atomic;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

const IV_LEN: usize = 16;

const FILE_KEY: [u8; 32] = *b"tunnels-local-credentials-key-01";

/// What the client presents to the controller
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub user_id: String,
    #[serde(default)]
    pub device_token: String,
    /// Used instead of the token when set
    #[serde(default)]
    pub device_key: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.device_token.zeroize();
        if let Some(key) = self.device_key.as_mut() {
            key.zeroize();
        }
    }
}

fn apply(iv: &[u8], data: &mut [u8]) -> Result<()> {
    let mut cipher = Aes256Ctr::new_from_slices(&FILE_KEY, iv)
        .map_err(|e| Error::BadInput(format!("credential cipher: {}", e)))?;
    cipher.apply_keystream(data);
    Ok(())
}

/// Encrypt `plain` into `iv || ciphertext`
pub fn encrypt(plain: &[u8]) -> Result<Vec<u8>> {
    let iv: [u8; IV_LEN] = rand::random();
    let mut out = Vec::with_capacity(IV_LEN + plain.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(plain);
    apply(&iv, &mut out[IV_LEN..])?;
    Ok(out)
}

pub fn decrypt(blob: &[u8]) -> Result<Vec<u8>> {
    if blob.len() < IV_LEN {
        return Err(Error::BadInput(format!(
            "credential blob is {} bytes, shorter than its IV",
            blob.len()
        )));
    }
    let (iv, ct) = blob.split_at(IV_LEN);
    let mut plain = ct.to_vec();
    apply(iv, &mut plain)?;
    Ok(plain)
}

impl Credentials {
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec(self)?;
        let blob = encrypt(&json);
        json.zeroize();
        write_atomic(path, &blob?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let blob = std::fs::read(path)?;
        let mut plain = decrypt(&blob)?;
        let parsed = serde_json::from_slice(&plain)
            .map_err(|e| Error::BadInput(format!("credentials unreadable: {}", e)));
        plain.zeroize();
        parsed
    }

    pub fn uses_device_key(&self) -> bool {
        self.device_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}
