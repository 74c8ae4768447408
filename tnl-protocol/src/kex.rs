//! Hybrid X25519 + ML-KEM-1024 key agreement
//!
//! The client generates an ephemeral X25519 secret and an ML-KEM decapsulation
//! key and sends both public halves as a [`HandshakeOffer`]. The server answers
//! with its own X25519 public key and an ML-KEM ciphertext, signed with its
//! long-term Ed25519 key together with the assigned session index.
//!
//! Both sides feed `x25519_shared || mlkem_shared` through HKDF-SHA512 (salt:
//! client public || server public) to get one key per direction.

use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use ml_kem::kem::{Decapsulate, DecapsulationKey, Encapsulate, EncapsulationKey};
use ml_kem::{Ciphertext, Encoded, EncodedSizeUser, KemCore, MlKem1024, MlKem1024Params};
use rand_core::OsRng;
use sha2::Sha512;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{Error, Result};

const INFO_C2S: &[u8] = b"tunnels c2s";
const INFO_S2C: &[u8] = b"tunnels s2c";

/// Directional AEAD keys for one session
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    pub client_to_server: [u8; 32],
    pub server_to_client: [u8; 32],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Client's public handshake material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeOffer {
    pub x25519_pub: [u8; 32],
    pub mlkem_encap: Vec<u8>,
}

/// Server's public handshake material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeAnswer {
    pub x25519_pub: [u8; 32],
    pub mlkem_cipher: Vec<u8>,
}

fn derive(
    client_pub: &[u8; 32],
    server_pub: &[u8; 32],
    x25519_shared: &[u8],
    mlkem_shared: &[u8],
) -> Result<SessionKeys> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(client_pub);
    salt[32..].copy_from_slice(server_pub);

    let mut ikm = Zeroizing::new(Vec::with_capacity(x25519_shared.len() + mlkem_shared.len()));
    ikm.extend_from_slice(x25519_shared);
    ikm.extend_from_slice(mlkem_shared);

    let hk = Hkdf::<Sha512>::new(Some(&salt), &ikm);
    let mut keys = SessionKeys {
        client_to_server: [0u8; 32],
        server_to_client: [0u8; 32],
    };
    hk.expand(INFO_C2S, &mut keys.client_to_server)
        .and_then(|_| hk.expand(INFO_S2C, &mut keys.server_to_client))
        .map_err(|e| Error::KeyExchange(e.to_string()))?;
    Ok(keys)
}

/// Initiator state, kept until the server answers
pub struct ClientHandshake {
    secret: Option<StaticSecret>,
    public: [u8; 32],
    dk: Option<DecapsulationKey<MlKem1024Params>>,
    encap: Vec<u8>,
    peer_public: [u8; 32],
    encapsulated: Vec<u8>,
}

impl ClientHandshake {
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret).to_bytes();
        let (dk, ek) = MlKem1024::generate(&mut OsRng);
        Self {
            secret: Some(secret),
            public,
            dk: Some(dk),
            encap: ek.as_bytes().to_vec(),
            peer_public: [0u8; 32],
            encapsulated: Vec::new(),
        }
    }

    pub fn offer(&self) -> HandshakeOffer {
        HandshakeOffer {
            x25519_pub: self.public,
            mlkem_encap: self.encap.clone(),
        }
    }

    /// Complete the exchange and wipe all handshake material
    pub fn finalize(&mut self, answer: &HandshakeAnswer) -> Result<SessionKeys> {
        self.peer_public = answer.x25519_pub;
        self.encapsulated = answer.mlkem_cipher.clone();
        let result = self.compute();
        self.wipe();
        result
    }

    fn compute(&mut self) -> Result<SessionKeys> {
        let secret = self
            .secret
            .take()
            .ok_or_else(|| Error::KeyExchange("handshake already finalized".into()))?;
        let dk = self
            .dk
            .take()
            .ok_or_else(|| Error::KeyExchange("handshake already finalized".into()))?;

        let x25519 = secret.diffie_hellman(&PublicKey::from(self.peer_public));
        if !x25519.was_contributory() {
            return Err(Error::KeyExchange("non-contributory x25519 share".into()));
        }

        let ct = Ciphertext::<MlKem1024>::try_from(self.encapsulated.as_slice())
            .map_err(|_| Error::KeyExchange("bad ML-KEM ciphertext length".into()))?;
        let mlkem = dk
            .decapsulate(&ct)
            .map_err(|_| Error::KeyExchange("ML-KEM decapsulation failed".into()))?;

        derive(&self.public, &self.peer_public, x25519.as_bytes(), mlkem.as_slice())
    }

    fn wipe(&mut self) {
        self.secret = None;
        self.dk = None;
        self.peer_public.zeroize();
        self.encapsulated.zeroize();
        self.encap.zeroize();
    }

    /// True once peer material and secrets are gone
    pub fn is_wiped(&self) -> bool {
        self.secret.is_none()
            && self.dk.is_none()
            && self.peer_public == [0u8; 32]
            && self.encapsulated.is_empty()
    }
}

impl Default for ClientHandshake {
    fn default() -> Self {
        Self::new()
    }
}

/// Responder side: answer an offer and derive the keys in one step
pub fn respond(offer: &HandshakeOffer) -> Result<(HandshakeAnswer, SessionKeys)> {
    let encoded = Encoded::<EncapsulationKey<MlKem1024Params>>::try_from(offer.mlkem_encap.as_slice())
        .map_err(|_| Error::KeyExchange("bad ML-KEM encapsulation key length".into()))?;
    let ek = EncapsulationKey::<MlKem1024Params>::from_bytes(&encoded);
    let (ct, mlkem) = ek
        .encapsulate(&mut OsRng)
        .map_err(|_| Error::KeyExchange("ML-KEM encapsulation failed".into()))?;

    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret).to_bytes();
    let x25519 = secret.diffie_hellman(&PublicKey::from(offer.x25519_pub));
    if !x25519.was_contributory() {
        return Err(Error::KeyExchange("non-contributory x25519 share".into()));
    }

    let keys = derive(&offer.x25519_pub, &public, x25519.as_bytes(), mlkem.as_slice())?;
    Ok((
        HandshakeAnswer {
            x25519_pub: public,
            mlkem_cipher: ct.to_vec(),
        },
        keys,
    ))
}

fn transcript(answer: &HandshakeAnswer, index: u16) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32 + answer.mlkem_cipher.len() + 2);
    msg.extend_from_slice(&answer.x25519_pub);
    msg.extend_from_slice(&answer.mlkem_cipher);
    msg.extend_from_slice(&index.to_be_bytes());
    msg
}

/// Sign `x25519_pub || mlkem_cipher || index`
pub fn sign_answer(key: &SigningKey, answer: &HandshakeAnswer, index: u16) -> [u8; 64] {
    key.sign(&transcript(answer, index)).to_bytes()
}

/// Check a server's signature over its answer
pub fn verify_answer(
    key: &VerifyingKey,
    answer: &HandshakeAnswer,
    index: u16,
    signature: &[u8],
) -> Result<()> {
    verify_detached(key, &transcript(answer, index), signature)
}

/// Check an Ed25519 signature over arbitrary bytes
pub fn verify_detached(key: &VerifyingKey, msg: &[u8], signature: &[u8]) -> Result<()> {
    let signature = Signature::from_slice(signature).map_err(|_| Error::BadSignature)?;
    key.verify(msg, &signature).map_err(|_| Error::BadSignature)
}

pub fn signing_key_from_pem(pem: &str) -> Result<SigningKey> {
    SigningKey::from_pkcs8_pem(pem).map_err(|e| Error::KeyExchange(format!("signing key: {}", e)))
}

pub fn verifying_key_from_pem(pem: &str) -> Result<VerifyingKey> {
    VerifyingKey::from_public_key_pem(pem)
        .map_err(|e| Error::KeyExchange(format!("verifying key: {}", e)))
}
