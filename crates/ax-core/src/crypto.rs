//! Encryption for project env-var secrets.
//!
//! AES-256-GCM AEAD with a per-record random IV. The stored form is the
//! `{iv, ciphertext, tag}` envelope from [`crate::types::EncryptedPayload`],
//! each field base64-encoded. Key material is zeroed from memory on drop.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ring::aead::{
    Aad, BoundKey, Nonce, NonceSequence, OpeningKey, SealingKey, UnboundKey, AES_256_GCM,
};
use ring::error::Unspecified;
use ring::rand::{SecureRandom, SystemRandom};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::EncryptedPayload;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// AES-256 key size in bytes.
const KEY_LEN: usize = 32;

/// GCM IV size in bytes (96 bits).
const IV_LEN: usize = 12;

/// GCM authentication tag size in bytes (128 bits).
const TAG_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed to generate random bytes")]
    RandomGeneration,
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error("invalid format: {0}")]
    InvalidFormat(String),
}

impl From<Unspecified> for CryptoError {
    fn from(_: Unspecified) -> Self {
        CryptoError::Encryption
    }
}

// ---------------------------------------------------------------------------
// Key management
// ---------------------------------------------------------------------------

/// An AES-256-GCM key that is zeroed from memory when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EnvKey {
    bytes: [u8; KEY_LEN],
}

impl EnvKey {
    /// Generate a fresh random key from system entropy.
    pub fn generate() -> Result<Self, CryptoError> {
        let rng = SystemRandom::new();
        let mut bytes = [0u8; KEY_LEN];
        rng.fill(&mut bytes)
            .map_err(|_| CryptoError::RandomGeneration)?;
        Ok(Self { bytes })
    }

    /// Build a key from exactly 32 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "key must be {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_LEN];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Build a key from its base64 representation (the config format).
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let raw = B64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidFormat(format!("base64 key: {e}")))?;
        Self::from_bytes(&raw)
    }

    fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }
}

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// Yields a single pre-generated nonce; `advance` fails on reuse.
struct OneNonceSequence {
    nonce: Option<Nonce>,
}

impl OneNonceSequence {
    fn new(nonce: Nonce) -> Self {
        Self { nonce: Some(nonce) }
    }
}

impl NonceSequence for OneNonceSequence {
    fn advance(&mut self) -> Result<Nonce, Unspecified> {
        self.nonce.take().ok_or(Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encrypt / decrypt
// ---------------------------------------------------------------------------

/// Encrypt a secret value into the `{iv, ciphertext, tag}` envelope.
pub fn encrypt_value(key: &EnvKey, plaintext: &str) -> Result<EncryptedPayload, CryptoError> {
    let rng = SystemRandom::new();

    let mut iv_bytes = [0u8; IV_LEN];
    rng.fill(&mut iv_bytes)
        .map_err(|_| CryptoError::RandomGeneration)?;
    let nonce = Nonce::assume_unique_for_key(iv_bytes);

    let unbound =
        UnboundKey::new(&AES_256_GCM, key.as_bytes()).map_err(|_| CryptoError::Encryption)?;
    let mut sealing_key = SealingKey::new(unbound, OneNonceSequence::new(nonce));

    let mut in_out = plaintext.as_bytes().to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Encryption)?;

    // ring appends the tag to the ciphertext; the envelope stores it apart.
    let tag_start = in_out.len() - TAG_LEN;
    let tag = in_out.split_off(tag_start);

    Ok(EncryptedPayload {
        iv: B64.encode(iv_bytes),
        ciphertext: B64.encode(&in_out),
        tag: B64.encode(&tag),
    })
}

/// Decrypt an `{iv, ciphertext, tag}` envelope back into the plaintext.
pub fn decrypt_value(key: &EnvKey, payload: &EncryptedPayload) -> Result<String, CryptoError> {
    let iv_raw = B64
        .decode(&payload.iv)
        .map_err(|e| CryptoError::InvalidFormat(format!("iv: {e}")))?;
    let iv_bytes: [u8; IV_LEN] = iv_raw
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidFormat(format!("iv must be {IV_LEN} bytes")))?;

    let ciphertext = B64
        .decode(&payload.ciphertext)
        .map_err(|e| CryptoError::InvalidFormat(format!("ciphertext: {e}")))?;
    let tag = B64
        .decode(&payload.tag)
        .map_err(|e| CryptoError::InvalidFormat(format!("tag: {e}")))?;
    if tag.len() != TAG_LEN {
        return Err(CryptoError::InvalidFormat(format!(
            "tag must be {TAG_LEN} bytes"
        )));
    }

    let nonce = Nonce::assume_unique_for_key(iv_bytes);
    let unbound =
        UnboundKey::new(&AES_256_GCM, key.as_bytes()).map_err(|_| CryptoError::Decryption)?;
    let mut opening_key = OpeningKey::new(unbound, OneNonceSequence::new(nonce));

    let mut in_out = ciphertext;
    in_out.extend_from_slice(&tag);
    let plaintext = opening_key
        .open_in_place(Aad::empty(), &mut in_out)
        .map_err(|_| CryptoError::Decryption)?;

    String::from_utf8(plaintext.to_vec())
        .map_err(|_| CryptoError::InvalidFormat("plaintext is not utf-8".into()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
