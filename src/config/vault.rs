//! Credential Vault
//!
//! Authenticated encryption of remote-host secrets (passwords, private keys)
//! at rest.
//!
//! # Format
//!
//! A [`SecretBlob`] is standard Base64 (padded) of `nonce[12] || ciphertext || tag[16]`,
//! produced by AES-256-GCM with no associated data. A fresh random nonce is drawn
//! for every encryption.
//!
//! # Key material
//!
//! The key comes from a single operator-supplied string. Material shorter than
//! 32 bytes is extended with ASCII `'0'`, longer material is truncated to its first
//! 32 bytes. This keeps blobs written by earlier deployments readable; it is not a
//! KDF, so operators should supply 32 bytes of real entropy.

use std::fmt;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Effective key length (AES-256)
pub const KEY_LEN: usize = 32;

/// AES-GCM nonce length
pub const NONCE_LEN: usize = 12;

/// AES-GCM authentication tag length
pub const TAG_LEN: usize = 16;

/// Byte appended to short key material
const KEY_PAD_BYTE: u8 = b'0';

/// Vault errors
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// No key material was supplied. Fatal at startup.
    #[error("encryption key is not configured")]
    MissingKey,

    /// Encryption or decryption failed.
    ///
    /// Malformed Base64, truncated blobs, tampering and a wrong key all map here
    /// with no further detail.
    #[error("secret could not be encrypted or decrypted")]
    Crypto,
}

/// Opaque encrypted secret as stored by the persistence layer
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretBlob(String);

impl SecretBlob {
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBlob({} chars)", self.0.len())
    }
}

impl fmt::Display for SecretBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extend or truncate key material to exactly [`KEY_LEN`] bytes
fn normalize_key(key_material: &str) -> Zeroizing<[u8; KEY_LEN]> {
    let bytes = key_material.as_bytes();
    let mut key = Zeroizing::new([KEY_PAD_BYTE; KEY_LEN]);
    let n = bytes.len().min(KEY_LEN);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Symmetric vault bound to one immutable key
///
/// Constructed once at startup and shared (`Arc<Vault>`) with whatever needs to
/// encrypt or decrypt. There is no global key state.
pub struct Vault {
    cipher: Aes256Gcm,
}

impl Vault {
    /// Build a vault from operator-supplied key material
    pub fn new(key_material: &str) -> Result<Self, VaultError> {
        if key_material.is_empty() {
            return Err(VaultError::MissingKey);
        }

        if key_material.len() < KEY_LEN {
            tracing::warn!(
                "Encryption key is {} bytes, padding to {}; use a full-length key",
                key_material.len(),
                KEY_LEN
            );
        }

        let key = normalize_key(key_material);
        let cipher = Aes256Gcm::new_from_slice(&*key).map_err(|_| VaultError::Crypto)?;

        Ok(Self { cipher })
    }

    /// Encrypt a secret into a [`SecretBlob`]
    pub fn encrypt(&self, plaintext: &str) -> Result<SecretBlob, VaultError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| VaultError::Crypto)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);

        Ok(SecretBlob(BASE64.encode(out)))
    }

    /// Authenticate and decrypt a [`SecretBlob`]
    pub fn decrypt(&self, blob: &SecretBlob) -> Result<Zeroizing<String>, VaultError> {
        let raw = BASE64.decode(blob.as_str()).map_err(|_| VaultError::Crypto)?;

        if raw.len() < NONCE_LEN {
            return Err(VaultError::Crypto);
        }

        let (nonce, ciphertext) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map(Zeroizing::new)
            .map_err(|_| VaultError::Crypto)?;

        std::str::from_utf8(&plaintext)
            .map(|s| Zeroizing::new(s.to_owned()))
            .map_err(|_| VaultError::Crypto)
    }
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Vault { .. }")
    }
}
