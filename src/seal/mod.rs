//! Authenticated encryption for result bundles.
//!
//! Uses AES-256-GCM with per-envelope key derivation. A result bundle is
//! serialized, encrypted under a key derived from the supplied seal key and
//! a random salt, and carried as a self-describing envelope:
//!
//! ```text
//! seal_key (supplied) ─┬─► HKDF-SHA256 ─► derived_key (per envelope)
//!                      │
//! per-envelope salt ───┘
//! ```
//!
//! Tampering with any envelope field, or opening with a different key, fails
//! authentication. The envelope never reveals plaintext structure.

pub mod bundle;

pub use bundle::ResultBundle;

use std::path::Path;

use aes_gcm::{
    aead::{Aead, AeadCore, OsRng},
    Aes256Gcm, KeyInit, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
const NONCE_SIZE: usize = 12;

/// Size of the per-envelope salt for key derivation.
const SALT_SIZE: usize = 32;

/// Size of the GCM authentication tag.
const TAG_SIZE: usize = 16;

/// Current envelope format version.
const ENVELOPE_VERSION: u32 = 1;

/// Domain separator for key derivation.
const HKDF_INFO: &[u8] = b"sandfleet-seal-v1";

/// Errors that can occur during sealing/opening operations.
#[derive(Debug, Error)]
pub enum SealError {
    /// Bundle serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An envelope field was not valid base64.
    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// The envelope structure is malformed.
    #[error("Invalid envelope format: {0}")]
    InvalidFormat(String),

    /// The envelope was sealed under a different key.
    #[error("Key mismatch: envelope sealed with key {expected}, supplied key is {actual}")]
    KeyMismatch { expected: String, actual: String },

    /// The authentication tag did not verify.
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// Encryption could not be performed.
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Supplied key material is unusable.
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// IO operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An unpacked artifact does not match its recorded checksum.
    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// The bundle manifest names a file that is not present.
    #[error("Missing artifact: {0}")]
    MissingArtifact(String),
}

/// Externally supplied sealing key.
///
/// The harness never generates or persists key material; a key is handed in
/// per invocation and identified by a public fingerprint.
#[derive(Clone)]
pub struct SealKey {
    bytes: [u8; KEY_SIZE],
}

impl SealKey {
    /// Wraps raw key bytes.
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Builds a key from a slice, rejecting wrong lengths.
    pub fn from_slice(slice: &[u8]) -> Result<Self, SealError> {
        if slice.len() != KEY_SIZE {
            return Err(SealError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_SIZE,
                slice.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Builds a key from a hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, SealError> {
        let decoded = hex::decode(hex_str.trim())
            .map_err(|e| SealError::InvalidKey(format!("invalid hex: {}", e)))?;
        Self::from_slice(&decoded)
    }

    /// Public fingerprint identifying this key in envelopes.
    pub fn key_id(&self) -> String {
        let digest = Sha256::digest(self.bytes);
        hex::encode(&digest[..8])
    }

    /// Derives a per-envelope key using HKDF-SHA256.
    fn derive(&self, salt: &[u8]) -> Result<[u8; KEY_SIZE], SealError> {
        let hk = Hkdf::<Sha256>::new(Some(salt), &self.bytes);
        let mut derived = [0u8; KEY_SIZE];
        hk.expand(HKDF_INFO, &mut derived)
            .map_err(|_| SealError::EncryptionFailed("HKDF expansion failed".to_string()))?;
        Ok(derived)
    }
}

impl std::fmt::Debug for SealKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealKey")
            .field("bytes", &"[REDACTED]")
            .field("key_id", &self.key_id())
            .finish()
    }
}

/// Sealed result bundle as it crosses the trust boundary.
///
/// All binary fields are base64 encoded so the envelope survives any
/// JSON-clean transport.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncryptedEnvelope {
    /// Envelope format version.
    pub version: u32,
    /// Fingerprint of the sealing key.
    pub key_id: String,
    /// Per-envelope key derivation salt.
    pub salt: String,
    /// AES-GCM nonce.
    pub nonce: String,
    /// Ciphertext without the trailing tag.
    pub ciphertext: String,
    /// GCM authentication tag.
    pub tag: String,
}

impl EncryptedEnvelope {
    /// Writes the envelope as JSON.
    pub fn write_to(&self, path: &Path) -> Result<(), SealError> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Reads an envelope previously written with [`write_to`](Self::write_to).
    pub fn read_from(path: &Path) -> Result<Self, SealError> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Seals a result bundle under the supplied key.
pub fn seal(bundle: &ResultBundle, key: &SealKey) -> Result<EncryptedEnvelope, SealError> {
    let plaintext = serde_json::to_vec(bundle)?;

    let mut salt = [0u8; SALT_SIZE];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut salt);

    let derived = key.derive(&salt)?;
    let cipher = Aes256Gcm::new_from_slice(&derived)
        .map_err(|e| SealError::EncryptionFailed(format!("Failed to create cipher: {}", e)))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let sealed = cipher
        .encrypt(&nonce, plaintext.as_slice())
        .map_err(|e| SealError::EncryptionFailed(format!("Encryption failed: {}", e)))?;

    // AES-GCM appends the tag to the ciphertext; carry them as separate fields.
    let split = sealed.len() - TAG_SIZE;
    let (ciphertext, tag) = sealed.split_at(split);

    Ok(EncryptedEnvelope {
        version: ENVELOPE_VERSION,
        key_id: key.key_id(),
        salt: BASE64.encode(salt),
        nonce: BASE64.encode(nonce),
        ciphertext: BASE64.encode(ciphertext),
        tag: BASE64.encode(tag),
    })
}

/// Opens a sealed envelope, verifying authenticity.
///
/// A wrong key is reported as [`SealError::KeyMismatch`] when the fingerprint
/// disagrees; an envelope whose fingerprint was forged to match still fails
/// with [`SealError::AuthenticationFailed`] at tag verification. Every
/// authentication failure maps to the same error so nothing about the
/// plaintext leaks.
pub fn open(envelope: &EncryptedEnvelope, key: &SealKey) -> Result<ResultBundle, SealError> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(SealError::InvalidFormat(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    let actual = key.key_id();
    if envelope.key_id != actual {
        return Err(SealError::KeyMismatch {
            expected: envelope.key_id.clone(),
            actual,
        });
    }

    let salt = BASE64.decode(&envelope.salt)?;
    let nonce_bytes = BASE64.decode(&envelope.nonce)?;
    let ciphertext = BASE64.decode(&envelope.ciphertext)?;
    let tag = BASE64.decode(&envelope.tag)?;

    if nonce_bytes.len() != NONCE_SIZE {
        return Err(SealError::InvalidFormat(format!(
            "nonce must be {} bytes, got {}",
            NONCE_SIZE,
            nonce_bytes.len()
        )));
    }
    if tag.len() != TAG_SIZE {
        return Err(SealError::InvalidFormat(format!(
            "tag must be {} bytes, got {}",
            TAG_SIZE,
            tag.len()
        )));
    }

    let derived = key.derive(&salt)?;
    let cipher = Aes256Gcm::new_from_slice(&derived)
        .map_err(|e| SealError::EncryptionFailed(format!("Failed to create cipher: {}", e)))?;

    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext = cipher
        .decrypt(nonce, sealed.as_slice())
        .map_err(|_| SealError::AuthenticationFailed)?;

    Ok(serde_json::from_slice(&plaintext)?)
}
