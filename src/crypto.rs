//! Key material and the pluggable cipher capability.
//!
//! The lock protocol seals every secure frame with a symmetric cipher and a
//! MAC. This crate does not ship the primitives: callers provide them through
//! the [`Cipher`] trait, which keeps the protocol core testable without real
//! cryptographic material.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::{LockError, Result};

/// Length of offline and session keys in bytes
pub const KEY_SIZE: usize = 16;

/// Length of a nonce in bytes
pub const NONCE_SIZE: usize = 16;

/// A 16-byte symmetric key (offline key or negotiated session key)
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Key([u8; KEY_SIZE]);

impl Key {
    /// Wrap raw key bytes
    #[must_use]
    pub const fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key from its 32-character hex form
    ///
    /// # Errors
    ///
    /// Returns [`LockError::InvalidParameters`] if the string is not valid hex
    /// or does not decode to exactly 16 bytes.
    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value.trim())
            .map_err(|e| LockError::InvalidParameters(format!("Invalid key hex: {e}")))?;
        let bytes: [u8; KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
            LockError::InvalidParameters(format!(
                "Key must be {KEY_SIZE} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Build a session key from the two 8-byte handshake halves
    #[must_use]
    pub fn from_halves(ours: &[u8; 8], theirs: &[u8; 8]) -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        bytes[..8].copy_from_slice(ours);
        bytes[8..].copy_from_slice(theirs);
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

// Never print key material.
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Key(..)")
    }
}

impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Key {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Self::from_hex(&value).map_err(de::Error::custom)
    }
}

/// Which way a sealed frame travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Host to lock
    ToLock = 0x00,
    /// Lock to host
    FromLock = 0x01,
    /// Lock advertisement broadcast
    Broadcast = 0x02,
}

/// Per-frame nonce: 32-bit little-endian counter, direction byte, zero padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Build the nonce for frame `counter` travelling in `direction`
    #[must_use]
    pub fn new(counter: u32, direction: Direction) -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        bytes[..4].copy_from_slice(&counter.to_le_bytes());
        bytes[4] = direction as u8;
        Self(bytes)
    }

    /// Raw nonce bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

/// Symmetric cipher and MAC used to seal secure frames.
///
/// `encrypt` and `decrypt` must be length preserving; the codec always passes
/// exactly one 16-byte block. `mac` may return any length of at least 4 bytes;
/// the codec keeps the first 4.
pub trait Cipher: Send + Sync {
    /// Encrypt `data` under `key` and `nonce`
    fn encrypt(&self, key: &Key, nonce: &Nonce, data: &[u8]) -> Vec<u8>;

    /// Decrypt `data` under `key` and `nonce`
    fn decrypt(&self, key: &Key, nonce: &Nonce, data: &[u8]) -> Vec<u8>;

    /// Compute an authentication code over `data`
    fn mac(&self, key: &Key, data: &[u8]) -> Vec<u8>;
}
