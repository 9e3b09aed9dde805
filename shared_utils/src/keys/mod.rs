//! Tunnel key handling.
//!
//! Keys are Curve25519 values carried as standard base64 strings everywhere in
//! Veil. Conversion to the hex form the engine expects happens only at the
//! engine boundary.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length in bytes of every tunnel key.
pub const KEY_LENGTH: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("key must decode to {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Decode a base64 key into its raw 32 bytes.
pub fn decode_key(encoded: &str) -> Result<[u8; KEY_LENGTH], KeyError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| KeyError::InvalidEncoding(e.to_string()))?;
    let actual = bytes.len();
    bytes.try_into().map_err(|_| KeyError::InvalidLength {
        expected: KEY_LENGTH,
        actual,
    })
}

pub fn encode_key(bytes: &[u8; KEY_LENGTH]) -> String {
    STANDARD.encode(bytes)
}

/// A private/public key pair, both base64.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Key generation and validation capability.
pub trait KeyProvider: Send + Sync {
    /// Generate a fresh key pair.
    fn generate(&self) -> KeyPair;

    /// Check that `key` is base64 of exactly 32 bytes.
    fn validate(&self, key: &str) -> Result<(), KeyError>;

    /// Derive the base64 public key for a base64 private key.
    fn public_key(&self, private_key: &str) -> Result<String, KeyError>;
}

/// Curve25519 keys via `x25519-dalek`.
#[derive(Debug, Default, Clone, Copy)]
pub struct X25519KeyProvider;

impl KeyProvider for X25519KeyProvider {
    fn generate(&self) -> KeyPair {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        KeyPair {
            private_key: encode_key(&secret.to_bytes()),
            public_key: encode_key(public.as_bytes()),
        }
    }

    fn validate(&self, key: &str) -> Result<(), KeyError> {
        decode_key(key).map(|_| ())
    }

    fn public_key(&self, private_key: &str) -> Result<String, KeyError> {
        let secret = StaticSecret::from(decode_key(private_key)?);
        Ok(encode_key(PublicKey::from(&secret).as_bytes()))
    }
}
