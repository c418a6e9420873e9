//! Ed25519 keys and signatures.
//!
//! Compatible with ed25519-dalek v2 with the `rand_core` feature enabled.
//! Verification uses `verify_strict` so malleable signatures are refused.
//!
//! `PublicKey` and `Signature` are plain byte wrappers so they can be
//! hashed, ordered and serialized without touching curve arithmetic. The
//! curve point is only decoded when a signature is checked, and a key that
//! fails to decode simply fails verification.

use std::fmt;

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::types::Hash256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, found {found}")]
    InvalidKeyLength { expected: usize, found: usize },

    #[error("hex decode error: {0}")]
    Hex(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// SECRET KEY
// ════════════════════════════════════════════════════════════════════════════════

/// Ed25519 signing key. Never serialized.
#[derive(Clone)]
pub struct SecretKey(SigningKey);

impl SecretKey {
    /// Fresh key from the OS random source.
    #[must_use]
    pub fn generate() -> Self {
        let mut rng = OsRng;
        Self(SigningKey::generate(&mut rng))
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self(SigningKey::from_bytes(bytes))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let raw = hex::decode(s).map_err(|e| CryptoError::Hex(e.to_string()))?;
        if raw.len() != 32 {
            return Err(CryptoError::InvalidKeyLength { expected: 32, found: raw.len() });
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        Ok(Self::from_bytes(&bytes))
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key().to_bytes())
    }

    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message).to_bytes())
    }

    #[must_use]
    pub fn sign_hash(&self, hash: &Hash256) -> Signature {
        self.sign(hash.as_bytes())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey({})", self.public_key())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// PUBLIC KEY
// ════════════════════════════════════════════════════════════════════════════════

/// Ed25519 verifying key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    #[must_use]
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Strict Ed25519 verification. Undecodable keys never verify.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(vk) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&signature.0);
        vk.verify_strict(message, &sig).is_ok()
    }

    #[must_use]
    pub fn verify_hash(&self, hash: &Hash256, signature: &Signature) -> bool {
        self.verify(hash.as_bytes(), signature)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// SIGNATURE
// ════════════════════════════════════════════════════════════════════════════════

/// 64-byte Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 64]);

impl Signature {
    #[must_use]
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 64])
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Signature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct SignatureVisitor;

impl<'de> Visitor<'de> for SignatureVisitor {
    type Value = Signature;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("64 signature bytes")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Signature, E> {
        if v.len() != 64 {
            return Err(E::invalid_length(v.len(), &self));
        }
        let mut out = [0u8; 64];
        out.copy_from_slice(v);
        Ok(Signature(out))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Signature, E> {
        self.visit_bytes(&v)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Signature, A::Error> {
        let mut out = [0u8; 64];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        if seq.next_element::<u8>()?.is_some() {
            return Err(de::Error::invalid_length(65, &self));
        }
        Ok(Signature(out))
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(SignatureVisitor)
    }
}
