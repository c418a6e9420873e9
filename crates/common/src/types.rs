//! # Core Types
//!
//! Fixed-size identifiers and value types shared by every avalanche crate.
//!
//! ## Identifier Newtypes
//!
//! | Type | Meaning |
//! |------|---------|
//! | `Hash256` | raw 32-byte SHA3-256d digest |
//! | `ProofId` | content hash of a full stake proof |
//! | `LimitedProofId` | proof hash without the master key, bound by delegations |
//! | `StakeId` | hash of a single stake entry, defines stake ordering |
//! | `DelegationId` | folded hash of a delegation chain |
//! | `BlockHash` | block identifier handed out by the chain validator |
//! | `TxId` | transaction identifier handed out by the chain validator |
//!
//! All newtypes convert losslessly to and from `Hash256`, so the voting
//! engine can treat every inventory item as an opaque 32-byte key.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::PublicKey;

// ════════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════════

/// Amount in base units.
pub type Amount = u64;

/// Base units per coin.
pub const COIN: Amount = 100_000_000;

/// Maximum size of a data carrier payout script.
const MAX_OP_RETURN_SCRIPT_SIZE: usize = 223;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_RETURN: u8 = 0x6a;

// ════════════════════════════════════════════════════════════════════════════════
// HEX ERROR
// ════════════════════════════════════════════════════════════════════════════════

/// Error returned when parsing a 32-byte identifier from hex.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HexError {
    #[error("invalid hex: {0}")]
    Decode(String),

    #[error("invalid length: expected 32 bytes, found {0}")]
    Length(usize),
}

// ════════════════════════════════════════════════════════════════════════════════
// HASH256
// ════════════════════════════════════════════════════════════════════════════════

/// A 32-byte digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub const ZERO: Hash256 = Hash256([0u8; 32]);

    #[must_use]
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, HexError> {
        let raw = hex::decode(s).map_err(|e| HexError::Decode(e.to_string()))?;
        if raw.len() != 32 {
            return Err(HexError::Length(raw.len()));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Ok(Self(out))
    }

    /// Little-endian interpretation of the first 8 bytes.
    ///
    /// Used wherever a uniformly distributed `u64` must be derived from a
    /// digest (staking reward draws, deterministic test seeds).
    #[must_use]
    pub fn low_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(buf)
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash256({})", self.to_hex())
    }
}

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
        pub struct $name(pub Hash256);

        impl $name {
            #[must_use]
            #[inline]
            pub const fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(Hash256(bytes))
            }

            #[must_use]
            #[inline]
            pub const fn as_bytes(&self) -> &[u8; 32] {
                &self.0 .0
            }

            #[must_use]
            #[inline]
            pub const fn as_hash(&self) -> &Hash256 {
                &self.0
            }

            pub fn from_hex(s: &str) -> Result<Self, HexError> {
                Hash256::from_hex(s).map(Self)
            }
        }

        impl From<Hash256> for $name {
            fn from(h: Hash256) -> Self {
                Self(h)
            }
        }

        impl From<$name> for Hash256 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0.to_hex())
            }
        }
    };
}

hash_newtype!(
    /// Identifier of a full stake proof.
    ProofId
);
hash_newtype!(
    /// Identifier of a proof without its master key.
    LimitedProofId
);
hash_newtype!(
    /// Identifier of a single stake; stakes are ordered by it.
    StakeId
);
hash_newtype!(
    /// Identifier of a delegation chain.
    DelegationId
);
hash_newtype!(
    /// Block identifier.
    BlockHash
);
hash_newtype!(
    /// Transaction identifier.
    TxId
);

// ════════════════════════════════════════════════════════════════════════════════
// OUTPOINT
// ════════════════════════════════════════════════════════════════════════════════

/// Reference to a transaction output.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

impl OutPoint {
    #[must_use]
    pub const fn new(txid: TxId, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Debug for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutPoint({}:{})", self.txid, self.vout)
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// SCRIPT
// ════════════════════════════════════════════════════════════════════════════════

/// Raw output script. Proofs carry one as the staking reward destination.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Script(pub Vec<u8>);

impl Script {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`
    #[must_use]
    pub fn pay_to_pubkey_hash(hash: &[u8; 20]) -> Self {
        let mut s = Vec::with_capacity(25);
        s.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
        s.extend_from_slice(hash);
        s.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        Self(s)
    }

    /// `<32-byte key> OP_CHECKSIG`
    #[must_use]
    pub fn pay_to_pubkey(key: &PublicKey) -> Self {
        let mut s = Vec::with_capacity(34);
        s.push(32);
        s.extend_from_slice(key.as_bytes());
        s.push(OP_CHECKSIG);
        Self(s)
    }

    /// `OP_RETURN <data>`
    #[must_use]
    pub fn data_carrier(data: &[u8]) -> Self {
        let mut s = Vec::with_capacity(data.len() + 2);
        s.push(OP_RETURN);
        if !data.is_empty() {
            s.push(data.len().min(75) as u8);
            s.extend_from_slice(&data[..data.len().min(75)]);
        }
        Self(s)
    }

    #[must_use]
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether the script matches one of the standard payout templates.
    #[must_use]
    pub fn is_standard(&self) -> bool {
        let s = self.0.as_slice();
        match s.len() {
            25 if s[0] == OP_DUP
                && s[1] == OP_HASH160
                && s[2] == 20
                && s[23] == OP_EQUALVERIFY
                && s[24] == OP_CHECKSIG =>
            {
                true
            }
            23 if s[0] == OP_HASH160 && s[1] == 20 && s[22] == OP_EQUAL => true,
            34 if s[0] == 32 && s[33] == OP_CHECKSIG => true,
            n if n >= 1 && s[0] == OP_RETURN => n <= MAX_OP_RETURN_SCRIPT_SIZE,
            _ => false,
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Script({})", hex::encode(&self.0))
    }
}
