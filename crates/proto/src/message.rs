//! # Avalanche Wire Messages
//!
//! | Command | Payload | Direction |
//! |---------|---------|-----------|
//! | `avahello` | delegation + session signature | both, once per link |
//! | `avapoll` | round id + invs | poller → node |
//! | `avaresponse` | round id + votes + signature | node → poller |
//! | `getavaaddr` | none | asks for avalanche node addresses |
//! | `addr` | socket addresses | answer to `getavaaddr` |
//! | `getavaproofs` | none | opens compact proof reconciliation |
//! | `avaproofs` | compact proofs | answer to `getavaproofs` |
//! | `avaproofsreq` | short id indices | missing proofs |
//! | `avaproof` | full proof | answer to `avaproofsreq` |
//!
//! Messages are encoded with bincode (fixed-int, little endian). Decoding
//! enforces `MAX_MESSAGE_SIZE` before allocating, rejects trailing bytes
//! and never panics on hostile input.

use std::net::SocketAddr;

use ava_common::{DelegationId, Hash256, HashWriter, SecretKey, Signature};
use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compact::CompactProofs;
use crate::delegation::Delegation;
use crate::inv::{Inv, Vote};
use crate::proof::Proof;

/// Upper bound on an encoded message.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Maximum entries in an `addr` answer.
pub const MAX_ADDR_TO_SEND: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// HELLO
// ════════════════════════════════════════════════════════════════════════════════

/// Per-link nonces exchanged during the transport handshake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionNonces {
    pub local: u64,
    pub remote: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub delegation: Delegation,
    /// Delegated key signature over `hello_hash`.
    pub signature: Signature,
}

/// Challenge for one direction of a link: signer nonce first.
#[must_use]
pub fn hello_hash(delegation_id: &DelegationId, signer_nonce: u64, verifier_nonce: u64) -> Hash256 {
    let mut w = HashWriter::new();
    w.write(delegation_id.as_bytes())
        .write_u64(signer_nonce)
        .write_u64(verifier_nonce);
    w.finalize()
}

impl Hello {
    /// Sign as the local side of a link.
    #[must_use]
    pub fn sign(delegation: Delegation, session_key: &SecretKey, nonces: SessionNonces) -> Self {
        let hash = hello_hash(&delegation.delegation_id(), nonces.local, nonces.remote);
        let signature = session_key.sign_hash(&hash);
        Self { delegation, signature }
    }

    /// Hash the remote side should have signed, from the local view.
    #[must_use]
    pub fn expected_hash(&self, nonces: SessionNonces) -> Hash256 {
        hello_hash(&self.delegation.delegation_id(), nonces.remote, nonces.local)
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// POLL / RESPONSE
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub round: u64,
    pub invs: Vec<Inv>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub round: u64,
    /// Milliseconds the poller should wait before polling this node again.
    pub cooldown_ms: u32,
    pub votes: Vec<Vote>,
}

impl Response {
    #[must_use]
    pub fn signing_hash(&self) -> Hash256 {
        let mut w = HashWriter::new();
        w.write_u64(self.round)
            .write_u32(self.cooldown_ms)
            .write_compact_size(self.votes.len() as u64);
        for v in &self.votes {
            w.write(&v.code.code().to_le_bytes()).write_hash(&v.hash);
        }
        w.finalize()
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// MESSAGE
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    AvaHello(Hello),
    AvaPoll(Poll),
    AvaResponse { response: Response, signature: Signature },
    GetAvaAddr,
    Addr(Vec<SocketAddr>),
    GetAvaProofs,
    AvaProofs(CompactProofs),
    AvaProofsReq(Vec<u32>),
    AvaProof(Proof),
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_MESSAGE_SIZE as u64)
}

impl Message {
    #[must_use]
    pub fn command(&self) -> &'static str {
        match self {
            Message::AvaHello(_) => "avahello",
            Message::AvaPoll(_) => "avapoll",
            Message::AvaResponse { .. } => "avaresponse",
            Message::GetAvaAddr => "getavaaddr",
            Message::Addr(_) => "addr",
            Message::GetAvaProofs => "getavaproofs",
            Message::AvaProofs(_) => "avaproofs",
            Message::AvaProofsReq(_) => "avaproofsreq",
            Message::AvaProof(_) => "avaproof",
        }
    }

    /// Sign and wrap a poll response.
    #[must_use]
    pub fn signed_response(response: Response, session_key: &SecretKey) -> Self {
        let signature = session_key.sign_hash(&response.signing_hash());
        Message::AvaResponse { response, signature }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec().serialize(self).map_err(|e| match *e {
            bincode::ErrorKind::SizeLimit => CodecError::TooLarge {
                size: MAX_MESSAGE_SIZE + 1,
                max: MAX_MESSAGE_SIZE,
            },
            other => CodecError::Encode(other.to_string()),
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() > MAX_MESSAGE_SIZE {
            return Err(CodecError::TooLarge { size: bytes.len(), max: MAX_MESSAGE_SIZE });
        }
        if bytes.is_empty() {
            return Err(CodecError::Decode("empty input".to_string()));
        }
        codec()
            .deserialize(bytes)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}
