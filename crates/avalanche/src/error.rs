//! # Avalanche Error Taxonomy
//!
//! | Category | Type | Handling |
//! |----------|------|----------|
//! | Admission | `ProofError` | rejected locally, never a fault |
//! | Authentication | `AuthError` | bad signatures escalate to `ProtocolViolation` |
//! | Protocol | `ProtocolViolation` | adds `ban_score()` to the sender |
//! | Policy | (none) | surfaced as a `Parked` vote |
//! | Finality | `FinalityError` | logged by the finality worker |
//! | Timeouts | (none) | silently expire, retried elsewhere |
//!
//! Nothing here is raised by a panic path: every parse and verification
//! step on attacker-supplied data returns one of these values.

use ava_chain::ChainError;
use ava_common::{Amount, BlockHash, OutPoint, ProofId};
use ava_proto::{CompactProofsError, DelegationError, ProofValidationError};
use thiserror::Error;

// ════════════════════════════════════════════════════════════════════════════════
// PROOF ADMISSION
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("proof {0} already registered")]
    AlreadyRegistered(ProofId),

    #[error("invalid signature: {0}")]
    InvalidSignature(ProofValidationError),

    #[error("insufficient stake: {actual} < {required}")]
    InsufficientStake { required: Amount, actual: Amount },

    #[error("proof expired at {expiration}")]
    Expired { expiration: i64 },

    #[error("stake amount {amount} below dust threshold {threshold}")]
    DustStake { amount: Amount, threshold: Amount },

    #[error("invalid proof: {0}")]
    Invalid(ProofValidationError),

    #[error("stake utxo {0} not found")]
    MissingUtxo(OutPoint),

    #[error("stake utxo {0} does not match the chain")]
    UtxoMismatch(OutPoint),

    #[error("stake utxo {0} is immature, proof kept as orphan")]
    Immature(OutPoint),

    #[error("conflicting proof cooldown not elapsed, {remaining_secs}s remaining")]
    CooldownNotElapsed { remaining_secs: u64 },

    #[error("proof conflicts with a registered proof, kept as conflicting")]
    Conflicting,

    #[error("proof is not preferred over the current conflicting proof")]
    Rejected,

    #[error("proof was invalidated by vote")]
    Invalidated,

    #[error("proof {0} is not an orphan")]
    NotOrphan(ProofId),

    #[error("proof was evicted as dangling")]
    EvictedDangling,
}

impl From<ProofValidationError> for ProofError {
    fn from(e: ProofValidationError) -> Self {
        match e {
            ProofValidationError::InvalidStakeSignature { .. }
            | ProofValidationError::InvalidProofSignature => ProofError::InvalidSignature(e),
            ProofValidationError::Expired { expiration, .. } => ProofError::Expired { expiration },
            ProofValidationError::DustThreshold { amount, threshold } => {
                ProofError::DustStake { amount, threshold }
            }
            other => ProofError::Invalid(other),
        }
    }
}

impl ProofError {
    /// Whether the proof was kept in one of the side pools.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        matches!(self, ProofError::Immature(_) | ProofError::Conflicting)
    }

    /// Whether relaying this proof is evidence of misbehavior.
    #[must_use]
    pub fn is_misbehavior(&self) -> bool {
        matches!(
            self,
            ProofError::InvalidSignature(_) | ProofError::Invalid(_) | ProofError::DustStake { .. }
        )
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// NODE AUTHENTICATION
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The node is remembered as pending until the proof shows up.
    #[error("unknown proof {0}")]
    UnknownProof(ProofId),

    #[error("bad delegation: {0}")]
    BadDelegationSignature(DelegationError),

    #[error("bad avahello signature")]
    BadHelloSignature,

    #[error("node already sent avahello")]
    DuplicateHello,

    #[error("no session nonces for node")]
    NoSession,
}

// ════════════════════════════════════════════════════════════════════════════════
// PROTOCOL VIOLATIONS
// ════════════════════════════════════════════════════════════════════════════════

/// Ban score of a clearly malicious message.
pub const BAN_SCORE_MAX: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("unexpected-ava-response: round {round}")]
    UnexpectedResponse { round: u64 },

    #[error("invalid-ava-response-size: expected {expected}, got {actual}")]
    InvalidResponseSize { expected: usize, actual: usize },

    #[error("invalid-ava-response-content")]
    InvalidResponseContent,

    #[error("invalid-ava-response-signature")]
    InvalidResponseSignature,

    #[error("too-many-ava-poll: {count} > {max}")]
    PollTooLarge { count: usize, max: usize },

    #[error("invalid-avahello: {0}")]
    InvalidHello(AuthError),

    #[error("unsolicited-avaproofs")]
    UnsolicitedAvaProofs,

    #[error("invalid-avaproofs: {0}")]
    InvalidAvaProofs(CompactProofsError),

    #[error("unsolicited-avaproofsreq")]
    UnsolicitedAvaProofsReq,

    #[error("avaproofsreq-index-out-of-range: {index} >= {len}")]
    AvaProofsReqOutOfRange { index: u32, len: usize },

    #[error("avaproofsreq-duplicated-index: {index}")]
    AvaProofsReqDuplicate { index: u32 },

    #[error("unrequested-avaproof")]
    UnrequestedProof,

    #[error("invalid-avaproof: {0}")]
    InvalidProof(ProofError),

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolViolation {
    /// Misbehavior points added to the sender.
    #[must_use]
    pub fn ban_score(&self) -> u32 {
        match self {
            ProtocolViolation::UnexpectedResponse { .. } => 10,
            ProtocolViolation::PollTooLarge { .. }
            | ProtocolViolation::UnsolicitedAvaProofs
            | ProtocolViolation::UnsolicitedAvaProofsReq
            | ProtocolViolation::UnrequestedProof => 20,
            ProtocolViolation::InvalidHello(AuthError::DuplicateHello) => 20,
            ProtocolViolation::InvalidResponseSize { .. }
            | ProtocolViolation::InvalidResponseContent
            | ProtocolViolation::InvalidResponseSignature
            | ProtocolViolation::InvalidHello(_)
            | ProtocolViolation::InvalidAvaProofs(_)
            | ProtocolViolation::AvaProofsReqOutOfRange { .. }
            | ProtocolViolation::AvaProofsReqDuplicate { .. }
            | ProtocolViolation::InvalidProof(_)
            | ProtocolViolation::Malformed(_) => BAN_SCORE_MAX,
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// FINALITY
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FinalityError {
    #[error("block {0} is not known")]
    UnknownBlock(BlockHash),

    #[error("block {0} conflicts with the finalized chain")]
    ConflictsWithFinalized(BlockHash),

    #[error("no eligible tip")]
    NoEligibleTip,

    #[error(transparent)]
    Chain(#[from] ChainError),
}
