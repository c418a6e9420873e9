//! # Avalanche Proto Crate
//!
//! Data contracts shared by every avalanche participant: stake proofs,
//! delegations, inventory items, vote codes and the wire messages that
//! carry them.
//!
//! ## Modules
//!
//! - [`stake`]: `Stake`, `SignedStake`, stake commitments
//! - [`proof`]: `Proof`, `ProofBuilder`, stateless proof validation
//! - [`delegation`]: `Delegation`, `DelegationBuilder`
//! - [`inv`]: `Inv`, `InvKind`, `Vote`, `VoteCode`
//! - [`compact`]: `CompactProofs` and short ids
//! - [`message`]: `Message` enum and bincode codec
//!
//! ## Trust Boundary
//!
//! ```text
//!  bytes from network
//!        │  Message::decode (size limit, no panics)
//!        ▼
//!  typed Message ──▶ Proof::verify / Delegation::verify ──▶ avalanche core
//! ```

pub mod compact;
pub mod delegation;
pub mod inv;
pub mod message;
pub mod proof;
pub mod stake;

pub use compact::{short_proof_id, CompactProofs, CompactProofsError, PrefilledProof};
pub use delegation::{Delegation, DelegationBuilder, DelegationError, DelegationLevel, MAX_DELEGATION_LEVELS};
pub use inv::{Inv, InvKind, Vote, VoteCode};
pub use message::{hello_hash, CodecError, Hello, Message, Poll, Response, SessionNonces, MAX_MESSAGE_SIZE};
pub use proof::{compute_proof_id, Proof, ProofBuilder, ProofRef, ProofValidationError, MAX_PROOF_STAKES};
pub use stake::{stake_commitment, SignedStake, Stake};
