//! # Avalanche Common Crate
//!
//! Shared building blocks for the avalanche pre-consensus layer.
//!
//! ## Modules
//! - `types`: hash newtypes (`ProofId`, `BlockHash`, ...), amounts, outpoints, payout scripts
//! - `hash`: SHA3-256d hash writer used for every content identifier
//! - `crypto`: Ed25519 keys and signatures
//! - `config`: `AvalancheConfig` loaded from TOML
//! - `cooldown`: deterministic cooldown periods
//!
//! ## Identifier Derivation
//! ```text
//! ┌──────────────┐   H(seq‖exp‖payout‖stakes)   ┌────────────────┐
//! │ proof fields │ ───────────────────────────▶ │ LimitedProofId │
//! └──────────────┘                              └───────┬────────┘
//!                                        H(limited‖master)│
//!                                                ┌───────▼────────┐
//!                                                │    ProofId     │
//!                                                └────────────────┘
//! ```

pub mod config;
pub mod cooldown;
pub mod crypto;
pub mod hash;
pub mod types;

pub use config::{AvalancheConfig, ConfigError};
pub use cooldown::CooldownPeriod;
pub use crypto::{CryptoError, PublicKey, SecretKey, Signature};
pub use hash::HashWriter;
pub use types::{
    Amount, BlockHash, DelegationId, Hash256, HexError, LimitedProofId, OutPoint, ProofId, Script,
    StakeId, TxId, COIN,
};
