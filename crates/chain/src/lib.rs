//! # Avalanche Chain Interfaces
//!
//! The avalanche layer sits above a proof-of-work chain it does not own.
//! This crate pins down the interfaces it consumes and ships in-memory
//! implementations for tests and simulation.
//!
//! ## Module Overview
//!
//! | Module | Role |
//! |--------|--------|
//! | `block` | `Transaction`, `TxOut`, `Coin`, `Block` |
//! | `rules` | `UpgradeId`, `RuleSet`, `ActivationSchedule` (median-time-past keyed) |
//! | `validator` | `ChainValidator` and `TxValidator` traits, `RuleBasedValidator` |
//! | `memory` | `MemoryChain`: block tree + UTXO set |
//! | `mempool` | `Mempool` trait, `MemoryMempool` |

pub mod block;
pub mod memory;
pub mod mempool;
pub mod rules;
pub mod validator;

pub use block::{Block, BlockRef, Coin, Transaction, TxOut};
pub use memory::MemoryChain;
pub use mempool::{MemoryMempool, Mempool, MempoolError, PoolState};
pub use rules::{ActivationSchedule, RuleSet, Upgrade, UpgradeId};
pub use validator::{BlockInfo, ChainError, ChainValidator, ReorgOutcome, RuleBasedValidator, TxRejection, TxValidator};
