//! # Avalanche Core Crate
//!
//! Stake-weighted avalanche pre-consensus on top of a proof-of-work chain.
//!
//! ## Module Overview
//!
//! | Module | Role |
//! |--------|------|
//! | `proof_store` | proof admission: bound, conflicting, immature, dangling, invalid |
//! | `proof_pool` | one pool of proofs with its utxo index |
//! | `peer_manager` | peers, nodes, stake slots, quorum |
//! | `relay` | compact `getavaproofs` reconciliation |
//! | `vote_record` | confidence accumulation for a single item |
//! | `processor` | the voting engine: polls, responses, message dispatch |
//! | `finality` | chain tip, mempool coherence, staking rewards, tx pre-consensus |
//! | `network` | `AvalancheNetwork` trait and the in-memory hub |
//! | `event_loop` | tokio tasks wiring processor, finality and network |
//! | `availability` / `misbehavior` / `addr_limiter` | node health and address discovery |
//!
//! ## Data Flow
//!
//! ```text
//!  network ──▶ EventLoop::handle ──▶ Processor::process_message
//!                                        │ proofs ─▶ PeerManager ─▶ ProofStore
//!                                        │ votes  ─▶ VoteRecord
//!                                        ▼
//!                                   VoteUpdate channel
//!                                        ▼
//!                            FinalityIntegration::apply_update
//!                                        │ ChainValidator::apply_reorg
//!                                        └ Mempool evict / restore
//! ```

pub mod addr_limiter;
pub mod availability;
pub mod error;
pub mod event_loop;
pub mod events;
pub mod finality;
pub mod ids;
pub mod misbehavior;
pub mod network;
pub mod peer_manager;
pub mod processor;
pub mod proof_pool;
pub mod proof_store;
pub mod relay;
pub mod vote_record;

#[cfg(test)]
mod test_utils;

pub use error::{AuthError, FinalityError, ProofError, ProtocolViolation};
pub use event_loop::{unix_now_ms, EventLoop};
pub use events::{update_channel, ItemOracle, UpdateReceiver, UpdateSender, VoteItem, VoteStatus, VoteUpdate};
pub use finality::{ChainTipGuard, FinalityIntegration, MempoolCoherence, StakingRewardsPolicy, TxPreconsensus};
pub use ids::{ConnectionDirection, NodeId, PeerId};
pub use network::{AvalancheNetwork, MemoryHub, MemoryNetwork, NetworkError};
pub use peer_manager::{NodeInfo, PeerInfo, PeerManager};
pub use processor::{Maintenance, MessageOutcome, Processor, VotingStats};
pub use proof_store::{ProofCounters, ProofStore, RegistrationMode, RejectionMode};
pub use relay::ProofRelay;
pub use vote_record::VoteRecord;
