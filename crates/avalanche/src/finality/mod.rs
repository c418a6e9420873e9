//! Finality integration: the chain tip, the mempool, staking rewards and
//! transaction pre-consensus as driven by vote outcomes.

pub mod chain_tip;
pub mod integration;
pub mod mempool_coherence;
pub mod preconsensus;
pub mod staking_rewards;

pub use chain_tip::ChainTipGuard;
pub use integration::FinalityIntegration;
pub use mempool_coherence::{CoherenceReport, MempoolCoherence};
pub use preconsensus::TxPreconsensus;
pub use staking_rewards::{acceptable_winners, RewardCheck, RewardWinner, StakingRewardsPolicy};
