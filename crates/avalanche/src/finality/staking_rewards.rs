//! # Staking Rewards Policy
//!
//! Every block must pay a share of its reward to one of the acceptable
//! stakers of its parent.
//!
//! ## Draw
//!
//! Candidates are sorted by proof id and laid out on a ring of length
//! `total_score`, each owning `[start, start + score)`:
//!
//! ```text
//! 0          s1            s2                      total
//! ├── P1 ────┼──── P2 ─────┼────────── P3 ──────────┤
//!                  ▲ target = parent.low_u64() % total
//!            [target - slack, target + slack]   (wraps around)
//! ```
//!
//! `slack = total * slack_percent / 100`. Every candidate whose interval
//! meets the window is acceptable. A wider slack only adds winners.
//!
//! A block whose parent has no computed winners is not checked.

use std::collections::HashMap;

use ava_chain::Block;
use ava_common::{Amount, BlockHash, ProofId, Script};
use ava_proto::ProofRef;
use serde::Serialize;
use tracing::debug;

/// Parents kept below the tip before winners are pruned.
pub const STAKING_WINNERS_DEPTH: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RewardWinner {
    pub proof_id: ProofId,
    pub payout_script: Script,
}

/// Acceptable winners for blocks built on `parent`.
#[must_use]
pub fn acceptable_winners(parent: &BlockHash, candidates: &[ProofRef], slack_percent: u8) -> Vec<RewardWinner> {
    let mut sorted: Vec<&ProofRef> = candidates.iter().collect();
    sorted.sort_by_key(|p| p.proof_id());
    sorted.dedup_by_key(|p| p.proof_id());

    let total: u64 = sorted.iter().map(|p| u64::from(p.score())).sum();
    if total == 0 {
        return Vec::new();
    }
    let total_i = i128::from(total);
    let target = i128::from(parent.0.low_u64() % total);
    let slack = i128::from(total) * i128::from(slack_percent.min(100)) / 100;

    // Inclusive ranges on [0, total).
    let (lo, hi) = (target - slack, target + slack);
    let window: Vec<(i128, i128)> = if hi - lo + 1 >= total_i {
        vec![(0, total_i - 1)]
    } else if lo < 0 {
        vec![(0, hi), (total_i + lo, total_i - 1)]
    } else if hi >= total_i {
        vec![(lo, total_i - 1), (0, hi - total_i)]
    } else {
        vec![(lo, hi)]
    };

    let mut winners = Vec::new();
    let mut start = 0i128;
    for proof in sorted {
        let end = start + i128::from(proof.score());
        if end > start && window.iter().any(|(a, b)| start <= *b && *a <= end - 1) {
            winners.push(RewardWinner { proof_id: proof.proof_id(), payout_script: proof.payout_script.clone() });
        }
        start = end;
    }
    winners
}

/// Smallest coinbase payout to a winner.
#[must_use]
pub fn minimum_reward(block_reward: Amount, percent: u8) -> Amount {
    ((u128::from(block_reward) * u128::from(percent)) / 100) as Amount
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RewardCheck {
    Paid(ProofId),
    /// No winners for the parent, the block is not judged.
    Unchecked,
    Missing { required: Amount },
}

impl RewardCheck {
    #[must_use]
    pub fn is_acceptable(&self) -> bool {
        !matches!(self, RewardCheck::Missing { .. })
    }
}

pub struct StakingRewardsPolicy {
    percent: u8,
    slack_percent: u8,
    winners: HashMap<BlockHash, (u32, Vec<RewardWinner>)>,
}

impl StakingRewardsPolicy {
    #[must_use]
    pub fn new(percent: u8, slack_percent: u8) -> Self {
        Self { percent, slack_percent, winners: HashMap::new() }
    }

    /// Compute and remember the winners for children of `parent`.
    pub fn compute_winners(&mut self, parent: BlockHash, parent_height: u32, candidates: &[ProofRef]) -> &[RewardWinner] {
        let winners = acceptable_winners(&parent, candidates, self.slack_percent);
        debug!(
            "{} staking winner(s) out of {} candidate(s) for parent {}",
            winners.len(),
            candidates.len(),
            parent
        );
        let entry = self.winners.entry(parent).or_insert((parent_height, Vec::new()));
        *entry = (parent_height, winners);
        &entry.1
    }

    #[must_use]
    pub fn winners(&self, parent: &BlockHash) -> Option<&[RewardWinner]> {
        self.winners.get(parent).map(|(_, w)| w.as_slice())
    }

    /// Forget parents below `min_height`.
    pub fn prune(&mut self, min_height: u32) {
        self.winners.retain(|_, (height, _)| *height >= min_height);
    }

    #[must_use]
    pub fn check_block(&self, block: &Block) -> RewardCheck {
        let Some(winners) = block.parent.as_ref().and_then(|p| self.winners(p)) else {
            return RewardCheck::Unchecked;
        };
        if winners.is_empty() {
            return RewardCheck::Unchecked;
        }
        let required = minimum_reward(block.reward, self.percent);
        for out in &block.coinbase.outputs {
            if out.amount < required {
                continue;
            }
            if let Some(w) = winners.iter().find(|w| w.payout_script == out.script) {
                return RewardCheck::Paid(w.proof_id);
            }
        }
        RewardCheck::Missing { required }
    }
}
