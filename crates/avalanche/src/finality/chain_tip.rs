//! # Chain Tip Guard
//!
//! Avalanche overrides on top of "most work wins".
//!
//! | Vote outcome | Effect |
//! |--------------|--------|
//! | `Rejected` | block parked: it and its descendants leave tip selection |
//! | `Accepted` | parked mark removed |
//! | `Invalid` | block invalidated for good |
//! | `Finalized` | finalization tip moves forward; it is never reorged away |
//!
//! ```text
//!              ┌── b2 ── b3      (parked at b2: b2, b3 excluded)
//!  g ── a1 ── a2 ── a3 ── a4    (finalized at a2: every tip must contain a2)
//!        └── c2 ── c3 ── c4 ── c5 ── c6   (excluded, does not contain a2)
//! ```

use std::collections::HashSet;

use ava_chain::{BlockInfo, ChainValidator};
use ava_common::BlockHash;
use ava_proto::VoteCode;
use tracing::info;

use crate::error::FinalityError;

#[derive(Debug, Default)]
pub struct ChainTipGuard {
    finalization_tip: Option<BlockInfo>,
    parked: HashSet<BlockHash>,
    invalidated: HashSet<BlockHash>,
}

impl ChainTipGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn finalization_tip(&self) -> Option<BlockHash> {
        self.finalization_tip.as_ref().map(|b| b.hash)
    }

    #[must_use]
    pub fn is_parked(&self, hash: &BlockHash) -> bool {
        self.parked.contains(hash)
    }

    #[must_use]
    pub fn is_invalidated(&self, hash: &BlockHash) -> bool {
        self.invalidated.contains(hash)
    }

    /// Park `hash`. A block inside the finalized chain cannot be parked.
    pub fn park(&mut self, chain: &dyn ChainValidator, hash: BlockHash) -> bool {
        if self.is_finalized(chain, &hash) {
            return false;
        }
        let parked = self.parked.insert(hash);
        if parked {
            info!("block {} parked by vote", hash);
        }
        parked
    }

    pub fn unpark(&mut self, hash: &BlockHash) -> bool {
        self.parked.remove(hash)
    }

    pub fn invalidate(&mut self, chain: &dyn ChainValidator, hash: BlockHash) -> bool {
        if self.is_finalized(chain, &hash) {
            return false;
        }
        self.parked.remove(&hash);
        let invalidated = self.invalidated.insert(hash);
        if invalidated {
            info!("block {} invalidated by vote", hash);
        }
        invalidated
    }

    /// Move the finalization tip to `hash`. Finalizing an ancestor of the
    /// current finalization tip is a no-op.
    pub fn finalize(&mut self, chain: &dyn ChainValidator, hash: BlockHash) -> Result<bool, FinalityError> {
        let info = chain.block_info(&hash).ok_or(FinalityError::UnknownBlock(hash))?;
        if let Some(current) = &self.finalization_tip {
            if chain.is_ancestor(&hash, &current.hash) {
                return Ok(false);
            }
            if !chain.is_ancestor(&current.hash, &hash) {
                return Err(FinalityError::ConflictsWithFinalized(hash));
            }
        }
        if self.is_excluded(chain, &hash) {
            return Err(FinalityError::ConflictsWithFinalized(hash));
        }
        info!("block {} finalized at height {}", hash, info.height);
        self.finalization_tip = Some(info);
        Ok(true)
    }

    /// Whether `hash` is the finalization tip or one of its ancestors.
    #[must_use]
    pub fn is_finalized(&self, chain: &dyn ChainValidator, hash: &BlockHash) -> bool {
        self.finalization_tip
            .as_ref()
            .is_some_and(|tip| chain.is_ancestor(hash, &tip.hash))
    }

    /// Whether the chain ending at `hash` is out of tip selection.
    #[must_use]
    pub fn is_excluded(&self, chain: &dyn ChainValidator, hash: &BlockHash) -> bool {
        let marked = self
            .parked
            .iter()
            .chain(self.invalidated.iter())
            .any(|m| chain.is_ancestor(m, hash));
        if marked {
            return true;
        }
        match &self.finalization_tip {
            Some(tip) => !chain.is_ancestor(&tip.hash, hash),
            None => false,
        }
    }

    /// Most-work eligible block. Ties keep the active tip.
    #[must_use]
    pub fn select_tip(&self, chain: &dyn ChainValidator) -> Option<BlockHash> {
        let active = chain.active_tip();
        chain
            .candidates()
            .into_iter()
            .filter(|b| b.valid && chain.is_valid_block(&b.hash))
            .filter(|b| !self.is_excluded(chain, &b.hash))
            .max_by(|a, b| {
                a.chain_work
                    .cmp(&b.chain_work)
                    .then_with(|| (Some(a.hash) == active).cmp(&(Some(b.hash) == active)))
                    .then_with(|| b.hash.cmp(&a.hash))
            })
            .map(|b| b.hash)
    }

    /// Our vote on a block. `policy_ok` is the staking reward check.
    #[must_use]
    pub fn local_vote(&self, chain: &dyn ChainValidator, hash: &BlockHash, policy_ok: bool) -> VoteCode {
        if chain.block_info(hash).is_none() {
            return VoteCode::Unknown;
        }
        if !chain.is_valid_block(hash) || self.invalidated.iter().any(|m| chain.is_ancestor(m, hash)) {
            return VoteCode::Rejected;
        }
        if self.parked.iter().any(|m| chain.is_ancestor(m, hash)) || !policy_ok {
            return VoteCode::Parked;
        }
        if chain.is_on_active_chain(hash) {
            return VoteCode::Accepted;
        }
        VoteCode::Fork
    }

    #[must_use]
    pub fn is_worth_polling(&self, chain: &dyn ChainValidator, hash: &BlockHash) -> bool {
        let Some(info) = chain.block_info(hash) else {
            return false;
        };
        if !chain.is_valid_block(hash) || self.is_invalidated(hash) {
            return false;
        }
        match &self.finalization_tip {
            Some(tip) => info.height > tip.height,
            None => true,
        }
    }
}
