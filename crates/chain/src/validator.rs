//! Interfaces to the black-box chain and script validator.
//!
//! The avalanche layer never validates scripts or blocks itself. It asks
//! these traits, and it orders tip changes through `apply_reorg`.

use ava_common::{BlockHash, OutPoint};
use thiserror::Error;

use crate::block::{BlockRef, Coin, Transaction};
use crate::rules::{RuleSet, UpgradeId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("unknown block {0}")]
    UnknownBlock(BlockHash),

    #[error("block {0} is invalid")]
    InvalidBlock(BlockHash),

    #[error("parent of {0} is unknown")]
    OrphanBlock(BlockHash),

    #[error("block {0} already known")]
    Duplicate(BlockHash),
}

/// Index entry for a known block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub hash: BlockHash,
    pub parent: Option<BlockHash>,
    pub height: u32,
    pub time: i64,
    /// Cumulative work up to and including this block.
    pub chain_work: u128,
    pub median_time_past: i64,
    pub valid: bool,
}

/// Effect of an executed reorg.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReorgOutcome {
    /// Tip-first.
    pub disconnected: Vec<BlockRef>,
    /// Fork-point-first.
    pub connected: Vec<BlockRef>,
    pub old_median_time_past: i64,
    pub new_median_time_past: i64,
}

pub trait ChainValidator: Send + Sync {
    fn block_info(&self, hash: &BlockHash) -> Option<BlockInfo>;

    fn block(&self, hash: &BlockHash) -> Option<BlockRef>;

    /// Consensus validity, independent of avalanche votes.
    fn is_valid_block(&self, hash: &BlockHash) -> bool;

    fn active_tip(&self) -> Option<BlockHash>;

    fn tip_height(&self) -> u32;

    fn is_on_active_chain(&self, hash: &BlockHash) -> bool;

    /// Ancestor of `hash` at `height`, `hash` itself included.
    fn ancestor_at(&self, hash: &BlockHash, height: u32) -> Option<BlockHash>;

    /// Every known block: the candidate set for tip selection.
    fn candidates(&self) -> Vec<BlockInfo>;

    /// Move the active chain to `new_tip`.
    fn apply_reorg(&self, new_tip: &BlockHash) -> Result<ReorgOutcome, ChainError>;

    fn median_time_past(&self) -> i64;

    fn utxo(&self, outpoint: &OutPoint) -> Option<Coin>;

    /// `true` when `ancestor` is `descendant` or one of its ancestors.
    fn is_ancestor(&self, ancestor: &BlockHash, descendant: &BlockHash) -> bool {
        match self.block_info(ancestor) {
            Some(info) => self.ancestor_at(descendant, info.height) == Some(*ancestor),
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxRejection {
    #[error("coinbase cannot enter the mempool")]
    Coinbase,

    #[error("requires inactive {0}")]
    MissingRule(UpgradeId),

    #[error("forbidden under active {0}")]
    ForbiddenByRule(UpgradeId),
}

/// Rule-dependent transaction validity.
pub trait TxValidator: Send + Sync {
    fn check_tx(&self, tx: &Transaction, rules: &RuleSet) -> Result<(), TxRejection>;
}

/// Validator driven by the transaction's declared rule dependencies.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleBasedValidator;

impl TxValidator for RuleBasedValidator {
    fn check_tx(&self, tx: &Transaction, rules: &RuleSet) -> Result<(), TxRejection> {
        if tx.is_coinbase() {
            return Err(TxRejection::Coinbase);
        }
        if let Some(missing) = tx.requires.iter().find(|u| !rules.is_active(**u)) {
            return Err(TxRejection::MissingRule(*missing));
        }
        if let Some(forbidden) = tx.invalid_under.iter().find(|u| rules.is_active(**u)) {
            return Err(TxRejection::ForbiddenByRule(*forbidden));
        }
        Ok(())
    }
}
