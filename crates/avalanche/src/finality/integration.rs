//! # Finality Integration
//!
//! Applies vote outcomes to the chain and the mempool, and answers the
//! voting engine's questions about blocks and transactions.
//!
//! ```text
//!   Processor ──VoteUpdate──▶ FinalityIntegration::apply_update
//!       ▲                          │ block: park / unpark / invalidate / finalize
//!       │                          │        then activate_best_chain ─▶ apply_reorg
//!       │                          │                                   └▶ mempool coherence
//!       │                          └ tx:    pre-consensus set, eviction
//!       └── ItemOracle (is_worth_polling, local_acceptance, local_vote)
//! ```
//!
//! The integration never calls back into the processor. Whoever drives it
//! tells the processor about tip changes through `updated_block_tip`.
//!
//! Lock order: `tip`, then `coherence`, then `preconsensus`. `rewards` is
//! a leaf.

use std::sync::Arc;

use ava_chain::{ActivationSchedule, ChainError, ChainValidator, Mempool, PoolState, ReorgOutcome, Transaction, TxValidator};
use ava_common::{AvalancheConfig, BlockHash, TxId};
use ava_proto::{ProofRef, VoteCode};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::FinalityError;
use crate::events::{ItemOracle, VoteItem, VoteStatus, VoteUpdate};
use crate::finality::chain_tip::ChainTipGuard;
use crate::finality::mempool_coherence::{CoherenceReport, MempoolCoherence};
use crate::finality::preconsensus::TxPreconsensus;
use crate::finality::staking_rewards::{RewardCheck, RewardWinner, StakingRewardsPolicy, STAKING_WINNERS_DEPTH};

/// Tip selections tried when a reorg target fails to connect.
const MAX_REORG_ATTEMPTS: usize = 4;

pub struct FinalityIntegration {
    config: AvalancheConfig,
    chain: Arc<dyn ChainValidator>,
    mempool: Arc<dyn Mempool>,
    tip: RwLock<ChainTipGuard>,
    coherence: Mutex<MempoolCoherence>,
    preconsensus: RwLock<TxPreconsensus>,
    rewards: RwLock<StakingRewardsPolicy>,
}

impl FinalityIntegration {
    pub fn new(
        config: AvalancheConfig,
        chain: Arc<dyn ChainValidator>,
        mempool: Arc<dyn Mempool>,
        schedule: ActivationSchedule,
        validator: Arc<dyn TxValidator>,
    ) -> Self {
        Self {
            tip: RwLock::new(ChainTipGuard::new()),
            coherence: Mutex::new(MempoolCoherence::new(schedule, validator)),
            preconsensus: RwLock::new(TxPreconsensus::new(config.preconsensus)),
            rewards: RwLock::new(StakingRewardsPolicy::new(
                config.staking_reward_percent,
                config.staking_reward_slack_percent,
            )),
            config,
            chain,
            mempool,
        }
    }

    #[must_use]
    pub fn chain(&self) -> &Arc<dyn ChainValidator> {
        &self.chain
    }

    #[must_use]
    pub fn mempool(&self) -> &Arc<dyn Mempool> {
        &self.mempool
    }

    // ────────────────────────────────────────────────────────────────────────
    // vote outcomes
    // ────────────────────────────────────────────────────────────────────────

    /// Apply one vote outcome. Returns the new active tip when it moved.
    pub fn apply_update(&self, update: &VoteUpdate) -> Result<Option<BlockHash>, FinalityError> {
        match update.item {
            VoteItem::Block(hash) => {
                self.apply_block_status(hash, update.status)?;
                self.activate_best_chain()
            }
            VoteItem::Tx(txid) => {
                self.preconsensus.write().on_update(self.mempool.as_ref(), txid, update.status);
                Ok(None)
            }
            VoteItem::Proof(_) => Ok(None),
        }
    }

    fn apply_block_status(&self, hash: BlockHash, status: VoteStatus) -> Result<(), FinalityError> {
        let chain = self.chain.as_ref();
        let mut tip = self.tip.write();
        match status {
            VoteStatus::Rejected => {
                tip.park(chain, hash);
            }
            VoteStatus::Accepted => {
                if tip.unpark(&hash) {
                    info!("block {} unparked by vote", hash);
                }
            }
            VoteStatus::Invalid => {
                tip.invalidate(chain, hash);
            }
            VoteStatus::Finalized => {
                tip.finalize(chain, hash)?;
            }
            VoteStatus::Stale => debug!("block {} went stale", hash),
        }
        Ok(())
    }

    /// Move the active chain to the best eligible tip.
    pub fn activate_best_chain(&self) -> Result<Option<BlockHash>, FinalityError> {
        let chain = self.chain.as_ref();
        for _ in 0..MAX_REORG_ATTEMPTS {
            let target = self.tip.read().select_tip(chain).ok_or(FinalityError::NoEligibleTip)?;
            if chain.active_tip() == Some(target) {
                return Ok(None);
            }
            match chain.apply_reorg(&target) {
                Ok(outcome) => {
                    self.on_reorg(&outcome);
                    return Ok(Some(target));
                }
                Err(ChainError::InvalidBlock(bad)) => {
                    warn!("tip {} failed to connect at {}, selecting again", target, bad);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(FinalityError::NoEligibleTip)
    }

    /// Mempool and pre-consensus bookkeeping after a tip change.
    pub fn on_reorg(&self, outcome: &ReorgOutcome) -> CoherenceReport {
        let report = self.coherence.lock().on_reorg(self.mempool.as_ref(), outcome);
        {
            let mut pre = self.preconsensus.write();
            for block in &outcome.connected {
                pre.on_block_connected(block);
            }
        }
        let min_height = self.chain.tip_height().saturating_sub(STAKING_WINNERS_DEPTH);
        self.rewards.write().prune(min_height);
        report
    }

    // ────────────────────────────────────────────────────────────────────────
    // transactions
    // ────────────────────────────────────────────────────────────────────────

    /// Admit a transaction under the rules of the next block.
    pub fn accept_transaction(&self, tx: Transaction) -> bool {
        self.coherence
            .lock()
            .accept(self.mempool.as_ref(), tx, self.chain.median_time_past())
    }

    #[must_use]
    pub fn block_template(&self) -> Vec<Transaction> {
        self.preconsensus.read().block_template(self.mempool.as_ref())
    }

    #[must_use]
    pub fn is_tx_finalized(&self, txid: &TxId) -> bool {
        self.preconsensus.read().is_finalized(txid)
    }

    // ────────────────────────────────────────────────────────────────────────
    // staking rewards
    // ────────────────────────────────────────────────────────────────────────

    /// Latest registration time, in unix seconds, of a reward candidate
    /// for children of the active tip.
    #[must_use]
    pub fn reward_registration_cutoff(&self) -> Option<u64> {
        let tip = self.chain.active_tip()?;
        let info = self.chain.block_info(&tip)?;
        let window = self.config.dangling_timeout_secs.saturating_mul(2);
        Some(u64::try_from(info.time).unwrap_or(0).saturating_sub(window))
    }

    /// Compute the winners for children of the active tip.
    pub fn update_staking_winners(&self, candidates: &[ProofRef]) -> Vec<RewardWinner> {
        if !self.config.staking_rewards_enabled {
            return Vec::new();
        }
        let Some(tip) = self.chain.active_tip() else {
            return Vec::new();
        };
        let height = self.chain.tip_height();
        self.rewards.write().compute_winners(tip, height, candidates).to_vec()
    }

    #[must_use]
    pub fn staking_winners(&self, parent: &BlockHash) -> Vec<RewardWinner> {
        self.rewards.read().winners(parent).map(<[_]>::to_vec).unwrap_or_default()
    }

    fn passes_reward_policy(&self, hash: &BlockHash) -> bool {
        if !self.config.staking_rewards_enabled {
            return true;
        }
        let Some(block) = self.chain.block(hash) else {
            return true;
        };
        match self.rewards.read().check_block(&block) {
            RewardCheck::Missing { required } => {
                debug!("block {} does not pay {} to a staking winner", hash, required);
                false
            }
            RewardCheck::Paid(_) | RewardCheck::Unchecked => true,
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // observability
    // ────────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn finalization_tip(&self) -> Option<BlockHash> {
        self.tip.read().finalization_tip()
    }

    #[must_use]
    pub fn is_parked(&self, hash: &BlockHash) -> bool {
        self.tip.read().is_parked(hash)
    }

    #[must_use]
    pub fn is_finalized_block(&self, hash: &BlockHash) -> bool {
        self.tip.read().is_finalized(self.chain.as_ref(), hash)
    }
}

impl ItemOracle for FinalityIntegration {
    fn is_worth_polling(&self, item: &VoteItem) -> bool {
        match item {
            VoteItem::Block(hash) => self.tip.read().is_worth_polling(self.chain.as_ref(), hash),
            VoteItem::Tx(txid) => self.preconsensus.read().is_worth_polling(self.mempool.as_ref(), txid),
            VoteItem::Proof(_) => false,
        }
    }

    fn local_acceptance(&self, item: &VoteItem) -> bool {
        match item {
            VoteItem::Block(hash) => {
                self.chain.is_on_active_chain(hash) && !self.tip.read().is_excluded(self.chain.as_ref(), hash)
            }
            VoteItem::Tx(txid) => self.mempool.pool_state(txid) == PoolState::Mempool,
            VoteItem::Proof(_) => false,
        }
    }

    fn local_vote(&self, item: &VoteItem) -> VoteCode {
        match item {
            VoteItem::Block(hash) => {
                let policy_ok = self.passes_reward_policy(hash);
                self.tip.read().local_vote(self.chain.as_ref(), hash, policy_ok)
            }
            VoteItem::Tx(txid) => TxPreconsensus::local_vote(self.mempool.as_ref(), txid),
            VoteItem::Proof(_) => VoteCode::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::build_proof;
    use ava_chain::{Block, MemoryChain, MemoryMempool, RuleBasedValidator, TxOut};
    use ava_common::{OutPoint, Script, COIN};

    fn child(parent: &Block, work: u128, nonce: u64) -> Block {
        Block::child_of(parent, parent.time + 600, work, vec![], vec![], 50 * COIN, nonce)
    }

    fn setup(config: AvalancheConfig) -> (Arc<MemoryChain>, Arc<MemoryMempool>, FinalityIntegration, Block) {
        let g = Block::genesis(1_000, vec![]);
        let chain = Arc::new(MemoryChain::new(g.clone()));
        let mempool = Arc::new(MemoryMempool::new());
        let integration = FinalityIntegration::new(
            config,
            chain.clone(),
            mempool.clone(),
            ActivationSchedule::default(),
            Arc::new(RuleBasedValidator),
        );
        (chain, mempool, integration, g)
    }

    fn update(item: VoteItem, status: VoteStatus) -> VoteUpdate {
        VoteUpdate { item, status }
    }

    #[test]
    fn test_rejected_tip_is_replaced() {
        let (chain, _, integration, g) = setup(AvalancheConfig::default());
        let a1 = child(&g, 1, 1);
        let a2 = child(&a1, 1, 1);
        chain.add_block(a1.clone()).expect("a1");
        chain.add_block(a2.clone()).expect("a2");
        assert_eq!(integration.activate_best_chain(), Ok(Some(a2.hash)));

        let tip = integration
            .apply_update(&update(VoteItem::Block(a2.hash), VoteStatus::Rejected))
            .expect("park");
        assert_eq!(tip, Some(a1.hash));
        assert_eq!(integration.local_vote(&VoteItem::Block(a2.hash)), VoteCode::Parked);
        assert!(integration.is_worth_polling(&VoteItem::Block(a2.hash)));

        let tip = integration
            .apply_update(&update(VoteItem::Block(a2.hash), VoteStatus::Accepted))
            .expect("unpark");
        assert_eq!(tip, Some(a2.hash));
    }

    #[test]
    fn test_finalize_reorgs_onto_finalized_branch() {
        let (chain, _, integration, g) = setup(AvalancheConfig::default());
        let a1 = child(&g, 5, 1);
        let b1 = child(&g, 1, 2);
        chain.add_block(a1.clone()).expect("a1");
        chain.add_block(b1.clone()).expect("b1");
        integration.activate_best_chain().expect("activate");
        assert_eq!(chain.active_tip(), Some(a1.hash));

        let tip = integration
            .apply_update(&update(VoteItem::Block(b1.hash), VoteStatus::Finalized))
            .expect("finalize");
        assert_eq!(tip, Some(b1.hash));
        assert!(integration.is_finalized_block(&b1.hash));
        assert!(!integration.local_acceptance(&VoteItem::Block(a1.hash)));
    }

    #[test]
    fn test_transaction_votes() {
        let (_, mempool, integration, _) = setup(AvalancheConfig { preconsensus: true, ..AvalancheConfig::default() });
        let tx = Transaction::spend(
            vec![OutPoint::new(TxId::from_bytes([1; 32]), 0)],
            vec![TxOut::new(COIN, Script::pay_to_pubkey_hash(&[1; 20]))],
            10,
        );
        let txid = tx.txid();
        assert!(integration.accept_transaction(tx));
        assert!(integration.local_acceptance(&VoteItem::Tx(txid)));
        assert!(integration.block_template().is_empty());

        integration
            .apply_update(&update(VoteItem::Tx(txid), VoteStatus::Finalized))
            .expect("tx");
        assert!(integration.is_tx_finalized(&txid));
        assert_eq!(integration.block_template().len(), 1);
        assert!(mempool.contains(&txid));
    }

    #[test]
    fn test_block_missing_staking_reward_is_parked() {
        let (chain, _, integration, g) = setup(AvalancheConfig::default());
        let candidates = vec![Arc::new(build_proof(1, 0, &[10], 1))];
        let winners = integration.update_staking_winners(&candidates);
        assert_eq!(winners.len(), 1);
        assert_eq!(integration.staking_winners(&g.hash), winners);

        let unpaid = child(&g, 1, 1);
        let paid = Block::child_of(
            &g,
            g.time + 600,
            1,
            vec![TxOut::new(5 * COIN, winners[0].payout_script.clone())],
            vec![],
            50 * COIN,
            2,
        );
        chain.add_block(unpaid.clone()).expect("unpaid");
        chain.add_block(paid.clone()).expect("paid");
        assert_eq!(integration.local_vote(&VoteItem::Block(unpaid.hash)), VoteCode::Parked);
        assert_ne!(integration.local_vote(&VoteItem::Block(paid.hash)), VoteCode::Parked);
        assert_eq!(integration.reward_registration_cutoff(), Some(0));
    }
}
