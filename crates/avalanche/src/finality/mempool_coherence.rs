//! # Mempool Coherence
//!
//! Keeps the mempool valid under the rules of the next block.
//!
//! On every tip change the rules are taken from the new median-time-past.
//! When they differ from the old ones, the whole pool is re-checked:
//!
//! ```text
//!            rules change            rules change back
//! mempool ──────────────▶ mempool' ────────────────────▶ mempool
//!    │  invalid now          ▲  valid again                ▲
//!    └──────────▶ stash ─────┴─────────────────────────────┘
//! ```
//!
//! Transactions evicted by a rule change wait in the stash and are
//! re-checked at every later transition, which makes the activation then
//! deactivation round trip restore the pool. Transactions of disconnected
//! blocks go through the same check. Coinbase transactions never enter the
//! pool.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use ava_chain::{ActivationSchedule, Mempool, ReorgOutcome, RuleSet, Transaction, TxValidator};
use ava_common::TxId;
use serde::Serialize;
use tracing::{debug, info};

/// Stashed transactions kept at most. The oldest go first.
pub const MAX_STASHED_TXS: usize = 10_000;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoherenceReport {
    /// Removed because a connected block mined them.
    pub mined: Vec<TxId>,
    /// Evicted under the new rules.
    pub evicted: Vec<TxId>,
    /// Restored from disconnected blocks or the stash.
    pub restored: Vec<TxId>,
}

pub struct MempoolCoherence {
    schedule: ActivationSchedule,
    validator: Arc<dyn TxValidator>,
    stash: VecDeque<Transaction>,
}

impl MempoolCoherence {
    pub fn new(schedule: ActivationSchedule, validator: Arc<dyn TxValidator>) -> Self {
        Self { schedule, validator, stash: VecDeque::new() }
    }

    #[must_use]
    pub fn rules_at(&self, median_time_past: i64) -> RuleSet {
        self.schedule.rules_at(median_time_past)
    }

    /// Admit a new transaction under the current rules.
    pub fn accept(&self, mempool: &dyn Mempool, tx: Transaction, median_time_past: i64) -> bool {
        let rules = self.rules_at(median_time_past);
        if let Err(e) = self.validator.check_tx(&tx, &rules) {
            debug!("tx {} refused: {}", tx.txid(), e);
            return false;
        }
        mempool.add(tx).is_ok()
    }

    #[must_use]
    pub fn stashed(&self) -> usize {
        self.stash.len()
    }

    pub fn on_reorg(&mut self, mempool: &dyn Mempool, outcome: &ReorgOutcome) -> CoherenceReport {
        let old_rules = self.rules_at(outcome.old_median_time_past);
        let new_rules = self.rules_at(outcome.new_median_time_past);
        let mut report = CoherenceReport::default();

        let mut connected_txids: HashSet<TxId> = HashSet::new();
        for block in &outcome.connected {
            connected_txids.extend(block.txs.iter().map(Transaction::txid));
            report.mined.extend(mempool.remove_confirmed(block));
        }
        self.stash.retain(|tx| !connected_txids.contains(&tx.txid()));

        if old_rules != new_rules {
            info!(
                "rule set changed at mtp {} -> {}, re-checking {} mempool tx(s)",
                outcome.old_median_time_past,
                outcome.new_median_time_past,
                mempool.len()
            );
            for tx in mempool.transactions() {
                if self.validator.check_tx(&tx, &new_rules).is_err() {
                    let txid = tx.txid();
                    if let Some(evicted) = mempool.evict(&txid) {
                        report.evicted.push(txid);
                        self.push_stash(evicted);
                    }
                }
            }
            let stash = std::mem::take(&mut self.stash);
            for tx in stash {
                self.restore_or_stash(mempool, tx, &new_rules, &mut report);
            }
        }

        // Disconnected blocks are tip-first; restore oldest first.
        for block in outcome.disconnected.iter().rev() {
            for tx in &block.txs {
                if tx.is_coinbase() || connected_txids.contains(&tx.txid()) {
                    continue;
                }
                self.restore_or_stash(mempool, tx.clone(), &new_rules, &mut report);
            }
        }

        if !report.evicted.is_empty() || !report.restored.is_empty() {
            info!(
                "mempool coherence: {} evicted, {} restored, {} stashed",
                report.evicted.len(),
                report.restored.len(),
                self.stash.len()
            );
        }
        report
    }

    fn restore_or_stash(&mut self, mempool: &dyn Mempool, tx: Transaction, rules: &RuleSet, report: &mut CoherenceReport) {
        if tx.is_coinbase() {
            return;
        }
        if self.validator.check_tx(&tx, rules).is_err() {
            self.push_stash(tx);
            return;
        }
        let txid = tx.txid();
        match mempool.restore(tx) {
            Ok(_) => report.restored.push(txid),
            Err(e) => debug!("tx {} not restored: {}", txid, e),
        }
    }

    fn push_stash(&mut self, tx: Transaction) {
        let txid = tx.txid();
        if self.stash.iter().any(|t| t.txid() == txid) {
            return;
        }
        self.stash.push_back(tx);
        while self.stash.len() > MAX_STASHED_TXS {
            self.stash.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ava_chain::{Block, ChainValidator, Coin, MemoryChain, MemoryMempool, RuleBasedValidator, TxOut, Upgrade, UpgradeId};
    use ava_common::{OutPoint, Script, COIN};

    const UPGRADE: UpgradeId = UpgradeId(1);

    fn tx(seed: u8) -> Transaction {
        Transaction::spend(
            vec![OutPoint::new(TxId::from_bytes([seed; 32]), 0)],
            vec![TxOut::new(COIN, Script::pay_to_pubkey_hash(&[seed; 20]))],
            u64::from(seed),
        )
    }

    fn coherence(activation: i64) -> MempoolCoherence {
        MempoolCoherence::new(
            ActivationSchedule::new(vec![Upgrade { id: UPGRADE, activation_time: activation }]),
            Arc::new(RuleBasedValidator),
        )
    }

    fn txids(pool: &MemoryMempool) -> HashSet<TxId> {
        pool.transactions().iter().map(Transaction::txid).collect()
    }

    fn shift(old: i64, new: i64) -> ReorgOutcome {
        ReorgOutcome { old_median_time_past: old, new_median_time_past: new, ..ReorgOutcome::default() }
    }

    #[test]
    fn test_activation_evicts_and_deactivation_restores() {
        let mut c = coherence(1_000);
        let pool = MemoryMempool::new();
        let plain = tx(1);
        let old_only = tx(2).invalid_after(UPGRADE);
        assert!(c.accept(&pool, plain.clone(), 900));
        assert!(c.accept(&pool, old_only.clone(), 900));
        let before = txids(&pool);

        let forward = c.on_reorg(&pool, &shift(900, 1_000));
        assert_eq!(forward.evicted, vec![old_only.txid()]);
        assert_eq!(c.stashed(), 1);

        let new_only = tx(3).requiring(UPGRADE);
        assert!(c.accept(&pool, new_only.clone(), 1_000));
        assert!(!c.accept(&pool, tx(4).invalid_after(UPGRADE), 1_000));

        let backward = c.on_reorg(&pool, &shift(1_000, 900));
        assert_eq!(backward.evicted, vec![new_only.txid()]);
        assert_eq!(backward.restored, vec![old_only.txid()]);
        assert_eq!(txids(&pool), before);
    }

    #[test]
    fn test_no_rule_change_keeps_pool() {
        let mut c = coherence(1_000);
        let pool = MemoryMempool::new();
        c.accept(&pool, tx(1).invalid_after(UPGRADE), 10);
        let report = c.on_reorg(&pool, &shift(10, 20));
        assert!(report.evicted.is_empty());
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_disconnected_transactions_are_rechecked() {
        let g = Block::genesis(0, vec![]);
        let chain = MemoryChain::new(g.clone());
        let mut c = coherence(10_000);

        let plain = Transaction::spend(vec![OutPoint::new(g.coinbase.txid(), 0)], vec![], 1);
        let new_only = tx(5).requiring(UPGRADE);
        let a1 = Block::child_of(&g, 600, 1, vec![], vec![plain.clone()], COIN, 1);
        chain.add_coin(
            OutPoint::new(g.coinbase.txid(), 0),
            Coin { out: TxOut::new(COIN, Script::pay_to_pubkey_hash(&[0; 20])), height: 0, is_coinbase: false },
        );
        let pool = MemoryMempool::new();
        let connect = chain.extend(a1.clone()).expect("a1");
        c.on_reorg(&pool, &connect);

        let b1 = Block::child_of(&g, 600, 5, vec![], vec![], COIN, 2);
        chain.add_block(b1.clone()).expect("b1");
        let outcome = chain.apply_reorg(&b1.hash).expect("reorg");
        assert_eq!(outcome.disconnected.len(), 1);

        let mut with_new_only = outcome.clone();
        let mut block = (*with_new_only.disconnected[0]).clone();
        block.txs.push(new_only.clone());
        with_new_only.disconnected = vec![Arc::new(block)];

        let report = c.on_reorg(&pool, &with_new_only);
        assert_eq!(report.restored, vec![plain.txid()]);
        assert!(!pool.contains(&new_only.txid()));
        assert_eq!(c.stashed(), 1);
        assert_eq!(chain.active_tip(), Some(b1.hash));
    }
}
