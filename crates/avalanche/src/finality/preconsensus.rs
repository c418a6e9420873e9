//! Transaction pre-consensus.
//!
//! Unconfirmed transactions are voted on like blocks. With `preconsensus`
//! enabled, block templates carry only transactions that already reached
//! `Finalized`; otherwise the whole mempool goes in.

use std::collections::HashSet;

use ava_chain::{Block, Mempool, PoolState, Transaction};
use ava_common::TxId;
use ava_proto::VoteCode;
use tracing::{debug, info};

use crate::events::VoteStatus;

#[derive(Debug, Default)]
pub struct TxPreconsensus {
    enabled: bool,
    finalized: HashSet<TxId>,
}

impl TxPreconsensus {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled, finalized: HashSet::new() }
    }

    #[must_use]
    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn is_finalized(&self, txid: &TxId) -> bool {
        self.finalized.contains(txid)
    }

    #[must_use]
    pub fn finalized_count(&self) -> usize {
        self.finalized.len()
    }

    pub fn on_update(&mut self, mempool: &dyn Mempool, txid: TxId, status: VoteStatus) {
        match status {
            VoteStatus::Finalized => {
                if self.finalized.insert(txid) {
                    info!("tx {} finalized before mining", txid);
                }
            }
            VoteStatus::Invalid => {
                self.finalized.remove(&txid);
                if mempool.evict(&txid).is_some() {
                    info!("tx {} invalidated by vote, evicted", txid);
                }
            }
            VoteStatus::Accepted | VoteStatus::Rejected | VoteStatus::Stale => {}
        }
    }

    /// Mined transactions leave the finalized set.
    pub fn on_block_connected(&mut self, block: &Block) {
        for tx in &block.txs {
            self.finalized.remove(&tx.txid());
        }
    }

    /// Transactions for the next block template.
    #[must_use]
    pub fn block_template(&self, mempool: &dyn Mempool) -> Vec<Transaction> {
        let txs = mempool.transactions();
        if !self.enabled {
            return txs;
        }
        let total = txs.len();
        let selected: Vec<Transaction> = txs.into_iter().filter(|tx| self.finalized.contains(&tx.txid())).collect();
        debug!("block template: {} of {} mempool tx(s) finalized", selected.len(), total);
        selected
    }

    #[must_use]
    pub fn local_vote(mempool: &dyn Mempool, txid: &TxId) -> VoteCode {
        match mempool.pool_state(txid) {
            PoolState::Mempool => VoteCode::Accepted,
            PoolState::Conflicting => VoteCode::Rejected,
            PoolState::None => VoteCode::Unknown,
        }
    }

    #[must_use]
    pub fn is_worth_polling(&self, mempool: &dyn Mempool, txid: &TxId) -> bool {
        !self.finalized.contains(txid) && mempool.pool_state(txid) != PoolState::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ava_chain::{MemoryMempool, TxOut};
    use ava_common::{OutPoint, Script, COIN};

    fn tx(seed: u8) -> Transaction {
        Transaction::spend(
            vec![OutPoint::new(TxId::from_bytes([seed; 32]), 0)],
            vec![TxOut::new(COIN, Script::pay_to_pubkey_hash(&[seed; 20]))],
            u64::from(seed),
        )
    }

    #[test]
    fn test_template_depends_on_mode() {
        let pool = MemoryMempool::new();
        let (a, b) = (tx(1), tx(2));
        pool.add(a.clone()).expect("a");
        pool.add(b.clone()).expect("b");

        let mut on = TxPreconsensus::new(true);
        let off = TxPreconsensus::new(false);
        assert!(on.block_template(&pool).is_empty());
        assert_eq!(off.block_template(&pool).len(), 2);

        on.on_update(&pool, a.txid(), VoteStatus::Finalized);
        let template = on.block_template(&pool);
        assert_eq!(template.len(), 1);
        assert_eq!(template[0].txid(), a.txid());
        assert!(!on.is_worth_polling(&pool, &a.txid()));
    }

    #[test]
    fn test_invalid_vote_evicts_and_mining_clears() {
        let pool = MemoryMempool::new();
        let (a, b) = (tx(1), tx(2));
        pool.add(a.clone()).expect("a");
        pool.add(b.clone()).expect("b");
        let mut pre = TxPreconsensus::new(true);

        assert_eq!(TxPreconsensus::local_vote(&pool, &b.txid()), VoteCode::Accepted);
        pre.on_update(&pool, b.txid(), VoteStatus::Invalid);
        assert!(!pool.contains(&b.txid()));
        assert_eq!(TxPreconsensus::local_vote(&pool, &b.txid()), VoteCode::Unknown);

        pre.on_update(&pool, a.txid(), VoteStatus::Finalized);
        let block = Block::child_of(&Block::genesis(0, vec![]), 600, 1, vec![], vec![a.clone()], COIN, 1);
        pre.on_block_connected(&block);
        assert_eq!(pre.finalized_count(), 0);
    }
}
