//! Mempool interface and an in-memory pool.
//!
//! `MemoryMempool` keeps accepted transactions indexed by txid and by the
//! outpoints they spend. A transaction that double-spends an accepted one
//! is parked in a separate conflicting pool instead of being dropped, so
//! that finalization of either side can later be observed.

use std::collections::HashMap;
use std::sync::Arc;

use ava_common::{OutPoint, TxId};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::debug;

use crate::block::{Block, Transaction};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    None,
    Mempool,
    Conflicting,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MempoolError {
    #[error("transaction {0} already present")]
    AlreadyPresent(TxId),

    #[error("transaction {txid} conflicts with {with}")]
    Conflict { txid: TxId, with: TxId },

    #[error("coinbase transaction {0} refused")]
    Coinbase(TxId),
}

pub trait Mempool: Send + Sync {
    fn add(&self, tx: Transaction) -> Result<TxId, MempoolError>;

    /// Remove from whichever pool holds it.
    fn evict(&self, txid: &TxId) -> Option<Transaction>;

    /// Reinsert a transaction from a disconnected block or an earlier
    /// eviction. Restored transactions win conflicts against the pool.
    fn restore(&self, tx: Transaction) -> Result<TxId, MempoolError>;

    fn pool_state(&self, txid: &TxId) -> PoolState;

    fn contains(&self, txid: &TxId) -> bool {
        self.pool_state(txid) == PoolState::Mempool
    }

    /// Highest fee first, then arrival order.
    fn transactions(&self) -> Vec<Transaction>;

    /// Drop transactions mined in `block` and those conflicting with it.
    fn remove_confirmed(&self, block: &Block) -> Vec<TxId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
struct Entry {
    tx: Transaction,
    seq: u64,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<TxId, Entry>,
    spends: HashMap<OutPoint, TxId>,
    conflicting: HashMap<TxId, Transaction>,
    next_seq: u64,
}

impl PoolInner {
    fn insert(&mut self, txid: TxId, tx: Transaction) {
        for input in &tx.inputs {
            self.spends.insert(*input, txid);
        }
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.entries.insert(txid, Entry { tx, seq });
    }

    fn remove(&mut self, txid: &TxId) -> Option<Transaction> {
        let entry = self.entries.remove(txid)?;
        for input in &entry.tx.inputs {
            if self.spends.get(input) == Some(txid) {
                self.spends.remove(input);
            }
        }
        Some(entry.tx)
    }

    fn first_conflict(&self, tx: &Transaction) -> Option<TxId> {
        tx.inputs.iter().find_map(|i| self.spends.get(i).copied())
    }

    /// Remove every entry spending an input of `tx`.
    fn take_conflicts(&mut self, tx: &Transaction) -> Vec<(TxId, Transaction)> {
        let mut losers: Vec<TxId> = tx
            .inputs
            .iter()
            .filter_map(|i| self.spends.get(i).copied())
            .collect();
        losers.sort();
        losers.dedup();
        losers
            .into_iter()
            .filter_map(|id| self.remove(&id).map(|t| (id, t)))
            .collect()
    }
}

#[derive(Clone, Default)]
pub struct MemoryMempool {
    inner: Arc<RwLock<PoolInner>>,
}

impl MemoryMempool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Mempool for MemoryMempool {
    fn add(&self, tx: Transaction) -> Result<TxId, MempoolError> {
        let txid = tx.txid();
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase(txid));
        }
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&txid) || inner.conflicting.contains_key(&txid) {
            return Err(MempoolError::AlreadyPresent(txid));
        }
        if let Some(with) = inner.first_conflict(&tx) {
            debug!("tx {} conflicts with {}, kept aside", txid, with);
            inner.conflicting.insert(txid, tx);
            return Err(MempoolError::Conflict { txid, with });
        }
        inner.insert(txid, tx);
        Ok(txid)
    }

    fn evict(&self, txid: &TxId) -> Option<Transaction> {
        let mut inner = self.inner.write();
        inner.remove(txid).or_else(|| inner.conflicting.remove(txid))
    }

    fn restore(&self, tx: Transaction) -> Result<TxId, MempoolError> {
        let txid = tx.txid();
        if tx.is_coinbase() {
            return Err(MempoolError::Coinbase(txid));
        }
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&txid) {
            return Err(MempoolError::AlreadyPresent(txid));
        }
        inner.conflicting.remove(&txid);
        for (loser, removed) in inner.take_conflicts(&tx) {
            debug!("restored tx {} displaces {}", txid, loser);
            inner.conflicting.insert(loser, removed);
        }
        inner.insert(txid, tx);
        Ok(txid)
    }

    fn pool_state(&self, txid: &TxId) -> PoolState {
        let inner = self.inner.read();
        if inner.entries.contains_key(txid) {
            PoolState::Mempool
        } else if inner.conflicting.contains_key(txid) {
            PoolState::Conflicting
        } else {
            PoolState::None
        }
    }

    fn transactions(&self) -> Vec<Transaction> {
        let inner = self.inner.read();
        let mut entries: Vec<&Entry> = inner.entries.values().collect();
        entries.sort_by(|a, b| b.tx.fee.cmp(&a.tx.fee).then(a.seq.cmp(&b.seq)));
        entries.into_iter().map(|e| e.tx.clone()).collect()
    }

    fn remove_confirmed(&self, block: &Block) -> Vec<TxId> {
        let mut inner = self.inner.write();
        let mut mined = Vec::new();
        for tx in &block.txs {
            let txid = tx.txid();
            if inner.remove(&txid).is_some() {
                mined.push(txid);
            }
            inner.conflicting.remove(&txid);
            for (loser, _) in inner.take_conflicts(tx) {
                debug!("tx {} conflicts with mined {}, dropped", loser, txid);
            }
        }
        mined
    }

    fn len(&self) -> usize {
        self.inner.read().entries.len()
    }
}
