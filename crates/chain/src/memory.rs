//! In-memory block tree and UTXO set implementing `ChainValidator`.
//!
//! Used by tests and the simulator. Blocks are accepted into the tree with
//! `add_block` and only become active through `apply_reorg`, which is how
//! the finality layer drives tip changes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ava_common::{BlockHash, OutPoint, TxId};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockRef, Coin};
use crate::validator::{BlockInfo, ChainError, ChainValidator, ReorgOutcome};

/// Blocks considered for median-time-past.
const MEDIAN_TIME_SPAN: usize = 11;

struct Entry {
    block: BlockRef,
    chain_work: u128,
    median_time_past: i64,
    valid: bool,
}

#[derive(Default)]
struct ChainInner {
    entries: HashMap<BlockHash, Entry>,
    /// Active chain indexed by height.
    active: Vec<BlockHash>,
    utxos: HashMap<OutPoint, Coin>,
    /// Coins spent by each connected block.
    undo: HashMap<BlockHash, Vec<(OutPoint, Coin)>>,
}

pub struct MemoryChain {
    inner: RwLock<ChainInner>,
}

impl ChainInner {
    fn info(&self, hash: &BlockHash) -> Option<BlockInfo> {
        self.entries.get(hash).map(|e| BlockInfo {
            hash: *hash,
            parent: e.block.parent,
            height: e.block.height,
            time: e.block.time,
            chain_work: e.chain_work,
            median_time_past: e.median_time_past,
            valid: e.valid,
        })
    }

    fn ancestor_at(&self, hash: &BlockHash, height: u32) -> Option<BlockHash> {
        let mut cursor = self.entries.get(hash)?;
        let mut current = *hash;
        if cursor.block.height < height {
            return None;
        }
        while cursor.block.height > height {
            current = cursor.block.parent?;
            cursor = self.entries.get(&current)?;
        }
        Some(current)
    }

    fn is_valid(&self, hash: &BlockHash) -> bool {
        let mut current = Some(*hash);
        while let Some(h) = current {
            match self.entries.get(&h) {
                Some(e) if e.valid => current = e.block.parent,
                _ => return false,
            }
        }
        true
    }

    fn tip_mtp(&self) -> i64 {
        self.active
            .last()
            .and_then(|h| self.entries.get(h))
            .map_or(0, |e| e.median_time_past)
    }

    fn median_time_past(&self, parent: Option<&BlockHash>, own_time: i64) -> i64 {
        let mut times = vec![own_time];
        let mut current = parent.copied();
        while let Some(h) = current {
            if times.len() >= MEDIAN_TIME_SPAN {
                break;
            }
            match self.entries.get(&h) {
                Some(e) => {
                    times.push(e.block.time);
                    current = e.block.parent;
                }
                None => break,
            }
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    fn can_connect(&self, block: &Block) -> bool {
        let mut created: HashSet<OutPoint> = HashSet::new();
        let mut consumed: HashSet<OutPoint> = HashSet::new();
        for tx in block.transactions() {
            for input in &tx.inputs {
                if !consumed.insert(*input) {
                    return false;
                }
                if !self.utxos.contains_key(input) && !created.contains(input) {
                    return false;
                }
            }
            let txid = tx.txid();
            for vout in 0..tx.outputs.len() {
                created.insert(OutPoint::new(txid, vout as u32));
            }
        }
        true
    }

    fn connect(&mut self, block: &BlockRef) -> bool {
        if !self.can_connect(block) {
            return false;
        }
        let mut spent = Vec::new();
        for tx in block.transactions() {
            for input in &tx.inputs {
                if let Some(coin) = self.utxos.remove(input) {
                    spent.push((*input, coin));
                }
            }
            let txid = tx.txid();
            for (vout, out) in tx.outputs.iter().enumerate() {
                self.utxos.insert(
                    OutPoint::new(txid, vout as u32),
                    Coin {
                        out: out.clone(),
                        height: block.height,
                        is_coinbase: tx.is_coinbase(),
                    },
                );
            }
        }
        self.undo.insert(block.hash, spent);
        self.active.push(block.hash);
        true
    }

    fn disconnect_tip(&mut self) -> Option<BlockRef> {
        let hash = self.active.pop()?;
        let block = self.entries.get(&hash)?.block.clone();
        let txs: Vec<_> = block.transactions().collect();
        for tx in txs.into_iter().rev() {
            let txid: TxId = tx.txid();
            for vout in 0..tx.outputs.len() {
                self.utxos.remove(&OutPoint::new(txid, vout as u32));
            }
        }
        for (outpoint, coin) in self.undo.remove(&hash).unwrap_or_default() {
            self.utxos.insert(outpoint, coin);
        }
        Some(block)
    }
}

impl MemoryChain {
    /// New chain with `genesis` connected.
    #[must_use]
    pub fn new(genesis: Block) -> Self {
        let mut inner = ChainInner::default();
        let mtp = genesis.time;
        let hash = genesis.hash;
        let block = Arc::new(genesis);
        inner.entries.insert(
            hash,
            Entry {
                block: block.clone(),
                chain_work: block.work,
                median_time_past: mtp,
                valid: true,
            },
        );
        inner.connect(&block);
        Self { inner: RwLock::new(inner) }
    }

    fn insert(&self, block: Block, valid: bool) -> Result<BlockRef, ChainError> {
        let mut inner = self.inner.write();
        if inner.entries.contains_key(&block.hash) {
            return Err(ChainError::Duplicate(block.hash));
        }
        let parent = block.parent.ok_or(ChainError::OrphanBlock(block.hash))?;
        let parent_work = inner
            .entries
            .get(&parent)
            .map(|e| e.chain_work)
            .ok_or(ChainError::OrphanBlock(block.hash))?;
        let mtp = inner.median_time_past(Some(&parent), block.time);
        let block = Arc::new(block);
        inner.entries.insert(
            block.hash,
            Entry {
                block: block.clone(),
                chain_work: parent_work.saturating_add(block.work),
                median_time_past: mtp,
                valid,
            },
        );
        debug!("accepted block {} at height {} into the tree", block.hash, block.height);
        Ok(block)
    }

    /// Add a block to the tree without activating it.
    pub fn add_block(&self, block: Block) -> Result<BlockRef, ChainError> {
        self.insert(block, true)
    }

    /// Add a block that fails consensus checks.
    pub fn add_invalid_block(&self, block: Block) -> Result<BlockRef, ChainError> {
        self.insert(block, false)
    }

    /// Add a block and make it the tip.
    pub fn extend(&self, block: Block) -> Result<ReorgOutcome, ChainError> {
        let hash = block.hash;
        self.add_block(block)?;
        self.apply_reorg(&hash)
    }

    /// Inject a spendable coin, as if created by earlier history.
    pub fn add_coin(&self, outpoint: OutPoint, coin: Coin) {
        self.inner.write().utxos.insert(outpoint, coin);
    }

    #[must_use]
    pub fn active_chain(&self) -> Vec<BlockHash> {
        self.inner.read().active.clone()
    }
}

impl ChainValidator for MemoryChain {
    fn block_info(&self, hash: &BlockHash) -> Option<BlockInfo> {
        self.inner.read().info(hash)
    }

    fn block(&self, hash: &BlockHash) -> Option<BlockRef> {
        self.inner.read().entries.get(hash).map(|e| e.block.clone())
    }

    fn is_valid_block(&self, hash: &BlockHash) -> bool {
        self.inner.read().is_valid(hash)
    }

    fn active_tip(&self) -> Option<BlockHash> {
        self.inner.read().active.last().copied()
    }

    fn tip_height(&self) -> u32 {
        let inner = self.inner.read();
        inner.active.len().saturating_sub(1) as u32
    }

    fn is_on_active_chain(&self, hash: &BlockHash) -> bool {
        let inner = self.inner.read();
        match inner.entries.get(hash) {
            Some(e) => inner.active.get(e.block.height as usize) == Some(hash),
            None => false,
        }
    }

    fn ancestor_at(&self, hash: &BlockHash, height: u32) -> Option<BlockHash> {
        self.inner.read().ancestor_at(hash, height)
    }

    fn candidates(&self) -> Vec<BlockInfo> {
        let inner = self.inner.read();
        inner.entries.keys().filter_map(|h| inner.info(h)).collect()
    }

    fn apply_reorg(&self, new_tip: &BlockHash) -> Result<ReorgOutcome, ChainError> {
        let mut inner = self.inner.write();
        if !inner.entries.contains_key(new_tip) {
            return Err(ChainError::UnknownBlock(*new_tip));
        }
        if !inner.is_valid(new_tip) {
            return Err(ChainError::InvalidBlock(*new_tip));
        }
        let old_mtp = inner.tip_mtp();
        if inner.active.last() == Some(new_tip) {
            return Ok(ReorgOutcome {
                old_median_time_past: old_mtp,
                new_median_time_past: old_mtp,
                ..ReorgOutcome::default()
            });
        }

        // Walk back from the new tip to the active chain.
        let mut branch = Vec::new();
        let mut cursor = *new_tip;
        loop {
            let entry = inner.entries.get(&cursor).ok_or(ChainError::UnknownBlock(cursor))?;
            let height = entry.block.height as usize;
            if inner.active.get(height) == Some(&cursor) {
                break;
            }
            branch.push(entry.block.clone());
            cursor = entry.block.parent.ok_or(ChainError::InvalidBlock(cursor))?;
        }
        branch.reverse();
        let fork_height = inner
            .entries
            .get(&cursor)
            .map(|e| e.block.height as usize)
            .ok_or(ChainError::UnknownBlock(cursor))?;

        let mut disconnected = Vec::new();
        while inner.active.len() > fork_height + 1 {
            match inner.disconnect_tip() {
                Some(b) => disconnected.push(b),
                None => break,
            }
        }

        let mut connected = Vec::new();
        for block in &branch {
            if inner.connect(block) {
                connected.push(block.clone());
                continue;
            }
            warn!("block {} failed to connect, restoring previous tip", block.hash);
            if let Some(e) = inner.entries.get_mut(&block.hash) {
                e.valid = false;
            }
            for _ in 0..connected.len() {
                inner.disconnect_tip();
            }
            for old in disconnected.iter().rev() {
                inner.connect(old);
            }
            return Err(ChainError::InvalidBlock(block.hash));
        }

        let new_mtp = inner.tip_mtp();
        info!(
            "reorg to {} (height {}): {} disconnected, {} connected",
            new_tip,
            inner.active.len().saturating_sub(1),
            disconnected.len(),
            connected.len()
        );
        Ok(ReorgOutcome {
            disconnected,
            connected,
            old_median_time_past: old_mtp,
            new_median_time_past: new_mtp,
        })
    }

    fn median_time_past(&self) -> i64 {
        self.inner.read().tip_mtp()
    }

    fn utxo(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.inner.read().utxos.get(outpoint).cloned()
    }
}
