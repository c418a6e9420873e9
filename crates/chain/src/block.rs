//! Minimal transaction and block model.
//!
//! Only what the avalanche layer observes is modelled: spent outpoints,
//! created outputs, fees, and which rule upgrades a transaction depends on.
//! Script semantics stay behind `TxValidator`.

use std::sync::Arc;

use ava_common::{Amount, BlockHash, HashWriter, OutPoint, Script, TxId};
use serde::{Deserialize, Serialize};

use crate::rules::UpgradeId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    pub amount: Amount,
    pub script: Script,
}

impl TxOut {
    #[must_use]
    pub fn new(amount: Amount, script: Script) -> Self {
        Self { amount, script }
    }
}

/// A spendable output as seen by the UTXO set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub out: TxOut,
    pub height: u32,
    pub is_coinbase: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOut>,
    pub fee: Amount,
    /// Coinbase transactions carry their block height for uniqueness.
    pub coinbase_height: Option<u32>,
    /// Upgrades that must be active for this transaction to be valid.
    pub requires: Vec<UpgradeId>,
    /// Upgrades under which this transaction is invalid.
    pub invalid_under: Vec<UpgradeId>,
}

impl Transaction {
    #[must_use]
    pub fn spend(inputs: Vec<OutPoint>, outputs: Vec<TxOut>, fee: Amount) -> Self {
        Self {
            inputs,
            outputs,
            fee,
            coinbase_height: None,
            requires: Vec::new(),
            invalid_under: Vec::new(),
        }
    }

    #[must_use]
    pub fn coinbase(height: u32, outputs: Vec<TxOut>) -> Self {
        Self {
            inputs: Vec::new(),
            outputs,
            fee: 0,
            coinbase_height: Some(height),
            requires: Vec::new(),
            invalid_under: Vec::new(),
        }
    }

    #[must_use]
    pub fn requiring(mut self, upgrade: UpgradeId) -> Self {
        self.requires.push(upgrade);
        self
    }

    #[must_use]
    pub fn invalid_after(mut self, upgrade: UpgradeId) -> Self {
        self.invalid_under.push(upgrade);
        self
    }

    #[must_use]
    #[inline]
    pub fn is_coinbase(&self) -> bool {
        self.coinbase_height.is_some()
    }

    #[must_use]
    pub fn txid(&self) -> TxId {
        let mut w = HashWriter::new();
        w.write_compact_size(self.inputs.len() as u64);
        for i in &self.inputs {
            w.write(i.txid.as_bytes()).write_u32(i.vout);
        }
        w.write_compact_size(self.outputs.len() as u64);
        for o in &self.outputs {
            w.write_u64(o.amount).write_var_bytes(o.script.as_bytes());
        }
        w.write_u64(self.fee);
        match self.coinbase_height {
            Some(h) => w.write_u8(1).write_u32(h),
            None => w.write_u8(0),
        };
        for u in &self.requires {
            w.write_u8(b'+').write_u32(u.0);
        }
        for u in &self.invalid_under {
            w.write_u8(b'-').write_u32(u.0);
        }
        TxId::from(w.finalize())
    }

    #[must_use]
    pub fn output_amount(&self) -> Amount {
        self.outputs.iter().fold(0u64, |acc, o| acc.saturating_add(o.amount))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: BlockHash,
    pub parent: Option<BlockHash>,
    pub height: u32,
    pub time: i64,
    /// Work contributed by this block alone.
    pub work: u128,
    pub coinbase: Transaction,
    pub txs: Vec<Transaction>,
    /// Subsidy plus fees, what the coinbase may claim.
    pub reward: Amount,
}

pub type BlockRef = Arc<Block>;

impl Block {
    fn compute_hash(
        parent: Option<&BlockHash>,
        height: u32,
        time: i64,
        work: u128,
        coinbase: &Transaction,
        txs: &[Transaction],
        nonce: u64,
    ) -> BlockHash {
        let mut w = HashWriter::new();
        match parent {
            Some(p) => w.write(p.as_bytes()),
            None => w.write(&[0u8; 32]),
        };
        w.write_u32(height)
            .write_i64(time)
            .write(&work.to_le_bytes())
            .write(coinbase.txid().as_bytes())
            .write_compact_size(txs.len() as u64);
        for tx in txs {
            w.write(tx.txid().as_bytes());
        }
        w.write_u64(nonce);
        BlockHash::from(w.finalize())
    }

    #[must_use]
    pub fn genesis(time: i64, coinbase_outputs: Vec<TxOut>) -> Self {
        let coinbase = Transaction::coinbase(0, coinbase_outputs);
        let reward = coinbase.output_amount();
        let hash = Self::compute_hash(None, 0, time, 1, &coinbase, &[], 0);
        Self {
            hash,
            parent: None,
            height: 0,
            time,
            work: 1,
            coinbase,
            txs: Vec::new(),
            reward,
        }
    }

    /// Child block. `nonce` distinguishes otherwise identical siblings.
    #[must_use]
    pub fn child_of(
        parent: &Block,
        time: i64,
        work: u128,
        coinbase_outputs: Vec<TxOut>,
        txs: Vec<Transaction>,
        reward: Amount,
        nonce: u64,
    ) -> Self {
        let height = parent.height + 1;
        let coinbase = Transaction::coinbase(height, coinbase_outputs);
        let hash = Self::compute_hash(Some(&parent.hash), height, time, work, &coinbase, &txs, nonce);
        Self {
            hash,
            parent: Some(parent.hash),
            height,
            time,
            work,
            coinbase,
            txs,
            reward,
        }
    }

    /// Coinbase first, then the block transactions.
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> + '_ {
        std::iter::once(&self.coinbase).chain(self.txs.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ava_common::COIN;

    fn script() -> Script {
        Script::pay_to_pubkey_hash(&[1; 20])
    }

    #[test]
    fn test_txid_depends_on_rule_tags() {
        let base = Transaction::spend(vec![], vec![TxOut::new(COIN, script())], 10);
        let tagged = base.clone().requiring(UpgradeId(1));
        let forbidden = base.clone().invalid_after(UpgradeId(1));
        assert_ne!(base.txid(), tagged.txid());
        assert_ne!(tagged.txid(), forbidden.txid());
    }

    #[test]
    fn test_siblings_differ_by_nonce() {
        let g = Block::genesis(0, vec![TxOut::new(50 * COIN, script())]);
        let a = Block::child_of(&g, 600, 1, vec![], vec![], 0, 1);
        let b = Block::child_of(&g, 600, 1, vec![], vec![], 0, 2);
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.parent, Some(g.hash));
        assert_eq!(a.height, 1);
    }

    #[test]
    fn test_coinbase_unique_per_height() {
        let a = Transaction::coinbase(1, vec![]);
        let b = Transaction::coinbase(2, vec![]);
        assert!(a.is_coinbase());
        assert_ne!(a.txid(), b.txid());
    }
}
