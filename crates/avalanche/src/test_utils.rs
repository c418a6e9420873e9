//! Fixtures shared by the unit tests of this crate.

use std::sync::Arc;

use ava_chain::{Block, Coin, MemoryChain, TxOut};
use ava_common::{AvalancheConfig, OutPoint, Script, SecretKey, TxId, COIN};
use ava_proto::{Proof, ProofBuilder, ProofRef};

pub const GENESIS_TIME: i64 = 1_600_000_000;

pub fn key(seed: u8) -> SecretKey {
    SecretKey::from_bytes(&[seed; 32])
}

pub fn utxo(seed: u8) -> OutPoint {
    OutPoint::new(TxId::from_bytes([seed; 32]), 0)
}

/// Config with small maturity and quorum requirements.
pub fn test_config() -> AvalancheConfig {
    AvalancheConfig {
        stake_utxo_confirmations: 1,
        min_node_count: 1,
        min_avaproofs_node_count: 0,
        min_quorum_connected_stake_ratio: 0.0,
        ..AvalancheConfig::default()
    }
}

/// Chain of `height + 1` blocks, ten minutes apart.
pub fn chain_with_height(height: u32) -> MemoryChain {
    let genesis = Block::genesis(GENESIS_TIME, vec![]);
    let mut parent = genesis.clone();
    let chain = MemoryChain::new(genesis);
    for h in 1..=height {
        let block = Block::child_of(&parent, GENESIS_TIME + i64::from(h) * 600, 1, vec![], vec![], 50 * COIN, 0);
        parent = block.clone();
        if chain.extend(block).is_err() {
            break;
        }
    }
    chain
}

/// Put the stake coin of `seed` on `chain`.
pub fn fund(chain: &MemoryChain, seed: u8, coins: u64, height: u32) {
    chain.add_coin(
        utxo(seed),
        Coin {
            out: TxOut::new(coins * COIN, Script::pay_to_pubkey(&key(seed).public_key())),
            height,
            is_coinbase: false,
        },
    );
}

/// Proof by master `master` over the stake utxos `seeds`, 1000 coins each.
pub fn build_proof(master: u8, sequence: u64, seeds: &[u8], height: u32) -> Proof {
    let mut b = ProofBuilder::new(sequence, 0, key(master), Script::pay_to_pubkey_hash(&[master; 20]));
    for seed in seeds {
        b.add_utxo(utxo(*seed), 1_000 * COIN, height, false, &key(*seed))
            .expect("add utxo");
    }
    b.build()
}

/// Funded proof whose stakes are already on `chain`.
pub fn funded_proof(chain: &MemoryChain, master: u8, sequence: u64, seeds: &[u8]) -> ProofRef {
    for seed in seeds {
        fund(chain, *seed, 1_000, 1);
    }
    Arc::new(build_proof(master, sequence, seeds, 1))
}
