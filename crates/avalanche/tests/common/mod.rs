//! Fixtures shared by the avalanche integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ava_chain::{Block, Coin, MemoryChain, TxOut};
use ava_common::{AvalancheConfig, OutPoint, Script, SecretKey, TxId, COIN};
use ava_proto::{Proof, ProofBuilder, ProofRef};

pub const GENESIS_TIME: i64 = 1_600_000_000;
pub const BLOCK_SPACING: i64 = 600;

pub fn key(seed: u8) -> SecretKey {
    SecretKey::from_bytes(&[seed; 32])
}

pub fn utxo(seed: u8) -> OutPoint {
    OutPoint::new(TxId::from_bytes([seed; 32]), 0)
}

pub fn config() -> AvalancheConfig {
    AvalancheConfig {
        stake_utxo_confirmations: 1,
        min_node_count: 1,
        min_avaproofs_node_count: 0,
        min_quorum_connected_stake_ratio: 0.0,
        ..AvalancheConfig::default()
    }
}

/// Active chain of `height + 1` blocks, `BLOCK_SPACING` apart. Returns the
/// chain and its tip.
pub fn chain_with_height(height: u32) -> (MemoryChain, Block) {
    let genesis = Block::genesis(GENESIS_TIME, vec![]);
    let chain = MemoryChain::new(genesis.clone());
    let mut tip = genesis;
    for h in 1..=height {
        let block = Block::child_of(&tip, GENESIS_TIME + i64::from(h) * BLOCK_SPACING, 1, vec![], vec![], 50 * COIN, 0);
        chain.extend(block.clone()).expect("extend");
        tip = block;
    }
    (chain, tip)
}

pub fn fund(chain: &MemoryChain, seed: u8) {
    chain.add_coin(
        utxo(seed),
        Coin {
            out: TxOut::new(1_000 * COIN, Script::pay_to_pubkey(&key(seed).public_key())),
            height: 1,
            is_coinbase: false,
        },
    );
}

/// Proof by `master` over 1000-coin stakes at `seeds`.
pub fn build_proof(master: u8, sequence: u64, seeds: &[u8]) -> Proof {
    let mut b = ProofBuilder::new(sequence, 0, key(master), Script::pay_to_pubkey_hash(&[master; 20]));
    for seed in seeds {
        b.add_utxo(utxo(*seed), 1_000 * COIN, 1, false, &key(*seed)).expect("add utxo");
    }
    b.build()
}

pub fn funded_proof(chain: &MemoryChain, master: u8, sequence: u64, seeds: &[u8]) -> ProofRef {
    for seed in seeds {
        fund(chain, *seed);
    }
    Arc::new(build_proof(master, sequence, seeds))
}
