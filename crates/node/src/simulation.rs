//! # In-Memory Simulation
//!
//! Runs N avalanche processes in one address space on a virtual clock.
//!
//! ```text
//!  ┌────────┐   MemoryHub (codec on every frame)   ┌────────┐
//!  │ node 0 │ ◀──────────────────────────────────▶ │ node 1 │ ...
//!  └───┬────┘                                      └───┬────┘
//!      │ EventLoop step methods                        │
//!      ▼                                               ▼
//!  Processor + FinalityIntegration + MemoryChain + MemoryMempool
//! ```
//!
//! Every node has its own `MemoryChain` built from the same blocks, with
//! every stake coin funded on all of them. A round polls every node, then
//! delivers messages until the hub is quiet, then applies the queued vote
//! updates. No tokio task is spawned, so a run is reproducible.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ava_chain::{
    ActivationSchedule, Block, ChainValidator, Coin, MemoryChain, MemoryMempool, RuleBasedValidator, TxOut,
};
use ava_common::{Amount, AvalancheConfig, BlockHash, OutPoint, ProofId, Script, SecretKey, TxId, COIN};
use ava_core::{
    update_channel, AvalancheNetwork, EventLoop, FinalityIntegration, MemoryHub, NodeId, PeerInfo, ProofCounters,
    Processor, VotingStats,
};
use ava_proto::{DelegationBuilder, ProofBuilder, ProofRef};
use serde::Serialize;
use tracing::{debug, info};

pub const GENESIS_TIME: i64 = 1_600_000_000;
pub const BLOCK_SPACING: i64 = 600;
/// Virtual time between two rounds.
pub const ROUND_MS: u64 = 100;
/// Stake pledged by every simulated proof.
pub const STAKE_AMOUNT: Amount = 1_000 * COIN;

const MAINTENANCE_EVERY_MS: u64 = 1_000;
const BASE_PORT: u16 = 18_000;

// ════════════════════════════════════════════════════════════════════════════
// KEYS
// ════════════════════════════════════════════════════════════════════════════

fn derive_bytes(tag: u8, index: u32) -> [u8; 32] {
    let mut bytes = [tag; 32];
    bytes[1..5].copy_from_slice(&index.to_le_bytes());
    bytes
}

/// Master key of simulated node `index`. It also signs the session.
#[must_use]
pub fn master_key(index: u32) -> SecretKey {
    SecretKey::from_bytes(&derive_bytes(1, index))
}

fn stake_key(index: u32) -> SecretKey {
    SecretKey::from_bytes(&derive_bytes(2, index))
}

fn stake_outpoint(index: u32) -> OutPoint {
    OutPoint::new(TxId::from_bytes(derive_bytes(3, index)), 0)
}

fn payout_script(index: u32) -> Script {
    let mut hash = [4u8; 20];
    hash[..4].copy_from_slice(&index.to_le_bytes());
    Script::pay_to_pubkey_hash(&hash)
}

fn build_proof(index: u32) -> Result<ProofRef> {
    let mut builder = ProofBuilder::new(0, 0, master_key(index), payout_script(index));
    builder
        .add_utxo(stake_outpoint(index), STAKE_AMOUNT, 1, false, &stake_key(index))
        .with_context(|| format!("stake of node {}", index))?;
    Ok(Arc::new(builder.build()))
}

fn stake_coin(index: u32) -> Coin {
    Coin {
        out: TxOut::new(STAKE_AMOUNT, Script::pay_to_pubkey(&stake_key(index).public_key())),
        height: 1,
        is_coinbase: false,
    }
}

// ════════════════════════════════════════════════════════════════════════════
// NODES
// ════════════════════════════════════════════════════════════════════════════

pub struct SimNode {
    pub id: NodeId,
    pub chain: Arc<MemoryChain>,
    pub mempool: Arc<MemoryMempool>,
    pub proof: ProofRef,
    pub event_loop: EventLoop,
}

impl SimNode {
    #[must_use]
    pub fn processor(&self) -> &Arc<Processor> {
        self.event_loop.processor()
    }

    #[must_use]
    pub fn finality(&self) -> &Arc<FinalityIntegration> {
        self.event_loop.finality()
    }

    #[must_use]
    pub fn active_tip(&self) -> Option<BlockHash> {
        self.chain.active_tip()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeReport {
    pub node_id: u64,
    pub proof_id: ProofId,
    pub quorum: bool,
    pub active_tip: Option<BlockHash>,
    pub finalization_tip: Option<BlockHash>,
    pub counters: ProofCounters,
    pub voting: VotingStats,
    pub peers: Vec<PeerInfo>,
}

#[derive(Clone, Debug, Serialize)]
pub struct SimulationReport {
    pub node_count: usize,
    pub rounds: usize,
    pub virtual_time_ms: u64,
    pub tip: BlockHash,
    pub finalized: bool,
    pub nodes: Vec<NodeReport>,
}

// ════════════════════════════════════════════════════════════════════════════
// SIMULATION
// ════════════════════════════════════════════════════════════════════════════

pub struct Simulation {
    hub: Arc<MemoryHub>,
    nodes: Vec<SimNode>,
    tip: Block,
    now_ms: u64,
    last_maintenance_ms: u64,
    rounds: usize,
}

impl Simulation {
    /// Build `count` nodes on a shared chain tall enough for the stakes to
    /// mature under `config`.
    pub fn new(count: usize, config: AvalancheConfig) -> Result<Self> {
        if count < 3 {
            bail!("a simulation needs at least 3 nodes, got {}", count);
        }
        config.validate().context("simulation config")?;
        let count_u32 = u32::try_from(count).context("node count")?;

        let height = config.stake_utxo_confirmations.max(1);
        let blocks = shared_blocks(height);
        let tip = blocks.last().cloned().context("empty block list")?;
        let now_ms = u64::try_from(tip.time).unwrap_or(0).saturating_mul(1_000);

        let hub = MemoryHub::new();
        let mut nodes = Vec::with_capacity(count);
        for index in 0..count_u32 {
            nodes.push(build_node(&hub, index, count_u32, &config, &blocks, now_ms)?);
        }
        info!("simulation of {} nodes ready at height {}", count, height);
        Ok(Self { hub, nodes, tip, now_ms, last_maintenance_ms: now_ms, rounds: 0 })
    }

    #[must_use]
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }

    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    #[must_use]
    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Tip of the shared chain the nodes were built with.
    #[must_use]
    pub fn shared_tip(&self) -> &Block {
        &self.tip
    }

    /// Open every link and start the avalanche sessions.
    ///
    /// Node `a` dials the `count / 2` nodes that follow it on the ring and is
    /// dialed by the others, so every node has an inbound link and can share
    /// its proof.
    pub async fn connect_all(&self) -> Result<()> {
        let count = self.nodes.len() as u64;
        for a in &self.nodes {
            for b in &self.nodes {
                if a.id < b.id {
                    let (from, to) = if 2 * (b.id.0 - a.id.0) <= count { (a.id, b.id) } else { (b.id, a.id) };
                    self.hub.connect(from, to);
                }
            }
        }
        for node in &self.nodes {
            for peer in node.event_loop.network().connected_nodes() {
                node.event_loop
                    .connect(peer, self.now_ms)
                    .await
                    .with_context(|| format!("{} connecting to {}", node.id, peer))?;
            }
        }
        self.settle().await;
        Ok(())
    }

    /// Deliver queued messages until no node has anything left to read.
    /// Returns the number of messages handled.
    pub async fn settle(&self) -> usize {
        let mut handled = 0;
        loop {
            let mut progressed = false;
            for node in &self.nodes {
                let network = node.event_loop.network();
                while let Ok(Some((from, msg))) = network.try_recv() {
                    node.event_loop.handle(from, msg, self.now_ms).await;
                    handled += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return handled;
            }
        }
    }

    /// One round: poll, deliver, apply vote updates, then advance the clock.
    pub async fn step(&mut self) {
        for node in &self.nodes {
            node.event_loop.poll(self.now_ms).await;
        }
        self.settle().await;
        for node in &self.nodes {
            node.event_loop.drain_updates(self.now_ms);
        }
        if self.now_ms.saturating_sub(self.last_maintenance_ms) >= MAINTENANCE_EVERY_MS {
            for node in &self.nodes {
                node.event_loop.maintain(self.now_ms).await;
            }
            self.settle().await;
            self.last_maintenance_ms = self.now_ms;
        }
        self.now_ms = self.now_ms.saturating_add(ROUND_MS);
        self.rounds += 1;
    }

    /// Step until `done` holds. Returns the rounds taken, `None` when
    /// `max_rounds` ran out first.
    pub async fn run_until(&mut self, max_rounds: usize, done: impl Fn(&Self) -> bool) -> Option<usize> {
        let start = self.rounds;
        for _ in 0..max_rounds {
            if done(self) {
                return Some(self.rounds - start);
            }
            self.step().await;
        }
        done(self).then(|| self.rounds - start)
    }

    #[must_use]
    pub fn all_quorum(&self) -> bool {
        self.nodes.iter().all(|n| n.processor().is_quorum_established())
    }

    #[must_use]
    pub fn all_finalized(&self, hash: &BlockHash) -> bool {
        self.nodes.iter().all(|n| n.finality().is_finalized_block(hash))
    }

    /// Hand `block` to node `index` as if it arrived from the network.
    pub fn announce_block(&self, index: usize, block: Block) -> Result<()> {
        let node = self.nodes.get(index).with_context(|| format!("no node {}", index))?;
        let hash = block.hash;
        node.chain.add_block(block).with_context(|| format!("block {} on {}", hash, node.id))?;
        node.event_loop.block_received(hash, self.now_ms);
        Ok(())
    }

    #[must_use]
    pub fn report(&self) -> SimulationReport {
        let tip = self.shared_tip().hash;
        SimulationReport {
            node_count: self.nodes.len(),
            rounds: self.rounds,
            virtual_time_ms: self.now_ms,
            tip,
            finalized: self.all_finalized(&tip),
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeReport {
                    node_id: n.id.0,
                    proof_id: n.proof.proof_id(),
                    quorum: n.processor().is_quorum_established(),
                    active_tip: n.active_tip(),
                    finalization_tip: n.finality().finalization_tip(),
                    counters: n.processor().counters(),
                    voting: n.processor().stats(),
                    peers: n.processor().peer_infos(),
                })
                .collect(),
        }
    }
}

fn shared_blocks(height: u32) -> Vec<Block> {
    let mut parent = Block::genesis(GENESIS_TIME, vec![]);
    let mut blocks = vec![parent.clone()];
    for h in 1..=height {
        let block = Block::child_of(&parent, GENESIS_TIME + i64::from(h) * BLOCK_SPACING, 1, vec![], vec![], 50 * COIN, 0);
        blocks.push(block.clone());
        parent = block;
    }
    blocks
}

fn build_node(
    hub: &Arc<MemoryHub>,
    index: u32,
    count: u32,
    config: &AvalancheConfig,
    blocks: &[Block],
    now_ms: u64,
) -> Result<SimNode> {
    let id = NodeId(u64::from(index));
    let (genesis, rest) = blocks.split_first().context("empty block list")?;
    let chain = Arc::new(MemoryChain::new(genesis.clone()));
    for block in rest {
        chain.extend(block.clone()).with_context(|| format!("shared block {}", block.height))?;
    }
    for other in 0..count {
        chain.add_coin(stake_outpoint(other), stake_coin(other));
    }

    let mempool = Arc::new(MemoryMempool::new());
    let finality = Arc::new(FinalityIntegration::new(
        config.clone(),
        chain.clone(),
        mempool.clone(),
        ActivationSchedule::default(),
        Arc::new(RuleBasedValidator),
    ));
    let (updates, receiver) = update_channel();
    let processor = Arc::new(
        Processor::new(config.clone(), chain.clone(), finality.clone(), master_key(index), updates)
            .with_seed(u64::from(index)),
    );

    let proof = build_proof(index)?;
    let delegation = DelegationBuilder::from_proof(&proof).build();
    processor
        .set_local_proof(proof.clone(), delegation, now_ms)
        .with_context(|| format!("local proof of {}", id))?;

    let port = BASE_PORT.saturating_add(u16::try_from(index).unwrap_or(u16::MAX));
    let network = hub.join(id, SocketAddr::from(([127, 0, 0, 1], port)));
    let event_loop = EventLoop::new(processor, finality, Arc::new(network), receiver);
    debug!("{} staking with proof {}", id, proof.proof_id());
    Ok(SimNode { id, chain, mempool, proof, event_loop })
}

// ════════════════════════════════════════════════════════════════════════════
// ONE-SHOT RUN
// ════════════════════════════════════════════════════════════════════════════

/// Rounds allowed for each phase of `run`.
pub const MAX_PHASE_ROUNDS: usize = 2_000;

/// Connect `count` nodes, wait for the quorum, then vote the shared tip to
/// finality.
pub async fn run(count: usize, config: AvalancheConfig) -> Result<SimulationReport> {
    let mut sim = Simulation::new(count, config)?;
    sim.connect_all().await?;

    let Some(rounds) = sim.run_until(MAX_PHASE_ROUNDS, Simulation::all_quorum).await else {
        bail!("quorum not established after {} rounds", MAX_PHASE_ROUNDS);
    };
    info!("quorum established on every node after {} round(s)", rounds);

    let tip = sim.shared_tip().hash;
    for node in sim.nodes() {
        node.event_loop.block_received(tip, sim.now_ms());
    }
    match sim.run_until(MAX_PHASE_ROUNDS, |s| s.all_finalized(&tip)).await {
        Some(rounds) => info!("tip {} finalized everywhere after {} round(s)", tip, rounds),
        None => info!("tip {} not finalized everywhere after {} rounds", tip, MAX_PHASE_ROUNDS),
    }
    Ok(sim.report())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> AvalancheConfig {
        AvalancheConfig {
            stake_utxo_confirmations: 2,
            min_node_count: 2,
            min_avaproofs_node_count: 2,
            finalization_score: 16,
            ..AvalancheConfig::default()
        }
    }

    #[test]
    fn test_nodes_share_the_chain() {
        let sim = Simulation::new(3, small_config()).expect("sim");
        let tip = sim.shared_tip().hash;
        assert!(sim.nodes().iter().all(|n| n.active_tip() == Some(tip)));
        assert_eq!(sim.shared_tip().height, 2);
        let ids: std::collections::HashSet<ProofId> = sim.nodes().iter().map(|n| n.proof.proof_id()).collect();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn test_too_few_nodes() {
        assert!(Simulation::new(1, small_config()).is_err());
        assert!(Simulation::new(2, small_config()).is_err());
    }

    #[tokio::test]
    async fn test_connect_all_exchanges_proofs() {
        let sim = Simulation::new(4, small_config()).expect("sim");
        sim.connect_all().await.expect("connect");
        assert_eq!(sim.hub().link_count(), 6);
        for node in sim.nodes() {
            assert!(node.processor().can_share_local_proof());
            assert_eq!(node.processor().counters().proof_count, 4);
            assert_eq!(node.processor().peer_infos().len(), 4);
        }
    }
}
