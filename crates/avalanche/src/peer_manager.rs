//! # Peer/Node Registry
//!
//! Maps registered proofs (peers) to authenticated connections (nodes).
//!
//! ## Ownership
//!
//! ```text
//! PeerManager
//!   ├── ProofStore          owns every Proof
//!   ├── peers: PeerId → Peer   (proof handle, node set, slot index)
//!   ├── nodes: NodeId → Node   (PeerId key, session key, availability)
//!   └── pending: NodeId → PendingNode (proof not known yet)
//! ```
//!
//! ## Stake-Weighted Selection
//!
//! Each peer owns the slot `[start, start + score)`. A uniform draw in
//! `[0, slot_count)` picks the peer; removed peers leave holes that are
//! compacted when a draw lands in one (`SELECT_PEER_ATTEMPTS` draws max).
//!
//! ## Quorum
//!
//! `is_quorum_established()` latches once stake, connectivity ratio and
//! avaproofs answers are sufficient. The node count is checked every time.
//!
//! All methods take `now_ms`; the registry never reads the clock.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;

use ava_chain::ChainValidator;
use ava_common::{Amount, AvalancheConfig, ProofId, PublicKey};
use ava_proto::{Hello, ProofRef, SessionNonces};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::availability::AvailabilityScore;
use crate::error::{AuthError, ProofError};
use crate::ids::{NodeId, PeerId};
use crate::proof_store::{ProofCounters, ProofStore, RegistrationMode, RejectionMode, StoreUpdate};

/// Draws before giving up on a fragmented slot array.
pub const SELECT_PEER_ATTEMPTS: usize = 3;

fn to_secs(now_ms: u64) -> u64 {
    now_ms / 1_000
}

// ════════════════════════════════════════════════════════════════════════════
// TABLE ENTRIES
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug)]
pub struct Peer {
    pub peer_id: PeerId,
    pub proof: ProofRef,
    pub nodes: BTreeSet<NodeId>,
    pub has_finalized: bool,
    /// Unix seconds.
    pub registration_time: u64,
    /// Since when the peer has had no node, in ms.
    pub orphaned_since_ms: Option<u64>,
    slot: usize,
}

impl Peer {
    #[must_use]
    #[inline]
    pub fn proof_id(&self) -> ProofId {
        self.proof.proof_id()
    }

    #[must_use]
    #[inline]
    pub fn score(&self) -> u32 {
        self.proof.score()
    }

    #[must_use]
    #[inline]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub node_id: NodeId,
    pub peer_id: PeerId,
    pub session_key: PublicKey,
    pub next_request_time_ms: u64,
    pub availability: AvailabilityScore,
    /// Since when the availability has been at or below the floor.
    pub below_floor_since_ms: Option<u64>,
    pub addr: Option<SocketAddr>,
}

#[derive(Clone, Debug)]
struct PendingNode {
    proof_id: ProofId,
    session_key: PublicKey,
    addr: Option<SocketAddr>,
}

#[derive(Clone, Copy, Debug)]
struct Slot {
    start: u64,
    score: u32,
    peer: Option<PeerId>,
}

impl Slot {
    fn end(&self) -> u64 {
        self.start.saturating_add(u64::from(self.score))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    pub node_id: u64,
    pub availability_score: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PeerInfo {
    pub peer_id: u32,
    pub proof_id: String,
    pub node_count: usize,
    pub nodes: Vec<NodeInfo>,
}

// ════════════════════════════════════════════════════════════════════════════
// PEER MANAGER
// ════════════════════════════════════════════════════════════════════════════

pub struct PeerManager {
    config: AvalancheConfig,
    store: ProofStore,
    peers: HashMap<PeerId, Peer>,
    by_proof: HashMap<ProofId, PeerId>,
    next_peer_id: u32,
    slots: Vec<Slot>,
    slot_count: u64,
    fragmentation: u64,
    nodes: HashMap<NodeId, Node>,
    pending: HashMap<NodeId, PendingNode>,
    local_proof: Option<ProofId>,
    unbroadcast: HashSet<ProofId>,
    avaproofs_nodes: HashSet<NodeId>,
    quorum_latched: bool,
    need_more_nodes: bool,
}

impl PeerManager {
    #[must_use]
    pub fn new(config: AvalancheConfig) -> Self {
        Self {
            store: ProofStore::new(&config),
            config,
            peers: HashMap::new(),
            by_proof: HashMap::new(),
            next_peer_id: 0,
            slots: Vec::new(),
            slot_count: 0,
            fragmentation: 0,
            nodes: HashMap::new(),
            pending: HashMap::new(),
            local_proof: None,
            unbroadcast: HashSet::new(),
            avaproofs_nodes: HashSet::new(),
            quorum_latched: false,
            need_more_nodes: false,
        }
    }

    #[must_use]
    pub fn store(&self) -> &ProofStore {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &AvalancheConfig {
        &self.config
    }

    // ────────────────────────────────────────────────────────────────────────
    // proofs
    // ────────────────────────────────────────────────────────────────────────

    pub fn submit_proof(
        &mut self,
        proof: ProofRef,
        chain: &dyn ChainValidator,
        now_ms: u64,
        mode: RegistrationMode,
    ) -> Result<ProofId, ProofError> {
        let mut update = StoreUpdate::default();
        let result = self.store.submit(proof, chain, to_secs(now_ms), mode, &mut update);
        self.apply(update, now_ms);
        result
    }

    /// Register the proof this node stakes with. It counts as connected.
    pub fn set_local_proof(
        &mut self,
        proof: ProofRef,
        chain: &dyn ChainValidator,
        now_ms: u64,
    ) -> Result<ProofId, ProofError> {
        let id = proof.proof_id();
        self.local_proof = Some(id);
        self.unbroadcast.insert(id);
        match self.submit_proof(proof, chain, now_ms, RegistrationMode::Default) {
            Err(ProofError::AlreadyRegistered(_)) => Ok(id),
            other => other,
        }
    }

    #[must_use]
    pub fn local_proof(&self) -> Option<ProofId> {
        self.local_proof
    }

    pub fn reject_proof(
        &mut self,
        id: &ProofId,
        mode: RejectionMode,
        chain: &dyn ChainValidator,
        now_ms: u64,
    ) -> bool {
        let mut update = StoreUpdate::default();
        let done = self.store.reject_proof(id, mode, chain, to_secs(now_ms), &mut update);
        self.apply(update, now_ms);
        done
    }

    pub fn updated_block_tip(&mut self, chain: &dyn ChainValidator, now_ms: u64) {
        let update = self.store.updated_block_tip(chain, to_secs(now_ms));
        self.apply(update, now_ms);
    }

    /// Voting finalized the proof.
    pub fn set_finalized(&mut self, id: &ProofId) -> bool {
        let Some(peer_id) = self.by_proof.get(id).copied() else {
            return false;
        };
        if let Some(peer) = self.peers.get_mut(&peer_id) {
            peer.has_finalized = true;
        }
        self.store.mark_finalized(id)
    }

    pub fn add_unbroadcast(&mut self, id: ProofId) {
        self.unbroadcast.insert(id);
    }

    pub fn remove_unbroadcast(&mut self, id: &ProofId) {
        self.unbroadcast.remove(id);
    }

    #[must_use]
    pub fn unbroadcast(&self) -> &HashSet<ProofId> {
        &self.unbroadcast
    }

    fn apply(&mut self, update: StoreUpdate, now_ms: u64) {
        for id in &update.unbound {
            self.remove_peer(id);
        }
        for proof in update.bound {
            self.create_peer(proof, now_ms);
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // peers and slots
    // ────────────────────────────────────────────────────────────────────────

    fn create_peer(&mut self, proof: ProofRef, now_ms: u64) {
        let proof_id = proof.proof_id();
        if self.by_proof.contains_key(&proof_id) {
            return;
        }
        let peer_id = PeerId(self.next_peer_id);
        self.next_peer_id = self.next_peer_id.wrapping_add(1);

        let score = proof.score();
        let slot = self.slots.len();
        self.slots.push(Slot { start: self.slot_count, score, peer: Some(peer_id) });
        self.slot_count = self.slot_count.saturating_add(u64::from(score));

        let registration_time = self
            .store
            .registration_time(&proof_id)
            .unwrap_or_else(|| to_secs(now_ms));
        self.peers.insert(
            peer_id,
            Peer {
                peer_id,
                proof,
                nodes: BTreeSet::new(),
                has_finalized: false,
                registration_time,
                orphaned_since_ms: Some(now_ms),
                slot,
            },
        );
        self.by_proof.insert(proof_id, peer_id);
        info!("{} created for proof {} (score {})", peer_id, proof_id, score);

        let waiting: Vec<NodeId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.proof_id == proof_id)
            .map(|(n, _)| *n)
            .collect();
        for node_id in waiting {
            if let Some(p) = self.pending.remove(&node_id) {
                self.attach_node(node_id, peer_id, p.session_key, p.addr, now_ms);
            }
        }
    }

    fn remove_peer(&mut self, proof_id: &ProofId) {
        let Some(peer_id) = self.by_proof.remove(proof_id) else {
            return;
        };
        let Some(peer) = self.peers.remove(&peer_id) else {
            return;
        };
        if let Some(slot) = self.slots.get_mut(peer.slot) {
            slot.peer = None;
            self.fragmentation = self.fragmentation.saturating_add(u64::from(slot.score));
        }
        for node_id in &peer.nodes {
            if let Some(node) = self.nodes.remove(node_id) {
                self.pending.insert(
                    *node_id,
                    PendingNode { proof_id: *proof_id, session_key: node.session_key, addr: node.addr },
                );
            }
        }
        info!("{} removed, {} node(s) back to pending", peer_id, peer.nodes.len());
    }

    fn compact(&mut self) {
        let mut start = 0u64;
        let mut slots = Vec::with_capacity(self.peers.len());
        for slot in self.slots.iter().filter(|s| s.peer.is_some()) {
            if let Some(peer) = slot.peer.and_then(|p| self.peers.get_mut(&p)) {
                peer.slot = slots.len();
                slots.push(Slot { start, score: slot.score, peer: slot.peer });
                start = start.saturating_add(u64::from(slot.score));
            }
        }
        debug!("slots compacted, {} reclaimed", self.fragmentation);
        self.slots = slots;
        self.slot_count = start;
        self.fragmentation = 0;
    }

    fn slot_at(&self, draw: u64) -> Option<&Slot> {
        let index = self.slots.partition_point(|s| s.end() <= draw);
        self.slots.get(index).filter(|s| s.start <= draw && draw < s.end())
    }

    /// Stake-weighted peer draw.
    pub fn select_peer<R: Rng>(&mut self, rng: &mut R) -> Option<PeerId> {
        for _ in 0..SELECT_PEER_ATTEMPTS {
            if self.slot_count == 0 {
                return None;
            }
            let draw = rng.gen_range(0..self.slot_count);
            if let Some(peer) = self.slot_at(draw).and_then(|s| s.peer) {
                return Some(peer);
            }
            self.compact();
        }
        None
    }

    #[must_use]
    pub fn peer(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.get(&peer_id)
    }

    #[must_use]
    pub fn peer_for_proof(&self, proof_id: &ProofId) -> Option<&Peer> {
        self.by_proof.get(proof_id).and_then(|p| self.peers.get(p))
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> + '_ {
        self.peers.values()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ────────────────────────────────────────────────────────────────────────
    // nodes
    // ────────────────────────────────────────────────────────────────────────

    /// Authenticate an `avahello` and bind the node to its peer.
    ///
    /// The delegation chain is checked first, then the hello signature
    /// against the per-link nonces. An unknown proof leaves the node
    /// pending; a proof in the dangling pool is pulled back.
    pub fn register_node(
        &mut self,
        node_id: NodeId,
        hello: &Hello,
        nonces: SessionNonces,
        addr: Option<SocketAddr>,
        chain: &dyn ChainValidator,
        now_ms: u64,
    ) -> Result<PeerId, AuthError> {
        if self.nodes.contains_key(&node_id) || self.pending.contains_key(&node_id) {
            return Err(AuthError::DuplicateHello);
        }
        let session_key = hello
            .delegation
            .verify()
            .map_err(AuthError::BadDelegationSignature)?;
        if !session_key.verify_hash(&hello.expected_hash(nonces), &hello.signature) {
            return Err(AuthError::BadHelloSignature);
        }

        let proof_id = hello.delegation.proof_id();
        if !self.by_proof.contains_key(&proof_id) && self.store.is_dangling(&proof_id) {
            let mut update = StoreUpdate::default();
            if let Err(e) = self.store.rescue_dangling(&proof_id, chain, to_secs(now_ms), &mut update) {
                debug!("dangling proof {} not restored: {}", proof_id, e);
            }
            self.apply(update, now_ms);
        }

        match self.by_proof.get(&proof_id).copied() {
            Some(peer_id) => {
                self.attach_node(node_id, peer_id, session_key, addr, now_ms);
                Ok(peer_id)
            }
            None => {
                debug!("{} pending on unknown proof {}", node_id, proof_id);
                self.pending
                    .insert(node_id, PendingNode { proof_id, session_key, addr });
                Err(AuthError::UnknownProof(proof_id))
            }
        }
    }

    fn attach_node(
        &mut self,
        node_id: NodeId,
        peer_id: PeerId,
        session_key: PublicKey,
        addr: Option<SocketAddr>,
        now_ms: u64,
    ) {
        let Some(peer) = self.peers.get_mut(&peer_id) else {
            return;
        };
        peer.nodes.insert(node_id);
        peer.orphaned_since_ms = None;
        self.nodes.insert(
            node_id,
            Node {
                node_id,
                peer_id,
                session_key,
                next_request_time_ms: now_ms,
                availability: AvailabilityScore::default(),
                below_floor_since_ms: None,
                addr,
            },
        );
        debug!("{} attached to {}", node_id, peer_id);
    }

    pub fn remove_node(&mut self, node_id: NodeId, now_ms: u64) -> bool {
        self.pending.remove(&node_id);
        self.avaproofs_nodes.remove(&node_id);
        let Some(node) = self.nodes.remove(&node_id) else {
            return false;
        };
        if let Some(peer) = self.peers.get_mut(&node.peer_id) {
            peer.nodes.remove(&node_id);
            if peer.nodes.is_empty() {
                peer.orphaned_since_ms = Some(now_ms);
            }
        }
        debug!("{} removed from {}", node_id, node.peer_id);
        true
    }

    /// Session key `node_id` authenticated with. Nodes sent back to pending
    /// when their peer went away keep it.
    #[must_use]
    pub fn session_key(&self, node_id: NodeId) -> Option<&PublicKey> {
        self.nodes
            .get(&node_id)
            .map(|n| &n.session_key)
            .or_else(|| self.pending.get(&node_id).map(|p| &p.session_key))
    }

    #[must_use]
    pub fn node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    #[must_use]
    pub fn is_pending(&self, node_id: NodeId) -> bool {
        self.pending.contains_key(&node_id)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Addresses of nodes above the availability floor.
    #[must_use]
    pub fn good_addresses(&self, max: usize) -> Vec<SocketAddr> {
        let floor = self.config.availability_floor;
        self.nodes
            .values()
            .filter(|n| n.availability.is_above(floor))
            .filter_map(|n| n.addr)
            .take(max)
            .collect()
    }

    /// Pick a node to poll: stake-weighted peer, then the node of that
    /// peer whose request time came first, available nodes first.
    pub fn select_node<R: Rng>(&mut self, now_ms: u64, rng: &mut R) -> Option<NodeId> {
        let peer_id = self.select_peer(rng)?;
        let peer = self.peers.get(&peer_id)?;
        let floor = self.config.availability_floor;
        peer.nodes
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.next_request_time_ms <= now_ms)
            .min_by_key(|n| (!n.availability.is_above(floor), n.next_request_time_ms, n.node_id))
            .map(|n| n.node_id)
    }

    pub fn update_next_request_time(&mut self, node_id: NodeId, at_ms: u64) -> bool {
        match self.nodes.get_mut(&node_id) {
            Some(node) => {
                node.next_request_time_ms = at_ms;
                true
            }
            None => false,
        }
    }

    fn track_floor(node: &mut Node, floor: i32, now_ms: u64) {
        if node.availability.is_above(floor) {
            node.below_floor_since_ms = None;
        } else if node.below_floor_since_ms.is_none() {
            node.below_floor_since_ms = Some(now_ms);
        }
    }

    pub fn on_response(&mut self, node_id: NodeId, conclusive: bool, now_ms: u64) {
        let floor = self.config.availability_floor;
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.availability.on_response(conclusive);
            Self::track_floor(node, floor, now_ms);
        }
    }

    pub fn on_timeout(&mut self, node_id: NodeId, now_ms: u64) {
        let floor = self.config.availability_floor;
        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.availability.on_timeout();
            Self::track_floor(node, floor, now_ms);
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // quorum
    // ────────────────────────────────────────────────────────────────────────

    /// A node answered our `getavaproofs`.
    pub fn record_avaproofs_node(&mut self, node_id: NodeId) {
        self.avaproofs_nodes.insert(node_id);
    }

    #[must_use]
    pub fn avaproofs_node_count(&self) -> u64 {
        self.avaproofs_nodes.len() as u64
    }

    fn is_connected(&self, proof_id: &ProofId) -> bool {
        self.local_proof.as_ref() == Some(proof_id)
            || self
                .peer_for_proof(proof_id)
                .is_some_and(|p| !p.nodes.is_empty())
    }

    /// Stake of peers with at least one node, and of all peers.
    #[must_use]
    pub fn stake_totals(&self) -> (Amount, Amount) {
        self.peers.values().fold((0u64, 0u64), |(connected, total), p| {
            let amount = p.proof.staked_amount();
            let connected = if self.is_connected(&p.proof_id()) {
                connected.saturating_add(amount)
            } else {
                connected
            };
            (connected, total.saturating_add(amount))
        })
    }

    pub fn is_quorum_established(&mut self) -> bool {
        if self.nodes.len() < self.config.min_node_count {
            return false;
        }
        if self.quorum_latched {
            return true;
        }
        let (connected, total) = self.stake_totals();
        if total < self.config.min_quorum_stake {
            return false;
        }
        let required = (total as f64 * self.config.min_quorum_connected_stake_ratio).round() as u64;
        if connected < required {
            return false;
        }
        if self.avaproofs_node_count() < self.config.min_avaproofs_node_count {
            return false;
        }
        info!(
            "avalanche quorum established: {} nodes, stake {}/{}",
            self.nodes.len(),
            connected,
            total
        );
        self.quorum_latched = true;
        true
    }

    // ────────────────────────────────────────────────────────────────────────
    // maintenance
    // ────────────────────────────────────────────────────────────────────────

    /// Evict peers without nodes for `dangling_timeout`. The local proof
    /// is never evicted.
    pub fn cleanup_dangling(&mut self, now_ms: u64) -> Vec<ProofId> {
        let timeout_ms = self.config.dangling_timeout_secs.saturating_mul(1_000);
        let dangling: Vec<ProofId> = self
            .peers
            .values()
            .filter(|p| Some(p.proof_id()) != self.local_proof)
            .filter(|p| p.orphaned_since_ms.is_some_and(|t| now_ms.saturating_sub(t) >= timeout_ms))
            .map(|p| p.proof_id())
            .collect();
        for id in &dangling {
            let mut update = StoreUpdate::default();
            self.store.evict_dangling(id, to_secs(now_ms), &mut update);
            self.apply(update, now_ms);
        }
        if !dangling.is_empty() {
            self.need_more_nodes = true;
        }
        dangling
    }

    /// Nodes stuck below the availability floor for an address refresh
    /// interval. They are removed and must be disconnected by the caller.
    pub fn evict_stale_nodes(&mut self, now_ms: u64) -> Vec<NodeId> {
        let interval_ms = self.config.getavaaddr_interval_secs.saturating_mul(1_000);
        let stale: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.below_floor_since_ms.is_some_and(|t| now_ms.saturating_sub(t) >= interval_ms))
            .map(|n| n.node_id)
            .collect();
        for node_id in &stale {
            info!("{} evicted for low availability", node_id);
            self.remove_node(*node_id, now_ms);
        }
        if !stale.is_empty() {
            self.need_more_nodes = true;
        }
        stale
    }

    /// Whether an address discovery round is wanted. Clears the flag.
    pub fn take_need_more_nodes(&mut self) -> bool {
        std::mem::take(&mut self.need_more_nodes)
    }

    // ────────────────────────────────────────────────────────────────────────
    // observability
    // ────────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn counters(&self) -> ProofCounters {
        self.store.counters(|id| self.is_connected(id))
    }

    #[must_use]
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        let mut infos: Vec<PeerInfo> = self
            .peers
            .values()
            .map(|p| PeerInfo {
                peer_id: p.peer_id.0,
                proof_id: p.proof_id().to_string(),
                node_count: p.node_count(),
                nodes: p
                    .nodes
                    .iter()
                    .filter_map(|id| self.nodes.get(id))
                    .map(|n| NodeInfo {
                        node_id: n.node_id.0,
                        availability_score: n.availability.value(),
                    })
                    .collect(),
            })
            .collect();
        infos.sort_by_key(|i| i.peer_id);
        infos
    }

    /// Finalized peers registered at or before `registered_before` (unix
    /// seconds), the candidates of the staking reward draw.
    #[must_use]
    pub fn reward_candidates(&self, registered_before: u64) -> Vec<ProofRef> {
        self.peers
            .values()
            .filter(|p| p.has_finalized && p.registration_time <= registered_before)
            .map(|p| p.proof.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use ava_chain::MemoryChain;
    use ava_proto::DelegationBuilder;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const NONCES: SessionNonces = SessionNonces { local: 11, remote: 22 };

    /// Hello as sent by the remote side, signed with its own view of the nonces.
    fn hello_from(proof: &ProofRef, master: u8) -> Hello {
        let delegation = DelegationBuilder::from_proof(proof).build();
        let remote_view = SessionNonces { local: NONCES.remote, remote: NONCES.local };
        Hello::sign(delegation, &key(master), remote_view)
    }

    fn manager_with(chain: &MemoryChain, masters: &[u8]) -> (PeerManager, Vec<ProofRef>) {
        let mut pm = PeerManager::new(test_config());
        let proofs: Vec<ProofRef> = masters
            .iter()
            .map(|m| funded_proof(chain, *m, 0, &[m.wrapping_add(100)]))
            .collect();
        for p in &proofs {
            pm.submit_proof(p.clone(), chain, 0, RegistrationMode::Default)
                .expect("register");
        }
        (pm, proofs)
    }

    #[test]
    fn test_register_node_binds_to_peer() {
        let chain = chain_with_height(5);
        let (mut pm, proofs) = manager_with(&chain, &[1]);
        let peer = pm
            .register_node(NodeId(1), &hello_from(&proofs[0], 1), NONCES, None, &chain, 0)
            .expect("register node");
        assert_eq!(pm.peer(peer).map(|p| p.node_count()), Some(1));
        assert_eq!(
            pm.register_node(NodeId(1), &hello_from(&proofs[0], 1), NONCES, None, &chain, 0),
            Err(AuthError::DuplicateHello)
        );
    }

    #[test]
    fn test_bad_hello_signature() {
        let chain = chain_with_height(5);
        let (mut pm, proofs) = manager_with(&chain, &[1]);
        let mut hello = hello_from(&proofs[0], 1);
        hello.signature.0[0] ^= 1;
        assert_eq!(
            pm.register_node(NodeId(1), &hello, NONCES, None, &chain, 0),
            Err(AuthError::BadHelloSignature)
        );
        let replayed = hello_from(&proofs[0], 1);
        let other_link = SessionNonces { local: 99, remote: 22 };
        assert_eq!(
            pm.register_node(NodeId(2), &replayed, other_link, None, &chain, 0),
            Err(AuthError::BadHelloSignature)
        );
    }

    #[test]
    fn test_unknown_proof_stays_pending() {
        let chain = chain_with_height(5);
        let mut pm = PeerManager::new(test_config());
        let proof = funded_proof(&chain, 1, 0, &[101]);
        assert_eq!(
            pm.register_node(NodeId(1), &hello_from(&proof, 1), NONCES, None, &chain, 0),
            Err(AuthError::UnknownProof(proof.proof_id()))
        );
        assert!(pm.is_pending(NodeId(1)));

        pm.submit_proof(proof.clone(), &chain, 10, RegistrationMode::Default)
            .expect("register");
        assert!(!pm.is_pending(NodeId(1)));
        assert_eq!(pm.node(NodeId(1)).map(|n| n.peer_id), pm.peer_for_proof(&proof.proof_id()).map(|p| p.peer_id));
    }

    #[test]
    fn test_selection_is_stake_weighted() {
        let chain = chain_with_height(5);
        let mut pm = PeerManager::new(test_config());
        let small = funded_proof(&chain, 1, 0, &[101]);
        let big = funded_proof(&chain, 2, 0, &[102, 103, 104]);
        pm.submit_proof(small.clone(), &chain, 0, RegistrationMode::Default).expect("register");
        pm.submit_proof(big.clone(), &chain, 0, RegistrationMode::Default).expect("register");

        let big_peer = pm.peer_for_proof(&big.proof_id()).map(|p| p.peer_id);
        let mut rng = StdRng::seed_from_u64(7);
        let hits = (0..4_000)
            .filter(|_| pm.select_peer(&mut rng) == big_peer)
            .count();
        assert!((2_700..3_300).contains(&hits), "hits {}", hits);
    }

    #[test]
    fn test_removed_peer_slot_is_compacted() {
        let chain = chain_with_height(5);
        let (mut pm, proofs) = manager_with(&chain, &[1, 2]);
        pm.reject_proof(&proofs[0].proof_id(), RejectionMode::Invalidate, &chain, 0);
        let remaining = pm.peer_for_proof(&proofs[1].proof_id()).map(|p| p.peer_id);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert_eq!(pm.select_peer(&mut rng), remaining);
        }
    }

    #[test]
    fn test_select_node_respects_request_time() {
        let chain = chain_with_height(5);
        let (mut pm, proofs) = manager_with(&chain, &[1]);
        pm.register_node(NodeId(1), &hello_from(&proofs[0], 1), NONCES, None, &chain, 0)
            .expect("node");
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(pm.select_node(0, &mut rng), Some(NodeId(1)));
        pm.update_next_request_time(NodeId(1), 500);
        assert_eq!(pm.select_node(499, &mut rng), None);
        assert_eq!(pm.select_node(500, &mut rng), Some(NodeId(1)));
    }

    #[test]
    fn test_quorum_latches_but_rechecks_node_count() {
        let chain = chain_with_height(5);
        let config = AvalancheConfig { min_quorum_connected_stake_ratio: 0.5, ..test_config() };
        let mut pm = PeerManager::new(config);
        let a = funded_proof(&chain, 1, 0, &[101]);
        let b = funded_proof(&chain, 2, 0, &[102]);
        let c = funded_proof(&chain, 3, 0, &[103]);
        for p in [&a, &b, &c] {
            pm.submit_proof(p.clone(), &chain, 0, RegistrationMode::Default).expect("register");
        }
        assert!(!pm.is_quorum_established());

        pm.register_node(NodeId(1), &hello_from(&a, 1), NONCES, None, &chain, 0).expect("node");
        assert!(!pm.is_quorum_established());
        pm.register_node(NodeId(2), &hello_from(&b, 2), NONCES, None, &chain, 0).expect("node");
        assert!(pm.is_quorum_established());

        pm.remove_node(NodeId(2), 10);
        assert!(pm.is_quorum_established());
        pm.remove_node(NodeId(1), 10);
        assert!(!pm.is_quorum_established());
    }

    #[test]
    fn test_local_proof_counts_as_connected() {
        let chain = chain_with_height(5);
        let mut pm = PeerManager::new(test_config());
        let local = funded_proof(&chain, 1, 0, &[101]);
        pm.set_local_proof(local.clone(), &chain, 0).expect("local");
        let (connected, total) = pm.stake_totals();
        assert_eq!(connected, total);
        assert!(pm.unbroadcast().contains(&local.proof_id()));
    }

    #[test]
    fn test_dangling_cleanup_and_rescue() {
        let chain = chain_with_height(5);
        let (mut pm, proofs) = manager_with(&chain, &[1]);
        let id = proofs[0].proof_id();
        assert!(pm.cleanup_dangling(899_999).is_empty());
        assert_eq!(pm.cleanup_dangling(900_000), vec![id]);
        assert!(pm.take_need_more_nodes());
        assert!(!pm.take_need_more_nodes());
        assert!(pm.peer_for_proof(&id).is_none());
        assert!(pm.store().is_dangling(&id));

        pm.register_node(NodeId(5), &hello_from(&proofs[0], 1), NONCES, None, &chain, 900_001)
            .expect("rescued");
        assert_eq!(pm.peer_for_proof(&id).map(|p| p.node_count()), Some(1));
    }

    #[test]
    fn test_stale_nodes_evicted() {
        let chain = chain_with_height(5);
        let (mut pm, proofs) = manager_with(&chain, &[1]);
        pm.register_node(NodeId(1), &hello_from(&proofs[0], 1), NONCES, None, &chain, 0).expect("node");
        for _ in 0..6 {
            pm.on_timeout(NodeId(1), 1_000);
        }
        assert_eq!(pm.node(NodeId(1)).map(|n| n.availability.value()), Some(-12));
        assert!(pm.evict_stale_nodes(120_999).is_empty());
        assert_eq!(pm.evict_stale_nodes(121_000), vec![NodeId(1)]);
        assert!(pm.take_need_more_nodes());
    }

    #[test]
    fn test_peer_infos() {
        let chain = chain_with_height(5);
        let (mut pm, proofs) = manager_with(&chain, &[1, 2]);
        pm.register_node(NodeId(4), &hello_from(&proofs[1], 2), NONCES, None, &chain, 0).expect("node");
        pm.on_response(NodeId(4), true, 5);
        let infos = pm.peer_infos();
        assert_eq!(infos.len(), 2);
        let with_node = infos.iter().find(|i| i.node_count == 1).expect("peer with node");
        assert_eq!(with_node.proof_id, proofs[1].proof_id().to_string());
        assert_eq!(with_node.nodes, vec![NodeInfo { node_id: 4, availability_score: 1 }]);
    }
}
