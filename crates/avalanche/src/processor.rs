//! # Avalanche Processor
//!
//! The voting engine. Owns the peer registry, the vote records and the
//! in-flight queries, and turns inbound avalanche messages into votes,
//! replies and status updates.
//!
//! ## Tables and Lock Order
//!
//! | Table | Lock | Content |
//! |-------|------|---------|
//! | `peers` | `RwLock<PeerManager>` | proofs, peers, nodes |
//! | `votes` | `RwLock<VoteTable>` | one `VoteRecord` per item |
//! | `queries` | `RwLock<HashMap>` | `(node, round)` → deadline and invs |
//!
//! A thread holding several tables always took them in this order:
//! peers, then votes, then queries. The remaining mutexes are leaves and
//! are never held while a table lock is taken.
//!
//! ## Round Lifecycle
//!
//! ```text
//! poll_round ──▶ select node (stake weighted)
//!            ──▶ up to max_element_poll items, blocks first
//!            ──▶ queries[(node, round)] = deadline
//!
//! avaresponse ──▶ round known? size? hashes? signature?
//!             ──▶ register votes ──▶ VoteUpdate on the event channel
//!
//! deadline passed ──▶ availability penalty, inflight released
//! ```
//!
//! The processor never reads the clock: every entry point takes `now_ms`.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use ava_chain::ChainValidator;
use ava_common::{AvalancheConfig, ProofId, SecretKey};
use ava_proto::message::MAX_ADDR_TO_SEND;
use ava_proto::{
    Delegation, Hello, Inv, Message, Poll, ProofRef, Response, SessionNonces, Vote, VoteCode,
};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::addr_limiter::AddrRequestLimiter;
use crate::error::{AuthError, ProofError, ProtocolViolation};
use crate::events::{ItemOracle, UpdateSender, VoteItem, VoteStatus, VoteUpdate};
use crate::ids::{ConnectionDirection, NodeId};
use crate::misbehavior::MisbehaviorTracker;
use crate::peer_manager::{PeerInfo, PeerManager};
use crate::proof_store::{ProofCounters, ProofStore, RegistrationMode, RejectionMode};
use crate::relay::ProofRelay;
use crate::vote_record::VoteRecord;

// ════════════════════════════════════════════════════════════════════════════
// TABLES
// ════════════════════════════════════════════════════════════════════════════

struct VoteEntry {
    record: VoteRecord,
    /// Insertion order, older items are polled first.
    seq: u64,
}

#[derive(Default)]
struct VoteTable {
    entries: HashMap<VoteItem, VoteEntry>,
    next_seq: u64,
}

impl VoteTable {
    fn insert(&mut self, item: VoteItem, record: VoteRecord) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.entries.insert(item, VoteEntry { record, seq });
    }

    /// Items in poll order: kind priority, then age.
    fn poll_order(&self) -> Vec<VoteItem> {
        let mut items: Vec<(VoteItem, u64)> = self.entries.iter().map(|(i, e)| (*i, e.seq)).collect();
        items.sort_by_key(|(item, seq)| (item.kind(), *seq));
        items.into_iter().map(|(item, _)| item).collect()
    }

    fn clear_inflight(&mut self, invs: &[Inv]) {
        for inv in invs {
            if let Some(entry) = self.entries.get_mut(&VoteItem::from(*inv)) {
                entry.record.clear_inflight();
            }
        }
    }
}

struct Query {
    deadline_ms: u64,
    invs: Vec<Inv>,
}

/// Bounded memory of decided items. Oldest entries fall out first.
struct FinalizedItems {
    capacity: usize,
    accepted: HashMap<VoteItem, bool>,
    order: VecDeque<VoteItem>,
}

impl FinalizedItems {
    fn new(capacity: usize) -> Self {
        Self { capacity, accepted: HashMap::new(), order: VecDeque::new() }
    }

    fn insert(&mut self, item: VoteItem, accepted: bool) {
        if self.accepted.insert(item, accepted).is_some() {
            return;
        }
        self.order.push_back(item);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.accepted.remove(&old);
            }
        }
    }

    fn get(&self, item: &VoteItem) -> Option<bool> {
        self.accepted.get(item).copied()
    }
}

struct Session {
    nonces: SessionNonces,
    addr: Option<SocketAddr>,
    direction: ConnectionDirection,
}

// ════════════════════════════════════════════════════════════════════════════
// OUTCOMES
// ════════════════════════════════════════════════════════════════════════════

/// What the caller must do after an inbound message.
#[derive(Debug, Default)]
pub struct MessageOutcome {
    pub replies: Vec<Message>,
    /// Addresses learned from an `addr` reply.
    pub discovered: Vec<SocketAddr>,
    pub violation: Option<ProtocolViolation>,
    /// The node reached the ban threshold.
    pub disconnect: bool,
}

/// Work produced by the periodic maintenance pass.
#[derive(Debug, Default)]
pub struct Maintenance {
    pub disconnect: Vec<NodeId>,
    pub requests: Vec<(NodeId, Message)>,
    pub dangling: Vec<ProofId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VotingStats {
    pub items: usize,
    pub queries: usize,
    pub finalized: usize,
    pub next_round: u64,
}

// ════════════════════════════════════════════════════════════════════════════
// PROCESSOR
// ════════════════════════════════════════════════════════════════════════════

pub struct Processor {
    config: AvalancheConfig,
    chain: Arc<dyn ChainValidator>,
    oracle: Arc<dyn ItemOracle>,
    session_key: SecretKey,
    updates: UpdateSender,

    peers: RwLock<PeerManager>,
    votes: RwLock<VoteTable>,
    queries: RwLock<HashMap<(NodeId, u64), Query>>,

    finalized: Mutex<FinalizedItems>,
    sessions: Mutex<HashMap<NodeId, Session>>,
    local_delegation: Mutex<Option<Delegation>>,
    /// Latched once any inbound link exists.
    can_share_local_proof: AtomicBool,
    /// Nodes still owed our `avahello`.
    delayed_hellos: Mutex<BTreeSet<NodeId>>,
    misbehavior: Mutex<MisbehaviorTracker>,
    relay: Mutex<ProofRelay>,
    addr_limiter: Mutex<AddrRequestLimiter>,
    addr_request: Mutex<Option<NodeId>>,
    rng: Mutex<StdRng>,
    round: AtomicU64,
}

impl Processor {
    pub fn new(
        config: AvalancheConfig,
        chain: Arc<dyn ChainValidator>,
        oracle: Arc<dyn ItemOracle>,
        session_key: SecretKey,
        updates: UpdateSender,
    ) -> Self {
        Self {
            peers: RwLock::new(PeerManager::new(config.clone())),
            votes: RwLock::new(VoteTable::default()),
            queries: RwLock::new(HashMap::new()),
            finalized: Mutex::new(FinalizedItems::new(config.finalized_items_capacity)),
            sessions: Mutex::new(HashMap::new()),
            local_delegation: Mutex::new(None),
            can_share_local_proof: AtomicBool::new(false),
            delayed_hellos: Mutex::new(BTreeSet::new()),
            misbehavior: Mutex::new(MisbehaviorTracker::new(config.ban_threshold)),
            relay: Mutex::new(ProofRelay::new(config.avaproofs_timeout_secs)),
            addr_limiter: Mutex::new(AddrRequestLimiter::new(config.getavaaddr_interval_secs)),
            addr_request: Mutex::new(None),
            rng: Mutex::new(StdRng::from_entropy()),
            round: AtomicU64::new(0),
            config,
            chain,
            oracle,
            session_key,
            updates,
        }
    }

    /// Replace the node selection rng, for reproducible runs.
    #[must_use]
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    #[must_use]
    pub fn config(&self) -> &AvalancheConfig {
        &self.config
    }

    // ────────────────────────────────────────────────────────────────────────
    // local identity
    // ────────────────────────────────────────────────────────────────────────

    /// Stake with `proof`. `delegation` must delegate to the session key.
    pub fn set_local_proof(
        &self,
        proof: ProofRef,
        delegation: Delegation,
        now_ms: u64,
    ) -> Result<ProofId, ProofError> {
        let id = self
            .peers
            .write()
            .set_local_proof(proof, self.chain.as_ref(), now_ms)?;
        *self.local_delegation.lock() = Some(delegation);
        info!("local proof {} registered", id);
        self.add_to_reconcile(VoteItem::Proof(id));
        Ok(id)
    }

    // ────────────────────────────────────────────────────────────────────────
    // connections
    // ────────────────────────────────────────────────────────────────────────

    /// A new avalanche link. Returns the messages to send on it.
    ///
    /// Our `avahello` goes out only once the local proof can be shared;
    /// until then the node waits in the delayed set.
    pub fn connect_node(
        &self,
        node: NodeId,
        nonces: SessionNonces,
        addr: Option<SocketAddr>,
        direction: ConnectionDirection,
        now_ms: u64,
    ) -> Vec<Message> {
        if self.misbehavior.lock().is_banned(node) {
            return Vec::new();
        }
        self.sessions.lock().insert(node, Session { nonces, addr, direction });

        let mut out = Vec::new();
        let delegation = self.local_delegation.lock().clone();
        if let Some(delegation) = delegation {
            if self.can_share_local_proof() {
                out.push(Message::AvaHello(Hello::sign(delegation, &self.session_key, nonces)));
            } else {
                debug!("avahello to {} delayed until an inbound link exists", node);
                self.delayed_hellos.lock().insert(node);
            }
        }
        if let Some(request) = self.relay.lock().request_proofs(node, now_ms) {
            out.push(request);
        }
        out
    }

    /// Whether the local proof may be advertised. Latched on the first
    /// inbound link, so a node with no inbound connectivity keeps its proof
    /// to itself.
    pub fn can_share_local_proof(&self) -> bool {
        if self.can_share_local_proof.load(Ordering::Acquire) {
            return true;
        }
        let inbound = self
            .sessions
            .lock()
            .values()
            .any(|s| s.direction == ConnectionDirection::Inbound);
        if inbound {
            self.can_share_local_proof.store(true, Ordering::Release);
            info!("inbound link present, local proof can be shared");
        }
        inbound
    }

    /// `avahello`s held back by `connect_node`, once they can be sent.
    pub fn take_delayed_hellos(&self) -> Vec<(NodeId, Message)> {
        if self.delayed_hellos.lock().is_empty() || !self.can_share_local_proof() {
            return Vec::new();
        }
        let Some(delegation) = self.local_delegation.lock().clone() else {
            return Vec::new();
        };
        let delayed = std::mem::take(&mut *self.delayed_hellos.lock());
        let sessions = self.sessions.lock();
        delayed
            .into_iter()
            .filter_map(|node| {
                let session = sessions.get(&node)?;
                let hello = Hello::sign(delegation.clone(), &self.session_key, session.nonces);
                Some((node, Message::AvaHello(hello)))
            })
            .collect()
    }

    pub fn disconnect_node(&self, node: NodeId, now_ms: u64) {
        self.sessions.lock().remove(&node);
        self.delayed_hellos.lock().remove(&node);
        self.relay.lock().forget(node);
        self.misbehavior.lock().forget(node);

        let mut peers = self.peers.write();
        peers.remove_node(node, now_ms);
        let mut votes = self.votes.write();
        let mut queries = self.queries.write();
        queries.retain(|(n, _), query| {
            if *n == node {
                votes.clear_inflight(&query.invs);
                false
            } else {
                true
            }
        });
        debug!("{} disconnected", node);
    }

    #[must_use]
    pub fn is_banned(&self, node: NodeId) -> bool {
        self.misbehavior.lock().is_banned(node)
    }

    // ────────────────────────────────────────────────────────────────────────
    // vote records
    // ────────────────────────────────────────────────────────────────────────

    /// Start voting on `item`. Decided items and items not worth polling
    /// are refused.
    pub fn add_to_reconcile(&self, item: VoteItem) -> bool {
        if self.finalized.lock().get(&item).is_some() {
            return false;
        }
        let peers = self.peers.read();
        let accepted = match item {
            VoteItem::Proof(id) => {
                if !Self::is_proof_worth_polling(peers.store(), &id) {
                    return false;
                }
                peers.store().is_bound(&id)
            }
            _ => {
                if !self.oracle.is_worth_polling(&item) {
                    return false;
                }
                self.oracle.local_acceptance(&item)
            }
        };
        let mut votes = self.votes.write();
        if votes.entries.contains_key(&item) {
            return false;
        }
        votes.insert(item, VoteRecord::new(accepted));
        debug!("{} added to reconcile (accepted: {})", item, accepted);
        true
    }

    #[must_use]
    pub fn is_accepted(&self, item: &VoteItem) -> bool {
        if let Some(entry) = self.votes.read().entries.get(item) {
            return entry.record.is_accepted();
        }
        self.finalized.lock().get(item).unwrap_or(false)
    }

    #[must_use]
    pub fn confidence(&self, item: &VoteItem) -> Option<u16> {
        self.votes.read().entries.get(item).map(|e| e.record.confidence())
    }

    /// Whether voting finished on `item`, in either direction.
    #[must_use]
    pub fn is_decided(&self, item: &VoteItem) -> bool {
        self.finalized.lock().get(item).is_some()
    }

    #[must_use]
    pub fn is_voting(&self, item: &VoteItem) -> bool {
        self.votes.read().entries.contains_key(item)
    }

    fn is_proof_worth_polling(store: &ProofStore, id: &ProofId) -> bool {
        (store.is_bound(id) || store.is_conflicting(id)) && !store.is_finalized(id) && !store.is_invalid(id)
    }

    fn is_worth_polling(&self, store: &ProofStore, item: &VoteItem) -> bool {
        match item {
            VoteItem::Proof(id) => Self::is_proof_worth_polling(store, id),
            _ => self.oracle.is_worth_polling(item),
        }
    }

    fn local_vote(&self, store: &ProofStore, item: &VoteItem) -> VoteCode {
        match item {
            VoteItem::Proof(id) if store.is_bound(id) => VoteCode::Accepted,
            VoteItem::Proof(id) if store.is_conflicting(id) => VoteCode::Rejected,
            VoteItem::Proof(id) if store.is_invalid(id) => VoteCode::Invalid,
            VoteItem::Proof(_) => VoteCode::Unknown,
            _ => self.oracle.local_vote(item),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // polling
    // ────────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn is_quorum_established(&self) -> bool {
        self.peers.write().is_quorum_established()
    }

    /// One polling pass: expire overdue queries, then poll as many ready
    /// nodes as there are items with free inflight slots.
    pub fn poll_round(&self, now_ms: u64) -> Vec<(NodeId, Message)> {
        self.expire_queries(now_ms);

        let mut peers = self.peers.write();
        if !peers.is_quorum_established() {
            return Vec::new();
        }
        let mut votes = self.votes.write();
        let mut queries = self.queries.write();
        let mut rng = self.rng.lock();

        let deadline_ms = now_ms.saturating_add(self.config.query_timeout_ms);
        let mut polls = Vec::new();
        for _ in 0..self.config.max_inflight_poll.max(1) {
            let Some(node) = peers.select_node(now_ms, &mut *rng) else {
                continue;
            };
            let invs = self.invs_for_poll(&peers, &mut votes);
            if invs.is_empty() {
                break;
            }
            let round = self.round.fetch_add(1, Ordering::Relaxed);
            peers.update_next_request_time(node, deadline_ms);
            queries.insert((node, round), Query { deadline_ms, invs: invs.clone() });
            debug!("polling {} round {} with {} item(s)", node, round, invs.len());
            polls.push((node, Message::AvaPoll(Poll { round, invs })));
        }
        polls
    }

    fn invs_for_poll(&self, peers: &PeerManager, votes: &mut VoteTable) -> Vec<Inv> {
        let mut invs = Vec::new();
        for item in votes.poll_order() {
            if invs.len() >= self.config.max_element_poll {
                break;
            }
            if !self.is_worth_polling(peers.store(), &item) {
                debug!("{} no longer worth polling", item);
                votes.entries.remove(&item);
                continue;
            }
            if let Some(entry) = votes.entries.get_mut(&item) {
                if entry.record.register_poll(self.config.max_inflight_poll) {
                    invs.push(item.inv());
                }
            }
        }
        invs
    }

    fn expire_queries(&self, now_ms: u64) {
        let expired: Vec<(NodeId, Query)> = {
            let mut queries = self.queries.write();
            let keys: Vec<(NodeId, u64)> = queries
                .iter()
                .filter(|(_, q)| q.deadline_ms <= now_ms)
                .map(|(k, _)| *k)
                .collect();
            keys.into_iter()
                .filter_map(|k| queries.remove(&k).map(|q| (k.0, q)))
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        let mut peers = self.peers.write();
        let mut votes = self.votes.write();
        for (node, query) in expired {
            debug!("{} timed out on {} item(s)", node, query.invs.len());
            peers.on_timeout(node, now_ms);
            votes.clear_inflight(&query.invs);
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // inbound messages
    // ────────────────────────────────────────────────────────────────────────

    pub fn process_message(&self, node: NodeId, msg: Message, now_ms: u64) -> MessageOutcome {
        let mut outcome = MessageOutcome::default();
        if self.misbehavior.lock().is_banned(node) {
            outcome.disconnect = true;
            return outcome;
        }
        if let Err(violation) = self.dispatch(node, msg, now_ms, &mut outcome) {
            outcome.disconnect = self.misbehavior.lock().record(node, &violation);
            outcome.violation = Some(violation);
        }
        outcome
    }

    fn dispatch(
        &self,
        node: NodeId,
        msg: Message,
        now_ms: u64,
        outcome: &mut MessageOutcome,
    ) -> Result<(), ProtocolViolation> {
        match msg {
            Message::AvaHello(hello) => self.on_hello(node, &hello, now_ms),
            Message::AvaPoll(poll) => {
                outcome.replies.push(self.on_poll(poll)?);
                Ok(())
            }
            Message::AvaResponse { response, signature } => {
                self.on_response(node, response, &signature, now_ms)
            }
            Message::GetAvaAddr => {
                if self.addr_limiter.lock().allow_incoming(node, now_ms / 1_000) {
                    outcome
                        .replies
                        .push(Message::Addr(self.peers.read().good_addresses(MAX_ADDR_TO_SEND)));
                }
                Ok(())
            }
            Message::Addr(addrs) => {
                outcome.discovered = self.on_addr(node, addrs);
                Ok(())
            }
            Message::GetAvaProofs => {
                outcome.replies.push(self.on_get_ava_proofs(node, now_ms));
                Ok(())
            }
            Message::AvaProofs(compact) => {
                let known: Vec<ProofId> = {
                    let peers = self.peers.read();
                    let store = peers.store();
                    store
                        .bound_proofs()
                        .iter()
                        .chain(store.conflicting_proofs().iter())
                        .map(|p| p.proof_id())
                        .collect()
                };
                let received = self.relay.lock().on_ava_proofs(node, compact, known.iter(), now_ms)?;
                self.peers.write().record_avaproofs_node(node);
                outcome.replies.extend(received.request);
                for proof in received.prefilled {
                    self.receive_proof(Arc::new(proof), now_ms)?;
                }
                Ok(())
            }
            Message::AvaProofsReq(indices) => {
                let replies = self.relay.lock().on_ava_proofs_req(node, &indices)?;
                outcome.replies.extend(replies);
                Ok(())
            }
            Message::AvaProof(proof) => {
                if self.relay.lock().on_ava_proof(node, &proof, now_ms)? {
                    self.receive_proof(Arc::new(proof), now_ms)?;
                }
                Ok(())
            }
        }
    }

    fn on_hello(&self, node: NodeId, hello: &Hello, now_ms: u64) -> Result<(), ProtocolViolation> {
        let session = {
            let sessions = self.sessions.lock();
            sessions.get(&node).map(|s| (s.nonces, s.addr))
        };
        let Some((nonces, addr)) = session else {
            debug!("avahello from {} without a session", node);
            return Ok(());
        };
        let result = self
            .peers
            .write()
            .register_node(node, hello, nonces, addr, self.chain.as_ref(), now_ms);
        match result {
            Ok(peer) => {
                info!("{} authenticated as {}", node, peer);
                Ok(())
            }
            Err(AuthError::UnknownProof(id)) => {
                debug!("{} waits for proof {}", node, id);
                Ok(())
            }
            Err(e) => Err(ProtocolViolation::InvalidHello(e)),
        }
    }

    fn on_poll(&self, poll: Poll) -> Result<Message, ProtocolViolation> {
        if poll.invs.len() > self.config.max_element_poll {
            return Err(ProtocolViolation::PollTooLarge {
                count: poll.invs.len(),
                max: self.config.max_element_poll,
            });
        }
        let votes = {
            let peers = self.peers.read();
            poll.invs
                .iter()
                .map(|inv| Vote::new(self.local_vote(peers.store(), &VoteItem::from(*inv)), inv.hash))
                .collect()
        };
        let response = Response {
            round: poll.round,
            cooldown_ms: u32::try_from(self.config.poll_interval_ms).unwrap_or(u32::MAX),
            votes,
        };
        Ok(Message::signed_response(response, &self.session_key))
    }

    fn on_response(
        &self,
        node: NodeId,
        response: Response,
        signature: &ava_common::Signature,
        now_ms: u64,
    ) -> Result<(), ProtocolViolation> {
        let query = self
            .queries
            .write()
            .remove(&(node, response.round))
            .ok_or(ProtocolViolation::UnexpectedResponse { round: response.round })?;

        let mut peers = self.peers.write();
        let mut votes = self.votes.write();
        if let Err(violation) = Self::check_response(&peers, node, &query, &response, signature) {
            votes.clear_inflight(&query.invs);
            return Err(violation);
        }

        let conclusive = response.votes.iter().any(|v| v.code.is_conclusive());
        peers.on_response(node, conclusive, now_ms);
        peers.update_next_request_time(node, now_ms.saturating_add(u64::from(response.cooldown_ms)));

        let mut updates = Vec::new();
        for (inv, vote) in query.invs.iter().zip(&response.votes) {
            let item = VoteItem::from(*inv);
            let Some(entry) = votes.entries.get_mut(&item) else {
                continue;
            };
            let record = &mut entry.record;
            record.clear_inflight();

            if !record.register_vote(node, vote.code, self.config.finalization_score) {
                if record.is_stale(self.config.stale_vote_threshold, self.config.stale_vote_factor) {
                    info!("{} is stale after {} successful votes", item, record.successful_votes());
                    votes.entries.remove(&item);
                    updates.push(VoteUpdate { item, status: VoteStatus::Stale });
                }
                continue;
            }

            let status = match (record.has_finalized(), record.is_accepted()) {
                (true, true) => VoteStatus::Finalized,
                (true, false) => VoteStatus::Invalid,
                (false, true) => VoteStatus::Accepted,
                (false, false) => VoteStatus::Rejected,
            };
            if status.is_final() {
                votes.entries.remove(&item);
                self.finalized.lock().insert(item, status == VoteStatus::Finalized);
                info!("{} decided: {:?}", item, status);
            } else {
                debug!("{} flipped: {:?}", item, status);
            }
            updates.push(VoteUpdate { item, status });
        }
        drop(votes);

        for update in &updates {
            if let VoteItem::Proof(id) = update.item {
                self.apply_proof_update(&mut peers, &id, update.status, now_ms);
            }
        }
        drop(peers);

        for update in updates {
            if self.updates.send(update).is_err() {
                warn!("vote update channel closed, dropping {:?}", update);
            }
        }
        Ok(())
    }

    fn check_response(
        peers: &PeerManager,
        node: NodeId,
        query: &Query,
        response: &Response,
        signature: &ava_common::Signature,
    ) -> Result<(), ProtocolViolation> {
        if response.votes.len() != query.invs.len() {
            return Err(ProtocolViolation::InvalidResponseSize {
                expected: query.invs.len(),
                actual: response.votes.len(),
            });
        }
        if query.invs.iter().zip(&response.votes).any(|(inv, vote)| inv.hash != vote.hash) {
            return Err(ProtocolViolation::InvalidResponseContent);
        }
        let verified = peers
            .session_key(node)
            .is_some_and(|key| key.verify_hash(&response.signing_hash(), signature));
        if !verified {
            return Err(ProtocolViolation::InvalidResponseSignature);
        }
        Ok(())
    }

    /// Effects of a proof vote on the registry.
    fn apply_proof_update(&self, peers: &mut PeerManager, id: &ProofId, status: VoteStatus, now_ms: u64) {
        let chain = self.chain.as_ref();
        match status {
            VoteStatus::Finalized => {
                peers.set_finalized(id);
            }
            VoteStatus::Invalid => {
                peers.reject_proof(id, RejectionMode::Invalidate, chain, now_ms);
            }
            VoteStatus::Rejected => {
                peers.reject_proof(id, RejectionMode::Default, chain, now_ms);
            }
            VoteStatus::Accepted => {
                if !peers.store().is_conflicting(id) {
                    return;
                }
                if let Some(proof) = peers.store().get(id) {
                    if let Err(e) = peers.submit_proof(proof, chain, now_ms, RegistrationMode::ForceAccept) {
                        warn!("accepted proof {} could not be bound: {}", id, e);
                    }
                }
            }
            VoteStatus::Stale => {}
        }
    }

    fn on_addr(&self, node: NodeId, addrs: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let mut pending = self.addr_request.lock();
        if *pending != Some(node) {
            return Vec::new();
        }
        *pending = None;
        drop(pending);

        let known: HashSet<SocketAddr> = self.sessions.lock().values().filter_map(|s| s.addr).collect();
        let fresh: Vec<SocketAddr> = addrs.into_iter().filter(|a| !known.contains(a)).collect();
        self.addr_limiter.lock().record_outcome(!fresh.is_empty());
        debug!("{} sent {} new address(es)", node, fresh.len());
        fresh
    }

    fn on_get_ava_proofs(&self, node: NodeId, now_ms: u64) -> Message {
        let share_local = self.can_share_local_proof();
        let (proofs, prefill) = {
            let peers = self.peers.read();
            let local = peers.local_proof();
            let mut prefill: HashSet<ProofId> = peers.unbroadcast().clone();
            let mut proofs = peers.store().bound_proofs();
            match local {
                Some(id) if share_local => {
                    prefill.insert(id);
                }
                Some(id) => {
                    prefill.remove(&id);
                    proofs.retain(|p| p.proof_id() != id);
                }
                None => {}
            }
            (proofs, prefill)
        };
        let mut rng = self.rng.lock();
        self.relay
            .lock()
            .on_get_ava_proofs(node, proofs, &prefill, now_ms, &mut *rng)
    }

    /// Submit a relayed proof and start voting on it.
    fn receive_proof(&self, proof: ProofRef, now_ms: u64) -> Result<(), ProtocolViolation> {
        let id = proof.proof_id();
        let result = self
            .peers
            .write()
            .submit_proof(proof, self.chain.as_ref(), now_ms, RegistrationMode::Default);
        match result {
            Ok(_) | Err(ProofError::Conflicting) => {
                self.add_to_reconcile(VoteItem::Proof(id));
                Ok(())
            }
            Err(e) if e.is_misbehavior() => Err(ProtocolViolation::InvalidProof(e)),
            Err(e) => {
                debug!("proof {} not registered: {}", id, e);
                Ok(())
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // chain events and maintenance
    // ────────────────────────────────────────────────────────────────────────

    /// The active tip moved. Re-checks stakes and proof maturity.
    pub fn updated_block_tip(&self, now_ms: u64) {
        let bound: Vec<ProofId> = {
            let mut peers = self.peers.write();
            peers.updated_block_tip(self.chain.as_ref(), now_ms);
            peers.store().bound_proofs().iter().map(|p| p.proof_id()).collect()
        };
        for id in bound {
            self.add_to_reconcile(VoteItem::Proof(id));
        }
    }

    /// Periodic housekeeping: relay state, dangling peers, unavailable
    /// nodes and address discovery.
    pub fn maintenance(&self, now_ms: u64) -> Maintenance {
        let now_secs = now_ms / 1_000;
        self.relay.lock().purge(now_ms);
        self.addr_limiter.lock().cleanup(now_secs);

        let mut out = Maintenance::default();
        let (request_node, need_more) = {
            let mut peers = self.peers.write();
            out.dangling = peers.cleanup_dangling(now_ms);
            out.disconnect = peers.evict_stale_nodes(now_ms);
            let need_more = peers.take_need_more_nodes() || peers.node_count() < self.config.min_node_count;
            let mut rng = self.rng.lock();
            (peers.select_node(now_ms, &mut *rng), need_more)
        };

        if need_more {
            if let Some(node) = request_node {
                let mut limiter = self.addr_limiter.lock();
                if limiter.should_request(now_secs) {
                    limiter.record_request(now_secs);
                    *self.addr_request.lock() = Some(node);
                    out.requests.push((node, Message::GetAvaAddr));
                }
            }
        }
        out.requests.extend(self.take_delayed_hellos());
        out
    }

    // ────────────────────────────────────────────────────────────────────────
    // observability
    // ────────────────────────────────────────────────────────────────────────

    #[must_use]
    pub fn counters(&self) -> ProofCounters {
        self.peers.read().counters()
    }

    #[must_use]
    pub fn peer_infos(&self) -> Vec<PeerInfo> {
        self.peers.read().peer_infos()
    }

    #[must_use]
    pub fn stats(&self) -> VotingStats {
        VotingStats {
            items: self.votes.read().entries.len(),
            queries: self.queries.read().len(),
            finalized: self.finalized.lock().accepted.len(),
            next_round: self.round.load(Ordering::Relaxed),
        }
    }

    /// Candidates of the staking reward draw, see `PeerManager::reward_candidates`.
    #[must_use]
    pub fn reward_candidates(&self, registered_before: u64) -> Vec<ProofRef> {
        self.peers.read().reward_candidates(registered_before)
    }

    /// Read access to the registry.
    pub fn with_peers<T>(&self, f: impl FnOnce(&PeerManager) -> T) -> T {
        let peers = self.peers.read();
        f(&peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{update_channel, UpdateReceiver};
    use crate::test_utils::*;
    use ava_chain::MemoryChain;
    use ava_common::{BlockHash, Hash256};
    use ava_proto::DelegationBuilder;

    /// Oracle that accepts every block and transaction.
    struct AcceptAll;

    impl ItemOracle for AcceptAll {
        fn is_worth_polling(&self, _: &VoteItem) -> bool {
            true
        }
        fn local_acceptance(&self, _: &VoteItem) -> bool {
            true
        }
        fn local_vote(&self, _: &VoteItem) -> VoteCode {
            VoteCode::Accepted
        }
    }

    const NONCES: SessionNonces = SessionNonces { local: 5, remote: 6 };

    struct Harness {
        processor: Processor,
        updates: UpdateReceiver,
        chain: Arc<MemoryChain>,
    }

    fn harness() -> Harness {
        let chain = Arc::new(chain_with_height(10));
        let (tx, rx) = update_channel();
        let config = AvalancheConfig { finalization_score: 4, ..test_config() };
        let processor = Processor::new(config, chain.clone(), Arc::new(AcceptAll), key(200), tx).with_seed(7);
        Harness { processor, updates: rx, chain }
    }

    /// Register `master` as a remote staker connected through `node`.
    fn connect_remote(h: &Harness, node: NodeId, master: u8) -> ProofRef {
        let proof = funded_proof(&h.chain, master, 0, &[master.wrapping_add(100)]);
        let id = {
            let mut peers = h.processor.peers.write();
            peers
                .submit_proof(proof.clone(), h.chain.as_ref(), 0, RegistrationMode::Default)
                .expect("valid proof")
        };
        assert_eq!(id, proof.proof_id());
        h.processor.connect_node(node, NONCES, None, ConnectionDirection::Inbound, 0);
        let delegation = DelegationBuilder::from_proof(&proof).build();
        let hello = Hello::sign(delegation, &key(master), SessionNonces { local: NONCES.remote, remote: NONCES.local });
        let outcome = h.processor.process_message(node, Message::AvaHello(hello), 0);
        assert!(outcome.violation.is_none());
        proof
    }

    fn answer(poll: &Poll, code: VoteCode, master: u8) -> Message {
        let votes = poll.invs.iter().map(|inv| Vote::new(code, inv.hash)).collect();
        Message::signed_response(Response { round: poll.round, cooldown_ms: 0, votes }, &key(master))
    }

    fn block_item(seed: u8) -> VoteItem {
        VoteItem::Block(BlockHash::from_bytes([seed; 32]))
    }

    #[test]
    fn test_no_poll_without_quorum() {
        let h = harness();
        assert!(h.processor.add_to_reconcile(block_item(1)));
        assert!(h.processor.poll_round(0).is_empty());
    }

    #[test]
    fn test_unanimous_votes_finalize() {
        let mut h = harness();
        let masters: Vec<u8> = (1..=8).collect();
        for m in &masters {
            connect_remote(&h, NodeId(u64::from(*m)), *m);
        }
        let item = block_item(1);
        assert!(h.processor.add_to_reconcile(item));

        let mut now = 1_000;
        for _ in 0..200 {
            if h.processor.is_decided(&item) {
                break;
            }
            for (node, msg) in h.processor.poll_round(now) {
                let Message::AvaPoll(poll) = msg else { panic!("expected poll") };
                let master = node.0 as u8;
                let outcome = h.processor.process_message(node, answer(&poll, VoteCode::Accepted, master), now);
                assert!(outcome.violation.is_none());
            }
            now += 100;
        }
        assert!(h.processor.is_decided(&item));
        assert!(h.processor.is_accepted(&item));
        assert!(!h.processor.add_to_reconcile(item));

        let mut statuses = Vec::new();
        while let Ok(u) = h.updates.try_recv() {
            if u.item == item {
                statuses.push(u.status);
            }
        }
        assert_eq!(statuses, vec![VoteStatus::Finalized]);
    }

    #[test]
    fn test_unknown_round_is_misbehavior() {
        let h = harness();
        connect_remote(&h, NodeId(1), 1);
        let msg = Message::signed_response(Response { round: 99, cooldown_ms: 0, votes: vec![] }, &key(1));
        let outcome = h.processor.process_message(NodeId(1), msg, 0);
        assert_eq!(outcome.violation, Some(ProtocolViolation::UnexpectedResponse { round: 99 }));
        assert!(!outcome.disconnect);
        assert_eq!(h.processor.misbehavior.lock().score(NodeId(1)), 10);
    }

    #[test]
    fn test_bad_response_signature_bans() {
        let h = harness();
        connect_remote(&h, NodeId(1), 1);
        h.processor.add_to_reconcile(block_item(3));
        let polls = h.processor.poll_round(0);
        assert_eq!(polls.len(), 1);
        let Message::AvaPoll(poll) = &polls[0].1 else { panic!("expected poll") };

        let forged = answer(poll, VoteCode::Accepted, 77);
        let outcome = h.processor.process_message(NodeId(1), forged, 10);
        assert_eq!(outcome.violation, Some(ProtocolViolation::InvalidResponseSignature));
        assert!(outcome.disconnect);
        assert!(h.processor.is_banned(NodeId(1)));
    }

    #[test]
    fn test_response_content_must_match_poll() {
        let h = harness();
        connect_remote(&h, NodeId(1), 1);
        h.processor.add_to_reconcile(block_item(3));
        let polls = h.processor.poll_round(0);
        let Message::AvaPoll(poll) = &polls[0].1 else { panic!("expected poll") };

        let wrong = Response {
            round: poll.round,
            cooldown_ms: 0,
            votes: vec![Vote::new(VoteCode::Accepted, Hash256([9; 32]))],
        };
        let outcome = h.processor.process_message(NodeId(1), Message::signed_response(wrong, &key(1)), 10);
        assert_eq!(outcome.violation, Some(ProtocolViolation::InvalidResponseContent));
    }

    #[test]
    fn test_timeout_penalizes_and_frees_inflight() {
        let h = harness();
        connect_remote(&h, NodeId(1), 1);
        h.processor.add_to_reconcile(block_item(3));
        assert_eq!(h.processor.poll_round(0).len(), 1);
        assert_eq!(h.processor.stats().queries, 1);

        let timeout = h.processor.config().query_timeout_ms;
        h.processor.poll_round(timeout);
        let availability = h
            .processor
            .with_peers(|p| p.node(NodeId(1)).map(|n| n.availability.value()));
        assert_eq!(availability, Some(-2));
        assert_eq!(h.processor.stats().queries, 1);
    }

    #[test]
    fn test_answers_polls_with_proof_status() {
        let h = harness();
        let proof = connect_remote(&h, NodeId(1), 1);
        let poll = Poll {
            round: 3,
            invs: vec![Inv::proof(proof.proof_id()), Inv::proof(ProofId::from_bytes([4; 32]))],
        };
        let outcome = h.processor.process_message(NodeId(2), Message::AvaPoll(poll), 0);
        let Some(Message::AvaResponse { response, signature }) = outcome.replies.first() else {
            panic!("expected a response");
        };
        assert_eq!(response.round, 3);
        let codes: Vec<VoteCode> = response.votes.iter().map(|v| v.code).collect();
        assert_eq!(codes, vec![VoteCode::Accepted, VoteCode::Unknown]);
        assert!(key(200).public_key().verify_hash(&response.signing_hash(), signature));
    }

    #[test]
    fn test_oversized_poll_rejected() {
        let h = harness();
        let invs = (0..=h.processor.config().max_element_poll)
            .map(|i| Inv::block(BlockHash::from_bytes([i as u8; 32])))
            .collect();
        let outcome = h.processor.process_message(NodeId(2), Message::AvaPoll(Poll { round: 0, invs }), 0);
        assert!(matches!(outcome.violation, Some(ProtocolViolation::PollTooLarge { .. })));
        assert!(outcome.replies.is_empty());
    }

    #[test]
    fn test_proof_rejected_by_vote_is_demoted() {
        let mut h = harness();
        let masters: Vec<u8> = (1..=8).collect();
        let mut proofs = Vec::new();
        for m in &masters {
            proofs.push(connect_remote(&h, NodeId(u64::from(*m)), *m));
        }
        let target = VoteItem::Proof(proofs[0].proof_id());
        assert!(h.processor.add_to_reconcile(target));

        let mut now = 1_000;
        for _ in 0..50 {
            for (node, msg) in h.processor.poll_round(now) {
                let Message::AvaPoll(poll) = msg else { panic!("expected poll") };
                let votes = poll
                    .invs
                    .iter()
                    .map(|inv| {
                        let code = if VoteItem::from(*inv) == target { VoteCode::Rejected } else { VoteCode::Accepted };
                        Vote::new(code, inv.hash)
                    })
                    .collect();
                let reply = Message::signed_response(Response { round: poll.round, cooldown_ms: 0, votes }, &key(node.0 as u8));
                h.processor.process_message(node, reply, now);
            }
            if !h.processor.with_peers(|p| p.store().is_bound(&proofs[0].proof_id())) {
                break;
            }
            now += 100;
        }
        assert!(h.processor.with_peers(|p| p.store().is_conflicting(&proofs[0].proof_id())));
        let first = std::iter::from_fn(|| h.updates.try_recv().ok()).find(|u| u.item == target);
        assert_eq!(first.map(|u| u.status), Some(VoteStatus::Rejected));
    }

    #[test]
    fn test_getavaproofs_round_trip_between_processors() {
        let a = harness();
        let b = harness();
        for m in 1..=3u8 {
            connect_remote(&a, NodeId(u64::from(m)), m);
        }
        // b's chain must hold the same stakes.
        for m in 1..=3u8 {
            fund(&b.chain, m.wrapping_add(100), 1_000, 1);
        }

        let opening = b.processor.connect_node(NodeId(50), NONCES, None, ConnectionDirection::Outbound, 0);
        assert!(opening.contains(&Message::GetAvaProofs));
        let mut to_a = vec![Message::GetAvaProofs];
        let mut rounds = 0;
        while !to_a.is_empty() && rounds < 4 {
            let mut to_b = Vec::new();
            for msg in to_a.drain(..) {
                to_b.extend(a.processor.process_message(NodeId(50), msg, 0).replies);
            }
            for msg in to_b {
                let outcome = b.processor.process_message(NodeId(50), msg, 0);
                assert!(outcome.violation.is_none(), "{:?}", outcome.violation);
                to_a.extend(outcome.replies);
            }
            rounds += 1;
        }
        assert_eq!(b.processor.counters().proof_count, 3);
        assert_eq!(b.processor.with_peers(|p| p.avaproofs_node_count()), 1);
    }

    #[test]
    fn test_answer_after_proof_unbound_is_accepted() {
        let h = harness();
        let proof = connect_remote(&h, NodeId(1), 1);
        h.processor.add_to_reconcile(block_item(3));
        let polls = h.processor.poll_round(0);
        assert_eq!(polls.len(), 1);
        let Message::AvaPoll(poll) = &polls[0].1 else { panic!("expected poll") };

        // The proof loses its binding while the poll is in flight.
        h.processor
            .peers
            .write()
            .reject_proof(&proof.proof_id(), RejectionMode::Default, h.chain.as_ref(), 5);
        assert!(h.processor.with_peers(|p| p.is_pending(NodeId(1))));

        let outcome = h.processor.process_message(NodeId(1), answer(poll, VoteCode::Accepted, 1), 10);
        assert_eq!(outcome.violation, None);
        assert!(!outcome.disconnect);
        assert!(!h.processor.is_banned(NodeId(1)));
        assert_eq!(h.processor.misbehavior.lock().score(NodeId(1)), 0);
        assert_eq!(h.processor.stats().queries, 0);
    }

    #[test]
    fn test_local_proof_shared_once_inbound_link_exists() {
        let h = harness();
        let proof = funded_proof(&h.chain, 200, 0, &[240]);
        let delegation = DelegationBuilder::from_proof(&proof).build();
        h.processor.set_local_proof(proof.clone(), delegation, 0).expect("local proof");
        let is_hello = |m: &Message| matches!(m, Message::AvaHello(_));

        let opening = h.processor.connect_node(NodeId(1), NONCES, None, ConnectionDirection::Outbound, 0);
        assert!(!opening.iter().any(is_hello));
        assert!(!h.processor.can_share_local_proof());

        let reply = h.processor.process_message(NodeId(1), Message::GetAvaProofs, 0);
        let [Message::AvaProofs(compact)] = reply.replies.as_slice() else { panic!("expected avaproofs") };
        assert_eq!(compact.total_len(), 0);
        assert!(!h.processor.maintenance(0).requests.iter().any(|(_, m)| is_hello(m)));

        let opening = h.processor.connect_node(NodeId(2), NONCES, None, ConnectionDirection::Inbound, 10);
        assert!(opening.iter().any(is_hello));
        assert!(h.processor.can_share_local_proof());

        let delayed = h.processor.take_delayed_hellos();
        assert_eq!(delayed.len(), 1);
        assert_eq!(delayed[0].0, NodeId(1));
        assert!(is_hello(&delayed[0].1));
        assert!(h.processor.take_delayed_hellos().is_empty());

        let reply = h.processor.process_message(NodeId(2), Message::GetAvaProofs, 10);
        let [Message::AvaProofs(compact)] = reply.replies.as_slice() else { panic!("expected avaproofs") };
        assert_eq!(compact.total_len(), 1);
        assert_eq!(compact.prefilled.len(), 1);

        // The latch holds after the inbound link goes away.
        h.processor.disconnect_node(NodeId(2), 20);
        assert!(h.processor.can_share_local_proof());
    }
}
