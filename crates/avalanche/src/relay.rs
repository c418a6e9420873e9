//! # Compact Proof Relay
//!
//! Proof set reconciliation between two avalanche nodes.
//!
//! ```text
//! requester                               responder
//!    │ ── getavaproofs ─────────────────────▶ │  state: backing proofs
//!    │ ◀──────────── avaproofs{sids, pre} ── │
//!    │ ── avaproofsreq{missing indices} ───▶ │
//!    │ ◀─────────────────── avaproof × n ─── │  state dropped
//! ```
//!
//! Both sides keep per-node state that is purged after
//! `avaproofs_timeout`. Every message that does not match outstanding
//! state is a protocol violation.
//!
//! Proofs received during any reconciliation count as known for the
//! next one, so racing links do not fetch the same proof twice.

use std::collections::{HashMap, HashSet};

use ava_common::ProofId;
use ava_proto::{CompactProofs, Message, Proof, ProofRef};
use rand::RngCore;
use tracing::debug;

use crate::error::ProtocolViolation;
use crate::ids::NodeId;

/// What we sent a requester, kept to serve `avaproofsreq`.
struct ResponderState {
    backing: Vec<ProofRef>,
    sent_at_ms: u64,
}

/// Short ids we asked a responder for.
struct RequestedProofs {
    key0: u64,
    key1: u64,
    shortids: HashSet<u64>,
    sent_at_ms: u64,
}

/// Result of a valid `avaproofs`.
#[derive(Debug)]
pub struct ReceivedCompactProofs {
    /// Full proofs carried in the message, to be submitted.
    pub prefilled: Vec<Proof>,
    /// Follow-up `avaproofsreq`, if anything is missing.
    pub request: Option<Message>,
}

pub struct ProofRelay {
    timeout_ms: u64,
    served: HashMap<NodeId, ResponderState>,
    outstanding: HashMap<NodeId, u64>,
    requested: HashMap<NodeId, RequestedProofs>,
    received: HashMap<ProofId, u64>,
}

impl ProofRelay {
    #[must_use]
    pub fn new(timeout_secs: u64) -> Self {
        Self {
            timeout_ms: timeout_secs.saturating_mul(1_000),
            served: HashMap::new(),
            outstanding: HashMap::new(),
            requested: HashMap::new(),
            received: HashMap::new(),
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // requester
    // ────────────────────────────────────────────────────────────────────────

    /// Start a reconciliation with `node`. `None` if one is already running.
    pub fn request_proofs(&mut self, node: NodeId, now_ms: u64) -> Option<Message> {
        if self.outstanding.contains_key(&node) || self.requested.contains_key(&node) {
            return None;
        }
        self.outstanding.insert(node, now_ms);
        Some(Message::GetAvaProofs)
    }

    #[must_use]
    pub fn is_reconciling(&self, node: NodeId) -> bool {
        self.outstanding.contains_key(&node) || self.requested.contains_key(&node)
    }

    /// Handle `avaproofs` from `node`.
    ///
    /// `known` lists the proofs we already hold; ids received by earlier
    /// reconciliations are added to it.
    pub fn on_ava_proofs<'a>(
        &mut self,
        node: NodeId,
        compact: CompactProofs,
        known: impl IntoIterator<Item = &'a ProofId>,
        now_ms: u64,
    ) -> Result<ReceivedCompactProofs, ProtocolViolation> {
        if self.outstanding.remove(&node).is_none() {
            return Err(ProtocolViolation::UnsolicitedAvaProofs);
        }
        compact.validate().map_err(ProtocolViolation::InvalidAvaProofs)?;

        let known: Vec<ProofId> = known.into_iter().copied().chain(self.received.keys().copied()).collect();
        let indices = compact.missing_indices(known.iter());
        let prefilled: Vec<Proof> = compact.prefilled.into_iter().map(|p| p.proof).collect();
        for proof in &prefilled {
            self.received.insert(proof.proof_id(), now_ms);
        }
        debug!(
            "{} sent {} short id(s), {} prefilled, requesting {}",
            node,
            compact.shortids.len(),
            prefilled.len(),
            indices.len()
        );

        if indices.is_empty() {
            return Ok(ReceivedCompactProofs { prefilled, request: None });
        }
        let shortids = indices
            .iter()
            .filter_map(|i| compact.shortids.get(*i as usize).copied())
            .collect();
        self.requested.insert(
            node,
            RequestedProofs { key0: compact.key0, key1: compact.key1, shortids, sent_at_ms: now_ms },
        );
        Ok(ReceivedCompactProofs { prefilled, request: Some(Message::AvaProofsReq(indices)) })
    }

    /// Handle `avaproof` from `node`. Returns `true` when the proof is new
    /// and should be submitted.
    pub fn on_ava_proof(&mut self, node: NodeId, proof: &Proof, now_ms: u64) -> Result<bool, ProtocolViolation> {
        let Some(state) = self.requested.get_mut(&node) else {
            return Err(ProtocolViolation::UnrequestedProof);
        };
        let id = proof.proof_id();
        let sid = ava_proto::short_proof_id(state.key0, state.key1, &id);
        if !state.shortids.remove(&sid) {
            return Err(ProtocolViolation::UnrequestedProof);
        }
        if state.shortids.is_empty() {
            self.requested.remove(&node);
        }
        Ok(self.received.insert(id, now_ms).is_none())
    }

    // ────────────────────────────────────────────────────────────────────────
    // responder
    // ────────────────────────────────────────────────────────────────────────

    /// Answer `getavaproofs`. `prefill` is sent in full.
    pub fn on_get_ava_proofs<R: RngCore>(
        &mut self,
        node: NodeId,
        proofs: Vec<ProofRef>,
        prefill: &HashSet<ProofId>,
        now_ms: u64,
        rng: &mut R,
    ) -> Message {
        let (compact, backing) = CompactProofs::build(proofs, prefill, rng);
        debug!("{} gets {} short id(s), {} prefilled", node, compact.shortids.len(), compact.prefilled.len());
        self.served.insert(node, ResponderState { backing, sent_at_ms: now_ms });
        Message::AvaProofs(compact)
    }

    /// Answer `avaproofsreq` with one `avaproof` per index.
    pub fn on_ava_proofs_req(&mut self, node: NodeId, indices: &[u32]) -> Result<Vec<Message>, ProtocolViolation> {
        let state = self
            .served
            .remove(&node)
            .ok_or(ProtocolViolation::UnsolicitedAvaProofsReq)?;

        let mut seen = HashSet::with_capacity(indices.len());
        let mut replies = Vec::with_capacity(indices.len());
        for index in indices {
            if !seen.insert(*index) {
                return Err(ProtocolViolation::AvaProofsReqDuplicate { index: *index });
            }
            let proof = state
                .backing
                .get(*index as usize)
                .ok_or(ProtocolViolation::AvaProofsReqOutOfRange { index: *index, len: state.backing.len() })?;
            replies.push(Message::AvaProof((**proof).clone()));
        }
        Ok(replies)
    }

    // ────────────────────────────────────────────────────────────────────────
    // housekeeping
    // ────────────────────────────────────────────────────────────────────────

    /// Drop state older than the timeout.
    pub fn purge(&mut self, now_ms: u64) {
        let timeout = self.timeout_ms;
        let live = |at: u64| now_ms.saturating_sub(at) < timeout;
        self.served.retain(|_, s| live(s.sent_at_ms));
        self.outstanding.retain(|_, at| live(*at));
        self.requested.retain(|_, r| live(r.sent_at_ms));
        self.received.retain(|_, at| live(*at));
    }

    pub fn forget(&mut self, node: NodeId) {
        self.served.remove(&node);
        self.outstanding.remove(&node);
        self.requested.remove(&node);
    }

    #[must_use]
    pub fn pending_state_count(&self) -> usize {
        self.served.len() + self.outstanding.len() + self.requested.len()
    }
}
