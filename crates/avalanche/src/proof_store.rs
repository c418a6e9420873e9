//! # Proof Store
//!
//! Owns every stake proof this node knows about and tracks its lifecycle.
//!
//! ## Pools
//!
//! ```text
//!               submit
//!                 │
//!     ┌───────────┼──────────────┬─────────────────┐
//!     ▼           ▼              ▼                 ▼
//!  immature     valid  ◀──▶  conflicting     evicted-dangling
//!  (orphan)   (bound to       (waits for      (no node for
//!     │        a peer)         the stakes)     dangling_timeout)
//!     └─ matured ─▶┘
//! ```
//!
//! A UTXO is claimed by at most one valid proof. Every operation that
//! changes the valid pool returns a [`StoreUpdate`] so the peer registry
//! can create or drop the matching peers.
//!
//! ## Conflict Cooldown
//!
//! Each valid proof carries a `CooldownPeriod` opened at registration.
//! A conflicting proof arriving inside that window is refused with
//! `CooldownNotElapsed`; one arriving after it re-arms the window. This
//! allows at most one conflicting transition per stake per window.

use std::collections::{HashMap, HashSet};

use ava_chain::ChainValidator;
use ava_common::{Amount, AvalancheConfig, CooldownPeriod, OutPoint, ProofId, Script};
use ava_proto::ProofRef;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ProofError;
use crate::proof_pool::{is_preferred, AddStatus, ProofPool};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegistrationMode {
    Default,
    /// Voting accepted the proof: evict whatever holds its stakes.
    ForceAccept,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectionMode {
    /// Demote to the conflicting pool.
    Default,
    /// Forget the proof and refuse it from now on.
    Invalidate,
}

/// Changes to the valid pool.
#[derive(Clone, Debug, Default)]
pub struct StoreUpdate {
    pub bound: Vec<ProofRef>,
    pub unbound: Vec<ProofId>,
}

impl StoreUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bound.is_empty() && self.unbound.is_empty()
    }

    fn merge(&mut self, other: StoreUpdate) {
        self.bound.extend(other.bound);
        self.unbound.extend(other.unbound);
    }
}

/// Aggregate counters for the observability surface.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ProofCounters {
    pub proof_count: usize,
    pub connected_proof_count: usize,
    pub dangling_proof_count: usize,
    pub conflicting_proof_count: usize,
    pub orphan_proof_count: usize,
    pub finalized_proof_count: usize,
    pub total_stake: Amount,
    pub connected_stake: Amount,
    pub dangling_stake: Amount,
    pub conflicting_stake: Amount,
    pub immature_stake: Amount,
}

#[derive(Clone, Debug)]
struct StoreParams {
    dust_threshold: Amount,
    min_proof_stake: Amount,
    confirmations: u32,
    cooldown_secs: u64,
    enable_replacement: bool,
    max_immature: usize,
}

pub struct ProofStore {
    params: StoreParams,
    valid: ProofPool,
    conflicting: ProofPool,
    immature: ProofPool,
    dangling: ProofPool,
    cooldowns: HashMap<ProofId, CooldownPeriod>,
    finalized: HashSet<ProofId>,
    invalid: HashSet<ProofId>,
}

/// Unix seconds as the signed timestamp proofs expire at.
fn as_proof_time(now_secs: u64) -> i64 {
    i64::try_from(now_secs).unwrap_or(i64::MAX)
}

enum UtxoState {
    Mature,
    Immature(OutPoint),
}

impl ProofStore {
    #[must_use]
    pub fn new(config: &AvalancheConfig) -> Self {
        Self {
            params: StoreParams {
                dust_threshold: config.stake_utxo_dust_threshold,
                min_proof_stake: config.min_proof_stake,
                confirmations: config.stake_utxo_confirmations,
                cooldown_secs: config.conflicting_proof_cooldown_secs,
                enable_replacement: config.enable_proof_replacement,
                max_immature: config.max_immature_proofs,
            },
            valid: ProofPool::new(),
            conflicting: ProofPool::new(),
            immature: ProofPool::new(),
            dangling: ProofPool::new(),
            cooldowns: HashMap::new(),
            finalized: HashSet::new(),
            invalid: HashSet::new(),
        }
    }

    // ════════════════════════════════════════════════════════════════════════════
    // QUERIES
    // ════════════════════════════════════════════════════════════════════════════

    #[must_use]
    pub fn get(&self, id: &ProofId) -> Option<ProofRef> {
        self.valid
            .get(id)
            .or_else(|| self.conflicting.get(id))
            .or_else(|| self.immature.get(id))
            .or_else(|| self.dangling.get(id))
    }

    /// Bound to a peer.
    #[must_use]
    pub fn is_bound(&self, id: &ProofId) -> bool {
        self.valid.contains(id)
    }

    #[must_use]
    pub fn is_conflicting(&self, id: &ProofId) -> bool {
        self.conflicting.contains(id)
    }

    #[must_use]
    pub fn is_immature(&self, id: &ProofId) -> bool {
        self.immature.contains(id)
    }

    #[must_use]
    pub fn is_dangling(&self, id: &ProofId) -> bool {
        self.dangling.contains(id)
    }

    #[must_use]
    pub fn is_invalid(&self, id: &ProofId) -> bool {
        self.invalid.contains(id)
    }

    #[must_use]
    pub fn is_finalized(&self, id: &ProofId) -> bool {
        self.finalized.contains(id)
    }

    #[must_use]
    pub fn bound_proofs(&self) -> Vec<ProofRef> {
        self.valid.iter().cloned().collect()
    }

    #[must_use]
    pub fn conflicting_proofs(&self) -> Vec<ProofRef> {
        self.conflicting.iter().cloned().collect()
    }

    #[must_use]
    pub fn registration_time(&self, id: &ProofId) -> Option<u64> {
        self.valid.added_at(id)
    }

    /// Valid proof currently holding `utxo`.
    #[must_use]
    pub fn holder_of(&self, utxo: &OutPoint) -> Option<ProofRef> {
        self.valid.by_utxo(utxo)
    }

    // ════════════════════════════════════════════════════════════════════════════
    // SUBMISSION
    // ════════════════════════════════════════════════════════════════════════════

    /// Validate and register a proof.
    ///
    /// `Immature` and `Conflicting` errors mean the proof was kept in a side
    /// pool. Any bound proof appears in `update`.
    pub fn submit(
        &mut self,
        proof: ProofRef,
        chain: &dyn ChainValidator,
        now_secs: u64,
        mode: RegistrationMode,
        update: &mut StoreUpdate,
    ) -> Result<ProofId, ProofError> {
        let id = proof.proof_id();
        if self.invalid.contains(&id) {
            return Err(ProofError::Invalidated);
        }
        let forced = mode == RegistrationMode::ForceAccept && self.conflicting.contains(&id);
        if self.valid.contains(&id) || (self.conflicting.contains(&id) && !forced) || self.immature.contains(&id) {
            return Err(ProofError::AlreadyRegistered(id));
        }

        proof.verify_at(self.params.dust_threshold, as_proof_time(now_secs))?;
        let staked = proof.staked_amount();
        if staked < self.params.min_proof_stake {
            return Err(ProofError::InsufficientStake {
                required: self.params.min_proof_stake,
                actual: staked,
            });
        }

        let utxos = self.check_utxos(&proof, chain)?;
        // A forced proof leaves the conflicting pool only once it is known good.
        if forced {
            self.conflicting.remove(&id);
        }
        if let UtxoState::Immature(utxo) = utxos {
            self.dangling.remove(&id);
            self.add_immature(proof, now_secs);
            return Err(ProofError::Immature(utxo));
        }

        self.dangling.remove(&id);
        let conflicts = self.valid.conflicts(&proof);
        if conflicts.is_empty() {
            self.bind(proof, now_secs, update);
            return Ok(id);
        }

        if mode == RegistrationMode::ForceAccept {
            self.replace(proof, &conflicts, now_secs, update);
            return Ok(id);
        }

        for current in &conflicts {
            let cooldown = self.cooldown_of(current, now_secs);
            if cooldown.is_active(now_secs) {
                return Err(ProofError::CooldownNotElapsed {
                    remaining_secs: cooldown.remaining_secs(now_secs),
                });
            }
        }
        for current in &conflicts {
            let mut cooldown = self.cooldown_of(current, now_secs);
            cooldown.extend_from(now_secs);
            self.cooldowns.insert(current.proof_id(), cooldown);
        }

        if self.params.enable_replacement && conflicts.iter().all(|c| is_preferred(&proof, c)) {
            self.replace(proof, &conflicts, now_secs, update);
            return Ok(id);
        }

        match self.conflicting.add_if_preferred(proof, now_secs) {
            (AddStatus::Succeed, evicted) => {
                for p in evicted {
                    debug!("conflicting proof {} displaced by {}", p.proof_id(), id);
                }
                Err(ProofError::Conflicting)
            }
            (AddStatus::Duplicated, _) => Err(ProofError::AlreadyRegistered(id)),
            (AddStatus::Rejected, _) => Err(ProofError::Rejected),
        }
    }

    fn cooldown_of(&self, proof: &ProofRef, now_secs: u64) -> CooldownPeriod {
        let id = proof.proof_id();
        self.cooldowns.get(&id).copied().unwrap_or_else(|| {
            CooldownPeriod::new(self.valid.added_at(&id).unwrap_or(now_secs), self.params.cooldown_secs)
        })
    }

    fn check_utxos(&self, proof: &ProofRef, chain: &dyn ChainValidator) -> Result<UtxoState, ProofError> {
        let tip_height = chain.tip_height();
        let mut state = UtxoState::Mature;
        for signed in &proof.stakes {
            let stake = &signed.stake;
            let coin = chain
                .utxo(&stake.utxo)
                .ok_or(ProofError::MissingUtxo(stake.utxo))?;
            if coin.out.amount != stake.amount
                || coin.height != stake.height
                || coin.is_coinbase != stake.is_coinbase
                || coin.out.script != Script::pay_to_pubkey(&stake.pubkey)
            {
                return Err(ProofError::UtxoMismatch(stake.utxo));
            }
            let matures_at = coin.height.saturating_add(self.params.confirmations);
            if matures_at > tip_height.saturating_add(1) && matches!(state, UtxoState::Mature) {
                state = UtxoState::Immature(stake.utxo);
            }
        }
        Ok(state)
    }

    fn bind(&mut self, proof: ProofRef, now_secs: u64, update: &mut StoreUpdate) {
        let id = proof.proof_id();
        self.valid.add_if_no_conflict(proof.clone(), now_secs);
        self.cooldowns
            .insert(id, CooldownPeriod::new(now_secs, self.params.cooldown_secs));
        info!("proof {} registered, stake {}", id, proof.staked_amount());
        update.bound.push(proof);
    }

    fn replace(&mut self, proof: ProofRef, conflicts: &[ProofRef], now_secs: u64, update: &mut StoreUpdate) {
        for loser in conflicts {
            let loser_id = loser.proof_id();
            if let Some(removed) = self.valid.remove(&loser_id) {
                self.cooldowns.remove(&loser_id);
                update.unbound.push(loser_id);
                self.conflicting.force_add(removed, now_secs);
                info!("proof {} replaced by {}", loser_id, proof.proof_id());
            }
        }
        self.conflicting.remove(&proof.proof_id());
        self.bind(proof, now_secs, update);
    }

    fn add_immature(&mut self, proof: ProofRef, now_secs: u64) {
        let id = proof.proof_id();
        let (status, _) = self.immature.add_if_preferred(proof, now_secs);
        if status != AddStatus::Succeed {
            return;
        }
        debug!("proof {} kept as orphan", id);
        while self.immature.len() > self.params.max_immature {
            match self.immature.lowest_score() {
                Some(p) => {
                    debug!("orphan pool full, dropping {}", p.proof_id());
                    self.immature.remove(&p.proof_id());
                }
                None => break,
            }
        }
    }

    // ════════════════════════════════════════════════════════════════════════════
    // LIFECYCLE
    // ════════════════════════════════════════════════════════════════════════════

    /// Drop a proof from the valid or conflicting pool.
    ///
    /// Conflicting proofs that wanted the freed stakes get another
    /// registration attempt. Returns `false` when the proof was unknown.
    pub fn reject_proof(
        &mut self,
        id: &ProofId,
        mode: RejectionMode,
        chain: &dyn ChainValidator,
        now_secs: u64,
        update: &mut StoreUpdate,
    ) -> bool {
        let removed = match self.valid.remove(id) {
            Some(proof) => {
                self.cooldowns.remove(id);
                self.finalized.remove(id);
                update.unbound.push(*id);
                Some(proof)
            }
            None => self.conflicting.remove(id).or_else(|| self.immature.remove(id)),
        };
        if mode == RejectionMode::Invalidate {
            self.dangling.remove(id);
            self.invalid.insert(*id);
        }
        let Some(proof) = removed else {
            return mode == RejectionMode::Invalidate;
        };
        info!("proof {} rejected ({:?})", id, mode);

        let mut waiting: Vec<ProofRef> = Vec::new();
        for utxo in proof.utxos() {
            if let Some(p) = self.conflicting.by_utxo(utxo) {
                self.conflicting.remove(&p.proof_id());
                waiting.push(p);
            }
        }
        for p in waiting {
            if let Err(e) = self.submit(p.clone(), chain, now_secs, RegistrationMode::Default, update) {
                debug!("conflicting proof {} not pulled back: {}", p.proof_id(), e);
            }
        }

        if mode == RejectionMode::Default {
            self.conflicting.add_if_preferred(proof, now_secs);
        }
        true
    }

    /// Record a finalized proof. Only bound proofs can be finalized.
    pub fn mark_finalized(&mut self, id: &ProofId) -> bool {
        if !self.valid.contains(id) {
            return false;
        }
        self.finalized.insert(*id)
    }

    /// Retry registration of an orphan whose stakes may have matured.
    pub fn mark_orphan_matured(
        &mut self,
        id: &ProofId,
        chain: &dyn ChainValidator,
        now_secs: u64,
        update: &mut StoreUpdate,
    ) -> Result<ProofId, ProofError> {
        let proof = self.immature.remove(id).ok_or(ProofError::NotOrphan(*id))?;
        self.submit(proof, chain, now_secs, RegistrationMode::Default, update)
    }

    /// Move a bound proof without nodes to the evicted-dangling pool.
    pub fn evict_dangling(&mut self, id: &ProofId, now_secs: u64, update: &mut StoreUpdate) -> bool {
        let Some(proof) = self.valid.remove(id) else {
            return false;
        };
        self.cooldowns.remove(id);
        self.finalized.remove(id);
        update.unbound.push(*id);
        self.dangling.force_add(proof, now_secs);
        info!("proof {} evicted as dangling", id);
        true
    }

    /// Register a dangling proof again because a node presented it.
    pub fn rescue_dangling(
        &mut self,
        id: &ProofId,
        chain: &dyn ChainValidator,
        now_secs: u64,
        update: &mut StoreUpdate,
    ) -> Result<ProofId, ProofError> {
        let proof = self.dangling.remove(id).ok_or(ProofError::EvictedDangling)?;
        self.submit(proof, chain, now_secs, RegistrationMode::Default, update)
    }

    /// Re-check every proof against a new chain tip.
    ///
    /// Expired or spent proofs are dropped, proofs whose stakes became
    /// immature go back to the orphan pool, and matured orphans register.
    pub fn updated_block_tip(&mut self, chain: &dyn ChainValidator, now_secs: u64) -> StoreUpdate {
        let mut update = StoreUpdate::default();
        let now = as_proof_time(now_secs);

        for proof in self.valid.iter().cloned().collect::<Vec<_>>() {
            let id = proof.proof_id();
            let outcome = if proof.is_expired(now) {
                Err(ProofError::Expired { expiration: proof.expiration_time })
            } else {
                self.check_utxos(&proof, chain)
            };
            match outcome {
                Ok(UtxoState::Mature) => {}
                Ok(UtxoState::Immature(_)) => {
                    self.valid.remove(&id);
                    self.cooldowns.remove(&id);
                    update.unbound.push(id);
                    self.add_immature(proof, now_secs);
                }
                Err(e) => {
                    debug!("proof {} dropped on tip update: {}", id, e);
                    self.valid.remove(&id);
                    self.cooldowns.remove(&id);
                    self.finalized.remove(&id);
                    update.unbound.push(id);
                }
            }
        }

        for pool in [&mut self.conflicting, &mut self.dangling] {
            let expired: Vec<ProofId> = pool
                .iter()
                .filter(|p| p.is_expired(now))
                .map(|p| p.proof_id())
                .collect();
            for id in expired {
                pool.remove(&id);
            }
        }

        for id in self.immature.ids() {
            let mut retry = StoreUpdate::default();
            match self.mark_orphan_matured(&id, chain, now_secs, &mut retry) {
                Ok(_) => debug!("orphan {} matured", id),
                Err(ProofError::Immature(_)) => {}
                Err(e) => debug!("orphan {} not registered: {}", id, e),
            }
            update.merge(retry);
        }
        update
    }

    // ════════════════════════════════════════════════════════════════════════════
    // COUNTERS
    // ════════════════════════════════════════════════════════════════════════════

    /// Counters, with connectivity supplied by the peer registry.
    pub fn counters(&self, is_connected: impl Fn(&ProofId) -> bool) -> ProofCounters {
        let mut c = ProofCounters {
            proof_count: self.valid.len(),
            conflicting_proof_count: self.conflicting.len(),
            orphan_proof_count: self.immature.len(),
            finalized_proof_count: self.finalized.len(),
            total_stake: self.valid.total_stake(),
            conflicting_stake: self.conflicting.total_stake(),
            immature_stake: self.immature.total_stake(),
            ..ProofCounters::default()
        };
        for proof in self.valid.iter() {
            let amount = proof.staked_amount();
            if is_connected(&proof.proof_id()) {
                c.connected_proof_count += 1;
                c.connected_stake = c.connected_stake.saturating_add(amount);
            } else {
                c.dangling_proof_count += 1;
                c.dangling_stake = c.dangling_stake.saturating_add(amount);
            }
        }
        c
    }
}
