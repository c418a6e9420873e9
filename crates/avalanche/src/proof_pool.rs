//! # Proof Pool
//!
//! A set of proofs indexed by `ProofId` and by every staked `OutPoint`.
//! Within one pool a UTXO is claimed by at most one proof; the proof store
//! keeps one pool per lifecycle state.
//!
//! ## Preference
//!
//! | Case | Winner |
//! |------|--------|
//! | same master key | higher `sequence` |
//! | different master | higher score |
//! | equal score | lower `proof_id` |

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use ava_common::{Amount, OutPoint, ProofId};
use ava_proto::ProofRef;

/// Outcome of a pool insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddStatus {
    Succeed,
    Duplicated,
    /// Conflicts with at least one proof that is preferred or kept.
    Rejected,
}

/// `true` when `candidate` should replace `current`.
#[must_use]
pub fn is_preferred(candidate: &ProofRef, current: &ProofRef) -> bool {
    compare_preference(candidate, current) == Ordering::Greater
}

fn compare_preference(a: &ProofRef, b: &ProofRef) -> Ordering {
    if a.master_pubkey == b.master_pubkey {
        return a.sequence.cmp(&b.sequence);
    }
    a.score()
        .cmp(&b.score())
        .then_with(|| b.proof_id().cmp(&a.proof_id()))
}

struct PoolEntry {
    proof: ProofRef,
    added_at: u64,
}

#[derive(Default)]
pub struct ProofPool {
    by_id: HashMap<ProofId, PoolEntry>,
    by_utxo: HashMap<OutPoint, ProofId>,
}

impl ProofPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &ProofId) -> bool {
        self.by_id.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &ProofId) -> Option<ProofRef> {
        self.by_id.get(id).map(|e| e.proof.clone())
    }

    /// Time at which the proof entered this pool.
    #[must_use]
    pub fn added_at(&self, id: &ProofId) -> Option<u64> {
        self.by_id.get(id).map(|e| e.added_at)
    }

    #[must_use]
    pub fn by_utxo(&self, utxo: &OutPoint) -> Option<ProofRef> {
        self.by_utxo.get(utxo).and_then(|id| self.get(id))
    }

    /// Distinct proofs claiming any UTXO of `proof`, itself excluded.
    #[must_use]
    pub fn conflicts(&self, proof: &ProofRef) -> Vec<ProofRef> {
        let own = proof.proof_id();
        let ids: BTreeSet<ProofId> = proof
            .utxos()
            .filter_map(|u| self.by_utxo.get(u).copied())
            .filter(|id| *id != own)
            .collect();
        ids.into_iter().filter_map(|id| self.get(&id)).collect()
    }

    fn insert(&mut self, proof: ProofRef, now: u64) {
        let id = proof.proof_id();
        for utxo in proof.utxos() {
            self.by_utxo.insert(*utxo, id);
        }
        self.by_id.insert(id, PoolEntry { proof, added_at: now });
    }

    pub fn add_if_no_conflict(&mut self, proof: ProofRef, now: u64) -> AddStatus {
        if self.contains(&proof.proof_id()) {
            return AddStatus::Duplicated;
        }
        if !self.conflicts(&proof).is_empty() {
            return AddStatus::Rejected;
        }
        self.insert(proof, now);
        AddStatus::Succeed
    }

    /// Insert if preferred over every conflicting proof, evicting them.
    pub fn add_if_preferred(&mut self, proof: ProofRef, now: u64) -> (AddStatus, Vec<ProofRef>) {
        if self.contains(&proof.proof_id()) {
            return (AddStatus::Duplicated, Vec::new());
        }
        let conflicts = self.conflicts(&proof);
        if conflicts.iter().any(|c| !is_preferred(&proof, c)) {
            return (AddStatus::Rejected, Vec::new());
        }
        let evicted = self.evict_all(&conflicts);
        self.insert(proof, now);
        (AddStatus::Succeed, evicted)
    }

    /// Insert unconditionally, evicting whatever conflicts.
    pub fn force_add(&mut self, proof: ProofRef, now: u64) -> Vec<ProofRef> {
        let conflicts = self.conflicts(&proof);
        let evicted = self.evict_all(&conflicts);
        if !self.contains(&proof.proof_id()) {
            self.insert(proof, now);
        }
        evicted
    }

    fn evict_all(&mut self, proofs: &[ProofRef]) -> Vec<ProofRef> {
        proofs
            .iter()
            .filter_map(|p| self.remove(&p.proof_id()))
            .collect()
    }

    pub fn remove(&mut self, id: &ProofId) -> Option<ProofRef> {
        let entry = self.by_id.remove(id)?;
        for utxo in entry.proof.utxos() {
            if self.by_utxo.get(utxo) == Some(id) {
                self.by_utxo.remove(utxo);
            }
        }
        Some(entry.proof)
    }

    /// Least preferred proof, the eviction candidate of a bounded pool.
    #[must_use]
    pub fn lowest_score(&self) -> Option<ProofRef> {
        self.by_id
            .values()
            .map(|e| &e.proof)
            .min_by(|a, b| compare_preference(a, b))
            .cloned()
    }

    #[must_use]
    pub fn total_stake(&self) -> Amount {
        self.by_id
            .values()
            .fold(0u64, |acc, e| acc.saturating_add(e.proof.staked_amount()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProofRef> + '_ {
        self.by_id.values().map(|e| &e.proof)
    }

    /// Proof ids in ascending order.
    #[must_use]
    pub fn ids(&self) -> Vec<ProofId> {
        let mut ids: Vec<ProofId> = self.by_id.keys().copied().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ava_common::{Script, SecretKey, TxId, COIN};
    use ava_proto::ProofBuilder;
    use std::sync::Arc;

    fn utxo(seed: u8) -> OutPoint {
        OutPoint::new(TxId::from_bytes([seed; 32]), 0)
    }

    fn proof(master: u8, sequence: u64, utxos: &[(u8, u64)]) -> ProofRef {
        let mut b = ProofBuilder::new(
            sequence,
            0,
            SecretKey::from_bytes(&[master; 32]),
            Script::pay_to_pubkey_hash(&[master; 20]),
        );
        for (seed, coins) in utxos {
            b.add_utxo(utxo(*seed), coins * COIN, 10, false, &SecretKey::from_bytes(&[*seed; 32]))
                .expect("add utxo");
        }
        Arc::new(b.build())
    }

    #[test]
    fn test_same_master_prefers_sequence() {
        let old = proof(1, 1, &[(10, 100)]);
        let new = proof(1, 2, &[(10, 100)]);
        assert!(is_preferred(&new, &old));
        assert!(!is_preferred(&old, &new));
    }

    #[test]
    fn test_different_master_prefers_score() {
        let small = proof(1, 9, &[(10, 100)]);
        let big = proof(2, 0, &[(10, 100), (11, 100)]);
        assert!(is_preferred(&big, &small));
    }

    #[test]
    fn test_equal_score_prefers_lower_id() {
        let a = proof(1, 0, &[(10, 100)]);
        let b = proof(2, 0, &[(10, 100)]);
        let (low, high) = if a.proof_id() < b.proof_id() { (a, b) } else { (b, a) };
        assert!(is_preferred(&low, &high));
    }

    #[test]
    fn test_add_if_no_conflict() {
        let mut pool = ProofPool::new();
        let a = proof(1, 0, &[(10, 100)]);
        let b = proof(2, 0, &[(10, 100), (11, 100)]);
        assert_eq!(pool.add_if_no_conflict(a.clone(), 0), AddStatus::Succeed);
        assert_eq!(pool.add_if_no_conflict(a.clone(), 0), AddStatus::Duplicated);
        assert_eq!(pool.add_if_no_conflict(b, 0), AddStatus::Rejected);
        assert_eq!(pool.by_utxo(&utxo(10)).map(|p| p.proof_id()), Some(a.proof_id()));
        assert!(pool.by_utxo(&utxo(11)).is_none());
    }

    #[test]
    fn test_add_if_preferred_evicts() {
        let mut pool = ProofPool::new();
        let a = proof(1, 0, &[(10, 100)]);
        let c = proof(3, 0, &[(12, 100)]);
        let b = proof(2, 0, &[(10, 100), (12, 100), (13, 100)]);
        pool.add_if_no_conflict(a.clone(), 0);
        pool.add_if_no_conflict(c.clone(), 0);

        let (status, evicted) = pool.add_if_preferred(b.clone(), 5);
        assert_eq!(status, AddStatus::Succeed);
        let mut evicted_ids: Vec<ProofId> = evicted.iter().map(|p| p.proof_id()).collect();
        evicted_ids.sort();
        let mut expected = vec![a.proof_id(), c.proof_id()];
        expected.sort();
        assert_eq!(evicted_ids, expected);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.added_at(&b.proof_id()), Some(5));

        let (status, _) = pool.add_if_preferred(a, 6);
        assert_eq!(status, AddStatus::Rejected);
    }

    #[test]
    fn test_remove_releases_utxos() {
        let mut pool = ProofPool::new();
        let a = proof(1, 0, &[(10, 100), (11, 100)]);
        pool.add_if_no_conflict(a.clone(), 0);
        assert_eq!(pool.total_stake(), 200 * COIN);
        assert!(pool.remove(&a.proof_id()).is_some());
        assert!(pool.by_utxo(&utxo(10)).is_none());
        assert!(pool.is_empty());
        assert!(pool.remove(&a.proof_id()).is_none());
    }

    #[test]
    fn test_lowest_score() {
        let mut pool = ProofPool::new();
        let small = proof(1, 0, &[(10, 100)]);
        let big = proof(2, 0, &[(11, 300)]);
        pool.add_if_no_conflict(small.clone(), 0);
        pool.add_if_no_conflict(big, 0);
        assert_eq!(pool.lowest_score().map(|p| p.proof_id()), Some(small.proof_id()));
    }
}
