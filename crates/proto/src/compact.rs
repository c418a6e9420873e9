//! # Compact Proofs
//!
//! Set reconciliation for the known-proof set, in the style of compact
//! blocks. The responder sorts its proofs by id and sends either a 48-bit
//! salted short id or, for a few proofs it expects the requester to lack,
//! the full proof.
//!
//! ```text
//! position:   0      1      2      3      4
//! content:  [sid]  [full] [sid]  [sid]  [full]
//!             │             │      │
//! shortids: [ 0            1      2 ]           ← avaproofsreq indexes this
//! prefilled:        (1,P)                (4,Q)  ← index is the position
//! ```

use std::collections::HashSet;
use std::hash::Hasher;

use ava_common::ProofId;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher24;
use thiserror::Error;

use crate::proof::{Proof, ProofRef};

/// Short ids keep the low 48 bits of the SipHash output.
pub const SHORT_ID_MASK: u64 = 0xffff_ffff_ffff;

#[must_use]
pub fn short_proof_id(key0: u64, key1: u64, proof_id: &ProofId) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(key0, key1);
    hasher.write(proof_id.as_bytes());
    hasher.finish() & SHORT_ID_MASK
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompactProofsError {
    #[error("prefilled index {index} out of range {total}")]
    PrefilledIndexOutOfRange { index: u32, total: usize },

    #[error("prefilled indices are not strictly increasing")]
    PrefilledOutOfOrder,

    #[error("duplicated short id {0:#x}")]
    DuplicateShortId(u64),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefilledProof {
    /// Position in the combined ordering.
    pub index: u32,
    pub proof: Proof,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactProofs {
    pub key0: u64,
    pub key1: u64,
    pub shortids: Vec<u64>,
    pub prefilled: Vec<PrefilledProof>,
}

impl CompactProofs {
    /// Build with random salt.
    ///
    /// Returns the message and the proofs behind `shortids`, in order, so
    /// the responder can serve `avaproofsreq` indices later.
    pub fn build<R: RngCore>(
        proofs: impl IntoIterator<Item = ProofRef>,
        prefill: &HashSet<ProofId>,
        rng: &mut R,
    ) -> (Self, Vec<ProofRef>) {
        let key0 = rng.next_u64();
        let key1 = rng.next_u64();
        Self::build_with_keys(key0, key1, proofs, prefill)
    }

    pub fn build_with_keys(
        key0: u64,
        key1: u64,
        proofs: impl IntoIterator<Item = ProofRef>,
        prefill: &HashSet<ProofId>,
    ) -> (Self, Vec<ProofRef>) {
        let mut sorted: Vec<(ProofId, ProofRef)> =
            proofs.into_iter().map(|p| (p.proof_id(), p)).collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        sorted.dedup_by(|a, b| a.0 == b.0);

        let mut shortids = Vec::with_capacity(sorted.len());
        let mut prefilled = Vec::new();
        let mut backing = Vec::with_capacity(sorted.len());
        for (position, (id, proof)) in sorted.into_iter().enumerate() {
            if prefill.contains(&id) {
                prefilled.push(PrefilledProof {
                    index: position as u32,
                    proof: (*proof).clone(),
                });
            } else {
                shortids.push(short_proof_id(key0, key1, &id));
                backing.push(proof);
            }
        }
        (Self { key0, key1, shortids, prefilled }, backing)
    }

    /// Number of proofs described, short ids and prefilled together.
    #[must_use]
    #[inline]
    pub fn total_len(&self) -> usize {
        self.shortids.len() + self.prefilled.len()
    }

    #[must_use]
    pub fn short_id(&self, proof_id: &ProofId) -> u64 {
        short_proof_id(self.key0, self.key1, proof_id)
    }

    /// Structural checks run by the requester before acting on the message.
    pub fn validate(&self) -> Result<(), CompactProofsError> {
        let total = self.total_len();
        let mut last: Option<u32> = None;
        for p in &self.prefilled {
            if p.index as usize >= total {
                return Err(CompactProofsError::PrefilledIndexOutOfRange { index: p.index, total });
            }
            if last.is_some_and(|l| p.index <= l) {
                return Err(CompactProofsError::PrefilledOutOfOrder);
            }
            last = Some(p.index);
        }
        let mut seen = HashSet::with_capacity(self.shortids.len());
        for sid in &self.shortids {
            if !seen.insert(*sid) {
                return Err(CompactProofsError::DuplicateShortId(*sid));
            }
        }
        Ok(())
    }

    /// Indices into `shortids` that none of `known` resolves.
    #[must_use]
    pub fn missing_indices<'a>(&self, known: impl IntoIterator<Item = &'a ProofId>) -> Vec<u32> {
        let resolved: HashSet<u64> = known.into_iter().map(|id| self.short_id(id)).collect();
        self.shortids
            .iter()
            .enumerate()
            .filter(|(_, sid)| !resolved.contains(sid))
            .map(|(i, _)| i as u32)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proof::ProofBuilder;
    use ava_common::{OutPoint, Script, SecretKey, TxId, COIN};
    use std::sync::Arc;

    fn proof(seed: u8) -> ProofRef {
        let master = SecretKey::from_bytes(&[seed; 32]);
        let mut b = ProofBuilder::new(0, 0, master, Script::pay_to_pubkey_hash(&[seed; 20]));
        b.add_utxo(
            OutPoint::new(TxId::from_bytes([seed; 32]), 0),
            100 * COIN,
            1,
            false,
            &SecretKey::from_bytes(&[seed.wrapping_add(100); 32]),
        )
        .expect("add");
        Arc::new(b.build())
    }

    #[test]
    fn test_short_id_masked_and_salted() {
        let id = proof(1).proof_id();
        let a = short_proof_id(1, 2, &id);
        assert_eq!(a & !SHORT_ID_MASK, 0);
        assert_ne!(a, short_proof_id(3, 4, &id));
    }

    #[test]
    fn test_layout_sorted_with_prefilled_positions() {
        let proofs: Vec<ProofRef> = (1..=5).map(proof).collect();
        let mut ids: Vec<ProofId> = proofs.iter().map(|p| p.proof_id()).collect();
        ids.sort();
        let prefill: HashSet<ProofId> = [ids[1]].into_iter().collect();

        let (msg, backing) = CompactProofs::build_with_keys(7, 8, proofs, &prefill);
        assert_eq!(msg.total_len(), 5);
        assert_eq!(msg.prefilled.len(), 1);
        assert_eq!(msg.prefilled[0].index, 1);
        assert_eq!(backing.len(), 4);
        let backing_ids: Vec<ProofId> = backing.iter().map(|p| p.proof_id()).collect();
        assert_eq!(backing_ids, vec![ids[0], ids[2], ids[3], ids[4]]);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prefilled() {
        let (mut msg, _) = CompactProofs::build_with_keys(1, 1, vec![proof(1)], &HashSet::new());
        msg.prefilled.push(PrefilledProof { index: 5, proof: (*proof(2)).clone() });
        assert!(matches!(
            msg.validate(),
            Err(CompactProofsError::PrefilledIndexOutOfRange { index: 5, total: 2 })
        ));
    }

    #[test]
    fn test_validate_rejects_duplicate_short_ids() {
        let msg = CompactProofs { key0: 0, key1: 0, shortids: vec![9, 9], prefilled: vec![] };
        assert_eq!(msg.validate(), Err(CompactProofsError::DuplicateShortId(9)));
    }

    #[test]
    fn test_missing_indices_skip_known() {
        let proofs: Vec<ProofRef> = (1..=4).map(proof).collect();
        let (msg, backing) = CompactProofs::build_with_keys(5, 6, proofs, &HashSet::new());
        let known = [backing[0].proof_id(), backing[2].proof_id()];
        assert_eq!(msg.missing_indices(known.iter()), vec![1, 3]);
    }
}
