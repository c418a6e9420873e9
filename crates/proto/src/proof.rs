//! # Stake Proofs
//!
//! A proof pledges a set of UTXOs to a master key. The master key (or a
//! session key it delegates to) then speaks for that stake on the
//! avalanche network.
//!
//! ## Identifiers
//!
//! | Id | Preimage |
//! |----|----------|
//! | `limited_proof_id` | `sequence ‖ expiration ‖ payout_script ‖ stakes` |
//! | `proof_id` | `limited_proof_id ‖ master_pubkey` |
//!
//! ## Stateless Checks (`verify`)
//!
//! | Check | Error |
//! |-------|-------|
//! | at least one stake | `NoStake` |
//! | at most `MAX_PROOF_STAKES` stakes | `TooManyStakes` |
//! | standard payout script | `InvalidPayoutScript` |
//! | every stake ≥ dust threshold | `DustThreshold` |
//! | stakes strictly ordered by stake id | `WrongStakeOrdering` |
//! | no UTXO pledged twice | `DuplicateStake` |
//! | every stake signature | `InvalidStakeSignature` |
//! | master signature over `limited_proof_id` | `InvalidProofSignature` |
//! | not expired at `now` | `Expired` |
//!
//! Checks against the UTXO set live with the proof store, which has
//! access to the chain.

use std::collections::HashSet;
use std::sync::Arc;

use ava_common::{
    Amount, Hash256, HashWriter, LimitedProofId, OutPoint, ProofId, PublicKey, Script, SecretKey,
    Signature,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stake::{stake_commitment, SignedStake, Stake};

// ════════════════════════════════════════════════════════════════════════════════
// CONSTANTS
// ════════════════════════════════════════════════════════════════════════════════

/// Maximum number of stakes in a single proof.
pub const MAX_PROOF_STAKES: usize = 1000;

/// Amount per unit of score.
pub const PROOF_SCORE_DIVISOR: Amount = 1_000_000;

/// Shared, immutable proof handle.
pub type ProofRef = Arc<Proof>;

// ════════════════════════════════════════════════════════════════════════════════
// ERRORS
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofValidationError {
    #[error("proof has no stake")]
    NoStake,

    #[error("too many stakes: {count} > {max}")]
    TooManyStakes { count: usize, max: usize },

    #[error("payout script is not standard")]
    InvalidPayoutScript,

    #[error("stake amount {amount} below dust threshold {threshold}")]
    DustThreshold { amount: Amount, threshold: Amount },

    #[error("stakes are not ordered by stake id")]
    WrongStakeOrdering,

    #[error("utxo {0} is staked twice")]
    DuplicateStake(OutPoint),

    #[error("invalid signature for stake #{index}")]
    InvalidStakeSignature { index: usize },

    #[error("invalid master signature")]
    InvalidProofSignature,

    #[error("proof expired at {expiration}, now {now}")]
    Expired { expiration: i64, now: i64 },
}

impl ProofValidationError {
    /// Signature failures, as opposed to structural ones.
    #[must_use]
    pub fn is_signature_error(&self) -> bool {
        matches!(
            self,
            ProofValidationError::InvalidStakeSignature { .. }
                | ProofValidationError::InvalidProofSignature
        )
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// PROOF
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Proof {
    /// Higher sequence supersedes lower ones from the same master.
    pub sequence: u64,
    /// Unix seconds, `0` means no expiration.
    pub expiration_time: i64,
    pub master_pubkey: PublicKey,
    pub stakes: Vec<SignedStake>,
    pub payout_script: Script,
    /// Master signature over `limited_proof_id`.
    pub signature: Signature,
}

/// `H(limited_proof_id ‖ master)`, shared with delegations.
#[must_use]
pub fn compute_proof_id(limited: &LimitedProofId, master: &PublicKey) -> ProofId {
    let mut w = HashWriter::new();
    w.write(limited.as_bytes()).write_var_bytes(master.as_bytes());
    ProofId::from(w.finalize())
}

fn compute_limited_proof_id(
    sequence: u64,
    expiration_time: i64,
    payout_script: &Script,
    stakes: &[SignedStake],
) -> LimitedProofId {
    let mut w = HashWriter::new();
    w.write_u64(sequence)
        .write_i64(expiration_time)
        .write_var_bytes(payout_script.as_bytes())
        .write_compact_size(stakes.len() as u64);
    for s in stakes {
        s.stake.write_to(&mut w);
    }
    LimitedProofId::from(w.finalize())
}

impl Proof {
    #[must_use]
    pub fn limited_proof_id(&self) -> LimitedProofId {
        compute_limited_proof_id(
            self.sequence,
            self.expiration_time,
            &self.payout_script,
            &self.stakes,
        )
    }

    #[must_use]
    pub fn proof_id(&self) -> ProofId {
        compute_proof_id(&self.limited_proof_id(), &self.master_pubkey)
    }

    #[must_use]
    pub fn stake_commitment(&self) -> Hash256 {
        stake_commitment(self.expiration_time, &self.master_pubkey)
    }

    #[must_use]
    pub fn staked_amount(&self) -> Amount {
        self.stakes
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(s.stake.amount))
    }

    /// Selection weight derived from the staked amount.
    #[must_use]
    pub fn score(&self) -> u32 {
        let units = self.staked_amount() / PROOF_SCORE_DIVISOR;
        u32::try_from(units).unwrap_or(u32::MAX)
    }

    #[must_use]
    #[inline]
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_time > 0 && now >= self.expiration_time
    }

    pub fn utxos(&self) -> impl Iterator<Item = &OutPoint> + '_ {
        self.stakes.iter().map(|s| &s.stake.utxo)
    }

    /// Stateless checks, expiration excluded.
    pub fn verify(&self, dust_threshold: Amount) -> Result<(), ProofValidationError> {
        if self.stakes.is_empty() {
            return Err(ProofValidationError::NoStake);
        }
        if self.stakes.len() > MAX_PROOF_STAKES {
            return Err(ProofValidationError::TooManyStakes {
                count: self.stakes.len(),
                max: MAX_PROOF_STAKES,
            });
        }
        if !self.payout_script.is_standard() {
            return Err(ProofValidationError::InvalidPayoutScript);
        }

        let commitment = self.stake_commitment();
        let mut seen = HashSet::with_capacity(self.stakes.len());
        let mut prev_id = None;
        for (index, signed) in self.stakes.iter().enumerate() {
            let stake = &signed.stake;
            if stake.amount < dust_threshold {
                return Err(ProofValidationError::DustThreshold {
                    amount: stake.amount,
                    threshold: dust_threshold,
                });
            }
            let id = stake.stake_id();
            if prev_id.is_some_and(|prev| id <= prev) {
                return Err(ProofValidationError::WrongStakeOrdering);
            }
            prev_id = Some(id);
            if !seen.insert(stake.utxo) {
                return Err(ProofValidationError::DuplicateStake(stake.utxo));
            }
            if !signed.verify(&commitment) {
                return Err(ProofValidationError::InvalidStakeSignature { index });
            }
        }

        let limited = self.limited_proof_id();
        if !self.master_pubkey.verify_hash(limited.as_hash(), &self.signature) {
            return Err(ProofValidationError::InvalidProofSignature);
        }
        Ok(())
    }

    /// Stateless checks plus expiration at `now`.
    pub fn verify_at(&self, dust_threshold: Amount, now: i64) -> Result<(), ProofValidationError> {
        self.verify(dust_threshold)?;
        if self.is_expired(now) {
            return Err(ProofValidationError::Expired {
                expiration: self.expiration_time,
                now,
            });
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// BUILDER
// ════════════════════════════════════════════════════════════════════════════════

/// Assembles and signs a proof.
///
/// Stakes are signed as they are added and sorted by stake id in `build`.
pub struct ProofBuilder {
    sequence: u64,
    expiration_time: i64,
    master: SecretKey,
    payout_script: Script,
    stakes: Vec<SignedStake>,
}

impl ProofBuilder {
    #[must_use]
    pub fn new(sequence: u64, expiration_time: i64, master: SecretKey, payout_script: Script) -> Self {
        Self {
            sequence,
            expiration_time,
            master,
            payout_script,
            stakes: Vec::new(),
        }
    }

    /// Pledge `utxo`, signed by `key`.
    pub fn add_utxo(
        &mut self,
        utxo: OutPoint,
        amount: Amount,
        height: u32,
        is_coinbase: bool,
        key: &SecretKey,
    ) -> Result<&mut Self, ProofValidationError> {
        if self.stakes.iter().any(|s| s.stake.utxo == utxo) {
            return Err(ProofValidationError::DuplicateStake(utxo));
        }
        let stake = Stake {
            utxo,
            amount,
            height,
            is_coinbase,
            pubkey: key.public_key(),
        };
        let commitment = stake_commitment(self.expiration_time, &self.master.public_key());
        self.stakes.push(SignedStake::sign(stake, key, &commitment));
        Ok(self)
    }

    #[must_use]
    pub fn build(mut self) -> Proof {
        self.stakes.sort_by_key(|s| s.stake_id());
        let limited = compute_limited_proof_id(
            self.sequence,
            self.expiration_time,
            &self.payout_script,
            &self.stakes,
        );
        let signature = self.master.sign_hash(limited.as_hash());
        Proof {
            sequence: self.sequence,
            expiration_time: self.expiration_time,
            master_pubkey: self.master.public_key(),
            stakes: self.stakes,
            payout_script: self.payout_script,
            signature,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ava_common::{TxId, COIN};

    const DUST: Amount = 100 * COIN;

    fn key(seed: u8) -> SecretKey {
        SecretKey::from_bytes(&[seed; 32])
    }

    fn outpoint(seed: u8, vout: u32) -> OutPoint {
        OutPoint::new(TxId::from_bytes([seed; 32]), vout)
    }

    fn payout() -> Script {
        Script::pay_to_pubkey_hash(&[0x42; 20])
    }

    fn proof_with_stakes(n: u8) -> Proof {
        let mut b = ProofBuilder::new(1, 0, key(1), payout());
        for i in 0..n {
            b.add_utxo(outpoint(10 + i, 0), 1_000 * COIN, 50, false, &key(2))
                .expect("add");
        }
        b.build()
    }

    #[test]
    fn test_valid_proof_verifies() {
        let p = proof_with_stakes(3);
        assert_eq!(p.verify(DUST), Ok(()));
        assert_eq!(p.staked_amount(), 3_000 * COIN);
        assert_eq!(p.score(), (3_000 * COIN / PROOF_SCORE_DIVISOR) as u32);
    }

    #[test]
    fn test_ids_depend_on_master() {
        let a = ProofBuilder::new(1, 0, key(1), payout()).build();
        let b = ProofBuilder::new(1, 0, key(9), payout()).build();
        assert_eq!(a.limited_proof_id(), b.limited_proof_id());
        assert_ne!(a.proof_id(), b.proof_id());
    }

    #[test]
    fn test_no_stake_rejected() {
        let p = ProofBuilder::new(1, 0, key(1), payout()).build();
        assert_eq!(p.verify(DUST), Err(ProofValidationError::NoStake));
    }

    #[test]
    fn test_altered_stake_signature_rejected() {
        let mut p = proof_with_stakes(3);
        p.stakes[1].signature.0[0] ^= 0xff;
        let err = p.verify(DUST).unwrap_err();
        assert_eq!(err, ProofValidationError::InvalidStakeSignature { index: 1 });
        assert!(err.is_signature_error());
    }

    #[test]
    fn test_altered_master_signature_rejected() {
        let mut p = proof_with_stakes(1);
        p.signature.0[5] ^= 0x01;
        assert_eq!(p.verify(DUST), Err(ProofValidationError::InvalidProofSignature));
    }

    #[test]
    fn test_tampered_amount_breaks_signature() {
        let mut p = proof_with_stakes(1);
        p.stakes[0].stake.amount += 1;
        assert!(p.verify(DUST).unwrap_err().is_signature_error());
    }

    #[test]
    fn test_dust_rejected() {
        let mut b = ProofBuilder::new(1, 0, key(1), payout());
        b.add_utxo(outpoint(1, 0), DUST - 1, 50, false, &key(2)).expect("add");
        assert_eq!(
            b.build().verify(DUST),
            Err(ProofValidationError::DustThreshold { amount: DUST - 1, threshold: DUST })
        );
    }

    #[test]
    fn test_duplicate_utxo_rejected_by_builder() {
        let mut b = ProofBuilder::new(1, 0, key(1), payout());
        b.add_utxo(outpoint(1, 0), DUST, 50, false, &key(2)).expect("add");
        assert!(matches!(
            b.add_utxo(outpoint(1, 0), DUST, 50, false, &key(3)),
            Err(ProofValidationError::DuplicateStake(_))
        ));
    }

    #[test]
    fn test_wrong_ordering_rejected() {
        let mut p = proof_with_stakes(2);
        p.stakes.swap(0, 1);
        assert_eq!(p.verify(DUST), Err(ProofValidationError::WrongStakeOrdering));
    }

    #[test]
    fn test_non_standard_payout_rejected() {
        let mut b = ProofBuilder::new(1, 0, key(1), Script::new(vec![0x01, 0x02]));
        b.add_utxo(outpoint(1, 0), DUST, 50, false, &key(2)).expect("add");
        assert_eq!(b.build().verify(DUST), Err(ProofValidationError::InvalidPayoutScript));
    }

    #[test]
    fn test_expiration() {
        let mut b = ProofBuilder::new(1, 1_000, key(1), payout());
        b.add_utxo(outpoint(1, 0), DUST, 50, false, &key(2)).expect("add");
        let p = b.build();
        assert!(p.verify_at(DUST, 999).is_ok());
        assert_eq!(
            p.verify_at(DUST, 1_000),
            Err(ProofValidationError::Expired { expiration: 1_000, now: 1_000 })
        );
    }
}
