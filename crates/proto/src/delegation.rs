//! Delegation chains.
//!
//! A delegation lets the proof master hand its voting rights to a session
//! key without exposing the master key to the network:
//!
//! ```text
//! h0 = proof_id
//! h1 = H(h0 ‖ pk1)   signed by master
//! h2 = H(h1 ‖ pk2)   signed by pk1
//! ...
//! delegation_id = h_n, delegated key = pk_n (or master if n == 0)
//! ```

use ava_common::{DelegationId, Hash256, HashWriter, LimitedProofId, ProofId, PublicKey, SecretKey, Signature};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proof::{compute_proof_id, Proof};

/// Maximum chain length.
pub const MAX_DELEGATION_LEVELS: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DelegationError {
    #[error("too many delegation levels: {count} > {max}")]
    TooManyLevels { count: usize, max: usize },

    #[error("invalid signature at delegation level {level}")]
    InvalidSignature { level: usize },

    #[error("signer is not the current delegated key")]
    WrongSigner,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationLevel {
    pub pubkey: PublicKey,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    pub limited_proof_id: LimitedProofId,
    pub proof_master: PublicKey,
    pub levels: Vec<DelegationLevel>,
}

fn level_hash(prev: &Hash256, pubkey: &PublicKey) -> Hash256 {
    let mut w = HashWriter::new();
    w.write_hash(prev).write_var_bytes(pubkey.as_bytes());
    w.finalize()
}

impl Delegation {
    #[must_use]
    pub fn proof_id(&self) -> ProofId {
        compute_proof_id(&self.limited_proof_id, &self.proof_master)
    }

    #[must_use]
    pub fn delegation_id(&self) -> DelegationId {
        let start = *self.proof_id().as_hash();
        let folded = self
            .levels
            .iter()
            .fold(start, |h, level| level_hash(&h, &level.pubkey));
        DelegationId::from(folded)
    }

    /// The key currently allowed to speak for the proof.
    #[must_use]
    pub fn delegated_pubkey(&self) -> PublicKey {
        self.levels
            .last()
            .map_or(self.proof_master, |level| level.pubkey)
    }

    /// Walk the chain from the master key. Returns the delegated key.
    pub fn verify(&self) -> Result<PublicKey, DelegationError> {
        if self.levels.len() > MAX_DELEGATION_LEVELS {
            return Err(DelegationError::TooManyLevels {
                count: self.levels.len(),
                max: MAX_DELEGATION_LEVELS,
            });
        }
        let mut hash = *self.proof_id().as_hash();
        let mut signer = self.proof_master;
        for (level, entry) in self.levels.iter().enumerate() {
            hash = level_hash(&hash, &entry.pubkey);
            if !signer.verify_hash(&hash, &entry.signature) {
                return Err(DelegationError::InvalidSignature { level });
            }
            signer = entry.pubkey;
        }
        Ok(signer)
    }
}

/// Builds a delegation one level at a time.
pub struct DelegationBuilder {
    limited_proof_id: LimitedProofId,
    proof_master: PublicKey,
    levels: Vec<DelegationLevel>,
    hash: Hash256,
}

impl DelegationBuilder {
    #[must_use]
    pub fn new(limited_proof_id: LimitedProofId, proof_master: PublicKey) -> Self {
        let hash = *compute_proof_id(&limited_proof_id, &proof_master).as_hash();
        Self {
            limited_proof_id,
            proof_master,
            levels: Vec::new(),
            hash,
        }
    }

    #[must_use]
    pub fn from_proof(proof: &Proof) -> Self {
        Self::new(proof.limited_proof_id(), proof.master_pubkey)
    }

    /// Extend the chain to `delegated`, signed by the current delegated key.
    pub fn add_level(
        &mut self,
        signer: &SecretKey,
        delegated: PublicKey,
    ) -> Result<&mut Self, DelegationError> {
        let current = self
            .levels
            .last()
            .map_or(self.proof_master, |level| level.pubkey);
        if signer.public_key() != current {
            return Err(DelegationError::WrongSigner);
        }
        if self.levels.len() >= MAX_DELEGATION_LEVELS {
            return Err(DelegationError::TooManyLevels {
                count: self.levels.len() + 1,
                max: MAX_DELEGATION_LEVELS,
            });
        }
        self.hash = level_hash(&self.hash, &delegated);
        self.levels.push(DelegationLevel {
            pubkey: delegated,
            signature: signer.sign_hash(&self.hash),
        });
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> Delegation {
        Delegation {
            limited_proof_id: self.limited_proof_id,
            proof_master: self.proof_master,
            levels: self.levels,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(seed: u8) -> SecretKey {
        SecretKey::from_bytes(&[seed; 32])
    }

    fn limited() -> LimitedProofId {
        LimitedProofId::from_bytes([0x11; 32])
    }

    #[test]
    fn test_empty_delegation_is_master() {
        let master = key(1);
        let d = DelegationBuilder::new(limited(), master.public_key()).build();
        assert_eq!(d.verify(), Ok(master.public_key()));
        assert_eq!(*d.delegation_id().as_hash(), *d.proof_id().as_hash());
    }

    #[test]
    fn test_multi_level_chain() {
        let master = key(1);
        let (k1, k2) = (key(2), key(3));
        let mut b = DelegationBuilder::new(limited(), master.public_key());
        b.add_level(&master, k1.public_key()).expect("level 0");
        b.add_level(&k1, k2.public_key()).expect("level 1");
        let d = b.build();
        assert_eq!(d.verify(), Ok(k2.public_key()));
        assert_eq!(d.delegated_pubkey(), k2.public_key());
    }

    #[test]
    fn test_wrong_signer_refused() {
        let master = key(1);
        let mut b = DelegationBuilder::new(limited(), master.public_key());
        assert!(matches!(
            b.add_level(&key(7), key(2).public_key()),
            Err(DelegationError::WrongSigner)
        ));
    }

    #[test]
    fn test_broken_level_detected() {
        let master = key(1);
        let (k1, k2) = (key(2), key(3));
        let mut b = DelegationBuilder::new(limited(), master.public_key());
        b.add_level(&master, k1.public_key()).expect("level 0");
        b.add_level(&k1, k2.public_key()).expect("level 1");
        let mut d = b.build();
        d.levels[1].signature.0[3] ^= 0x10;
        assert_eq!(d.verify(), Err(DelegationError::InvalidSignature { level: 1 }));
    }

    #[test]
    fn test_rebinding_to_other_master_fails() {
        let master = key(1);
        let k1 = key(2);
        let mut b = DelegationBuilder::new(limited(), master.public_key());
        b.add_level(&master, k1.public_key()).expect("level 0");
        let mut d = b.build();
        d.proof_master = key(9).public_key();
        assert_eq!(d.verify(), Err(DelegationError::InvalidSignature { level: 0 }));
    }

    #[test]
    fn test_level_cap() {
        let mut keys = vec![key(1)];
        let mut b = DelegationBuilder::new(limited(), keys[0].public_key());
        for i in 0..MAX_DELEGATION_LEVELS {
            let next = key(i as u8 + 2);
            b.add_level(&keys[i], next.public_key()).expect("level");
            keys.push(next);
        }
        assert!(matches!(
            b.add_level(&keys[MAX_DELEGATION_LEVELS], key(200).public_key()),
            Err(DelegationError::TooManyLevels { .. })
        ));
        assert!(b.build().verify().is_ok());
    }
}
