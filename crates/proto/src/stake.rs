//! Stakes: UTXOs locked into a proof.
//!
//! A stake signature is produced by the UTXO owner key over
//! `H(commitment || stake)`, where the commitment binds the proof
//! expiration and master key. Moving a signed stake into another proof
//! (different master or expiration) breaks its signature.

use ava_common::{Amount, Hash256, HashWriter, OutPoint, PublicKey, SecretKey, Signature, StakeId};
use serde::{Deserialize, Serialize};

/// An unspent output pledged as stake.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Stake {
    pub utxo: OutPoint,
    pub amount: Amount,
    /// Height of the block that created the UTXO.
    pub height: u32,
    pub is_coinbase: bool,
    /// Key controlling the UTXO.
    pub pubkey: PublicKey,
}

impl Stake {
    /// Height in the upper 31 bits, coinbase flag in bit 0.
    #[must_use]
    #[inline]
    pub fn height_and_coinbase(&self) -> u32 {
        (self.height << 1) | u32::from(self.is_coinbase)
    }

    pub(crate) fn write_to(&self, w: &mut HashWriter) {
        w.write(self.utxo.txid.as_bytes())
            .write_u32(self.utxo.vout)
            .write_u64(self.amount)
            .write_u32(self.height_and_coinbase())
            .write_var_bytes(self.pubkey.as_bytes());
    }

    #[must_use]
    pub fn stake_id(&self) -> StakeId {
        let mut w = HashWriter::new();
        self.write_to(&mut w);
        StakeId::from(w.finalize())
    }

    /// Message signed by the stake key.
    #[must_use]
    pub fn signing_hash(&self, commitment: &Hash256) -> Hash256 {
        let mut w = HashWriter::new();
        w.write_hash(commitment);
        self.write_to(&mut w);
        w.finalize()
    }
}

/// Commitment binding a stake signature to one proof master and expiration.
#[must_use]
pub fn stake_commitment(expiration_time: i64, master: &PublicKey) -> Hash256 {
    let mut w = HashWriter::new();
    w.write_i64(expiration_time).write_var_bytes(master.as_bytes());
    w.finalize()
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignedStake {
    pub stake: Stake,
    pub signature: Signature,
}

impl SignedStake {
    #[must_use]
    pub fn sign(stake: Stake, key: &SecretKey, commitment: &Hash256) -> Self {
        let signature = key.sign_hash(&stake.signing_hash(commitment));
        Self { stake, signature }
    }

    #[must_use]
    pub fn verify(&self, commitment: &Hash256) -> bool {
        self.stake
            .pubkey
            .verify_hash(&self.stake.signing_hash(commitment), &self.signature)
    }

    #[must_use]
    #[inline]
    pub fn stake_id(&self) -> StakeId {
        self.stake.stake_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ava_common::{TxId, COIN};

    fn stake(key: &SecretKey) -> Stake {
        Stake {
            utxo: OutPoint::new(TxId::from_bytes([1; 32]), 0),
            amount: 1_000 * COIN,
            height: 100,
            is_coinbase: true,
            pubkey: key.public_key(),
        }
    }

    #[test]
    fn test_height_and_coinbase_packing() {
        let key = SecretKey::from_bytes(&[1; 32]);
        let mut s = stake(&key);
        assert_eq!(s.height_and_coinbase(), 201);
        s.is_coinbase = false;
        assert_eq!(s.height_and_coinbase(), 200);
    }

    #[test]
    fn test_signature_bound_to_commitment() {
        let key = SecretKey::from_bytes(&[1; 32]);
        let master = SecretKey::from_bytes(&[2; 32]).public_key();
        let other_master = SecretKey::from_bytes(&[3; 32]).public_key();

        let commitment = stake_commitment(0, &master);
        let signed = SignedStake::sign(stake(&key), &key, &commitment);
        assert!(signed.verify(&commitment));
        assert!(!signed.verify(&stake_commitment(0, &other_master)));
        assert!(!signed.verify(&stake_commitment(1, &master)));
    }
}
