//! Inventory items and vote codes.

use ava_common::{BlockHash, Hash256, ProofId, TxId};
use serde::{Deserialize, Serialize};

/// Kind of item being voted on. Ordering is poll priority.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
    Proof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Inv {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl Inv {
    #[must_use]
    pub fn block(hash: BlockHash) -> Self {
        Self { kind: InvKind::Block, hash: hash.into() }
    }

    #[must_use]
    pub fn tx(txid: TxId) -> Self {
        Self { kind: InvKind::Tx, hash: txid.into() }
    }

    #[must_use]
    pub fn proof(proof_id: ProofId) -> Self {
        Self { kind: InvKind::Proof, hash: proof_id.into() }
    }
}

/// A peer's answer about one item.
///
/// | Code | Meaning | Counts as |
/// |------|---------|-----------|
/// | `Accepted` | valid and preferred | yes |
/// | `Rejected` | consensus invalid | no |
/// | `Parked` | valid but refused by policy | no |
/// | `Invalid` | proof-specific hard reject | no |
/// | `Fork` | known, not on the peer's chain | inconclusive |
/// | `Unknown` | not yet known to the peer | inconclusive |
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteCode {
    Accepted,
    Rejected,
    Parked,
    Fork,
    Unknown,
    Invalid,
}

impl VoteCode {
    #[must_use]
    #[inline]
    pub fn is_yes(self) -> bool {
        matches!(self, VoteCode::Accepted)
    }

    /// Whether the vote counts toward either direction.
    #[must_use]
    #[inline]
    pub fn is_conclusive(self) -> bool {
        match self {
            VoteCode::Accepted | VoteCode::Rejected | VoteCode::Parked | VoteCode::Invalid => true,
            VoteCode::Fork | VoteCode::Unknown => false,
        }
    }

    /// Numeric code used in logs.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            VoteCode::Accepted => 0,
            VoteCode::Rejected => 1,
            VoteCode::Parked => 2,
            VoteCode::Fork => 3,
            VoteCode::Invalid => 4,
            VoteCode::Unknown => -1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub code: VoteCode,
    pub hash: Hash256,
}

impl Vote {
    #[must_use]
    pub fn new(code: VoteCode, hash: Hash256) -> Self {
        Self { code, hash }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_priority_order() {
        let mut invs = vec![
            Inv::proof(ProofId::from_bytes([1; 32])),
            Inv::tx(TxId::from_bytes([1; 32])),
            Inv::block(BlockHash::from_bytes([1; 32])),
        ];
        invs.sort_by_key(|i| i.kind);
        assert_eq!(
            invs.iter().map(|i| i.kind).collect::<Vec<_>>(),
            vec![InvKind::Block, InvKind::Tx, InvKind::Proof]
        );
    }

    #[test]
    fn test_vote_classification() {
        assert!(VoteCode::Accepted.is_yes());
        for code in [VoteCode::Rejected, VoteCode::Parked, VoteCode::Invalid] {
            assert!(!code.is_yes());
            assert!(code.is_conclusive());
        }
        for code in [VoteCode::Fork, VoteCode::Unknown] {
            assert!(!code.is_conclusive());
        }
    }
}
