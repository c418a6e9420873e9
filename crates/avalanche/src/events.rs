//! Voted items, their status updates, and the oracle that answers for
//! blocks and transactions.
//!
//! Every update leaves the voting engine on one ordered channel, so the
//! finality worker sees block updates in the order they happened.

use std::fmt;

use ava_common::{BlockHash, Hash256, ProofId, TxId};
use ava_proto::{Inv, InvKind, VoteCode};
use serde::Serialize;
use tokio::sync::mpsc;

/// An item under vote. Ordering is poll priority: blocks, then
/// transactions, then proofs.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum VoteItem {
    Block(BlockHash),
    Tx(TxId),
    Proof(ProofId),
}

impl VoteItem {
    #[must_use]
    pub fn kind(&self) -> InvKind {
        match self {
            VoteItem::Block(_) => InvKind::Block,
            VoteItem::Tx(_) => InvKind::Tx,
            VoteItem::Proof(_) => InvKind::Proof,
        }
    }

    #[must_use]
    pub fn hash(&self) -> Hash256 {
        match self {
            VoteItem::Block(h) => h.0,
            VoteItem::Tx(h) => h.0,
            VoteItem::Proof(h) => h.0,
        }
    }

    #[must_use]
    pub fn inv(&self) -> Inv {
        Inv { kind: self.kind(), hash: self.hash() }
    }
}

impl From<Inv> for VoteItem {
    fn from(inv: Inv) -> Self {
        match inv.kind {
            InvKind::Block => VoteItem::Block(BlockHash(inv.hash)),
            InvKind::Tx => VoteItem::Tx(TxId(inv.hash)),
            InvKind::Proof => VoteItem::Proof(ProofId(inv.hash)),
        }
    }
}

impl fmt::Display for VoteItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteItem::Block(h) => write!(f, "block {}", h),
            VoteItem::Tx(h) => write!(f, "tx {}", h),
            VoteItem::Proof(h) => write!(f, "proof {}", h),
        }
    }
}

impl fmt::Debug for VoteItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum VoteStatus {
    /// Direction changed to accepted, not final.
    Accepted,
    /// Direction changed to rejected, not final.
    Rejected,
    Finalized,
    /// Finalized as rejected.
    Invalid,
    /// Dropped without converging.
    Stale,
}

impl VoteStatus {
    #[must_use]
    pub fn is_final(self) -> bool {
        matches!(self, VoteStatus::Finalized | VoteStatus::Invalid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VoteUpdate {
    pub item: VoteItem,
    pub status: VoteStatus,
}

pub type UpdateSender = mpsc::UnboundedSender<VoteUpdate>;
pub type UpdateReceiver = mpsc::UnboundedReceiver<VoteUpdate>;

#[must_use]
pub fn update_channel() -> (UpdateSender, UpdateReceiver) {
    mpsc::unbounded_channel()
}

/// Local view of blocks and transactions, supplied by finality
/// integration. Proof items are answered by the voting engine itself.
pub trait ItemOracle: Send + Sync {
    /// Whether the item still needs votes.
    fn is_worth_polling(&self, item: &VoteItem) -> bool;

    /// Initial direction of a new vote record.
    fn local_acceptance(&self, item: &VoteItem) -> bool;

    /// Our answer when a peer polls us.
    fn local_vote(&self, item: &VoteItem) -> VoteCode;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut items = vec![
            VoteItem::Proof(ProofId::from_bytes([0; 32])),
            VoteItem::Tx(TxId::from_bytes([9; 32])),
            VoteItem::Block(BlockHash::from_bytes([5; 32])),
        ];
        items.sort();
        assert!(matches!(items[0], VoteItem::Block(_)));
        assert!(matches!(items[2], VoteItem::Proof(_)));
    }

    #[test]
    fn test_inv_conversion() {
        let item = VoteItem::Tx(TxId::from_bytes([3; 32]));
        assert_eq!(VoteItem::from(item.inv()), item);
        assert_eq!(item.inv().kind, InvKind::Tx);
    }
}
