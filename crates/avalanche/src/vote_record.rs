//! # Vote Record
//!
//! Confidence accumulator for one polled item.
//!
//! ## Window
//!
//! ```text
//! votes    : 1 0 1 1 1 1 1 1   (1 = yes, newest at bit 0)
//! consider : 1 1 1 0 1 1 1 1   (1 = conclusive)
//! ```
//!
//! A round is decisive when `DECISIVE_VOTES` of the last `VOTE_WINDOW`
//! conclusive votes agree. A decisive round in the current direction
//! raises confidence by one; a decisive round the other way flips the
//! direction and resets confidence. The item is final once confidence
//! reaches the finalization score, and never changes afterwards.
//!
//! The node filter remembers the last `VOTE_WINDOW - 1` voters, so a node
//! has at most one vote in any window and every decisive round spans
//! distinct stakeholders.

use ava_proto::VoteCode;

use crate::ids::NodeId;

pub const VOTE_WINDOW: usize = 8;
pub const DECISIVE_VOTES: u32 = 7;
const NODE_FILTER_SIZE: usize = VOTE_WINDOW - 1;

#[derive(Clone, Debug)]
pub struct VoteRecord {
    votes: u8,
    consider: u8,
    accepted: bool,
    confidence: u16,
    finalized: bool,
    successful_votes: u32,
    node_filter: [Option<NodeId>; NODE_FILTER_SIZE],
    filter_index: usize,
    inflight: u8,
}

impl VoteRecord {
    #[must_use]
    pub fn new(accepted: bool) -> Self {
        Self {
            votes: 0,
            consider: 0,
            accepted,
            confidence: 0,
            finalized: false,
            successful_votes: 0,
            node_filter: [None; NODE_FILTER_SIZE],
            filter_index: 0,
            inflight: 0,
        }
    }

    #[must_use]
    #[inline]
    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    #[must_use]
    #[inline]
    pub fn confidence(&self) -> u16 {
        self.confidence
    }

    #[must_use]
    #[inline]
    pub fn has_finalized(&self) -> bool {
        self.finalized
    }

    #[must_use]
    #[inline]
    pub fn successful_votes(&self) -> u32 {
        self.successful_votes
    }

    #[must_use]
    #[inline]
    pub fn inflight(&self) -> u8 {
        self.inflight
    }

    fn add_node_to_filter(&mut self, node: NodeId) -> bool {
        if self.node_filter.contains(&Some(node)) {
            return false;
        }
        self.node_filter[self.filter_index] = Some(node);
        self.filter_index = (self.filter_index + 1) % NODE_FILTER_SIZE;
        true
    }

    /// Register a vote. Returns `true` when the direction flipped or the
    /// record just finalized.
    pub fn register_vote(&mut self, node: NodeId, code: VoteCode, finalization_score: u16) -> bool {
        if self.finalized || !self.add_node_to_filter(node) {
            return false;
        }

        self.votes = (self.votes << 1) | u8::from(code.is_yes());
        self.consider = (self.consider << 1) | u8::from(code.is_conclusive());

        let yes = (self.votes & self.consider).count_ones() >= DECISIVE_VOTES;
        let no = (!self.votes & self.consider).count_ones() >= DECISIVE_VOTES;
        if !yes && !no {
            return false;
        }

        self.successful_votes = self.successful_votes.saturating_add(1);
        if self.accepted == yes {
            self.confidence = self.confidence.saturating_add(1);
            if self.confidence >= finalization_score {
                self.finalized = true;
                return true;
            }
            return false;
        }

        self.accepted = yes;
        self.confidence = 0;
        true
    }

    /// Reserve a poll slot. Fails when `max_inflight` polls are out.
    pub fn register_poll(&mut self, max_inflight: u8) -> bool {
        if self.inflight >= max_inflight {
            return false;
        }
        self.inflight += 1;
        true
    }

    pub fn clear_inflight(&mut self) {
        self.inflight = self.inflight.saturating_sub(1);
    }

    /// Polled for long without converging.
    #[must_use]
    pub fn is_stale(&self, threshold: u32, factor: u32) -> bool {
        self.successful_votes > threshold
            && self.successful_votes > u32::from(self.confidence).saturating_mul(factor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCORE: u16 = 128;

    /// Feed `count` votes from rotating nodes starting at `first_node`.
    fn feed(record: &mut VoteRecord, code: VoteCode, count: u64, first_node: u64) -> Vec<bool> {
        (0..count)
            .map(|i| record.register_vote(NodeId(first_node + i), code, SCORE))
            .collect()
    }

    #[test]
    fn test_needs_seven_conclusive_votes() {
        let mut r = VoteRecord::new(true);
        let changes = feed(&mut r, VoteCode::Accepted, 6, 0);
        assert!(changes.iter().all(|c| !c));
        assert_eq!(r.confidence(), 0);
        feed(&mut r, VoteCode::Accepted, 1, 6);
        assert_eq!(r.confidence(), 1);
        assert!(r.is_accepted());
    }

    #[test]
    fn test_finalizes_at_score() {
        let mut r = VoteRecord::new(true);
        let mut finalized_at = None;
        for i in 0..200u64 {
            if r.register_vote(NodeId(i), VoteCode::Accepted, SCORE) {
                finalized_at = Some(i);
                break;
            }
        }
        assert_eq!(finalized_at, Some(u64::from(SCORE) + 5));
        assert!(r.has_finalized());
        assert!(r.is_accepted());
    }

    #[test]
    fn test_flip_resets_confidence() {
        let mut r = VoteRecord::new(true);
        feed(&mut r, VoteCode::Accepted, 20, 0);
        assert_eq!(r.confidence(), 14);

        let changes = feed(&mut r, VoteCode::Rejected, 7, 100);
        assert_eq!(changes.iter().filter(|c| **c).count(), 1);
        assert!(!r.is_accepted());
        assert_eq!(r.confidence(), 0);
    }

    #[test]
    fn test_single_dissent_does_not_reset() {
        let mut r = VoteRecord::new(true);
        feed(&mut r, VoteCode::Accepted, 10, 0);
        let before = r.confidence();
        feed(&mut r, VoteCode::Rejected, 1, 50);
        assert_eq!(r.confidence(), before + 1);
        assert!(r.is_accepted());
    }

    #[test]
    fn test_inconclusive_votes_count_for_nothing() {
        let mut r = VoteRecord::new(false);
        feed(&mut r, VoteCode::Unknown, 30, 0);
        feed(&mut r, VoteCode::Fork, 30, 100);
        assert_eq!(r.confidence(), 0);
        assert_eq!(r.successful_votes(), 0);
        assert!(!r.is_accepted());
    }

    #[test]
    fn test_node_filter_rejects_repeat_voter() {
        let mut r = VoteRecord::new(true);
        for _ in 0..20 {
            r.register_vote(NodeId(1), VoteCode::Accepted, SCORE);
        }
        assert_eq!(r.confidence(), 0);
        feed(&mut r, VoteCode::Accepted, 6, 2);
        assert_eq!(r.confidence(), 1);
    }

    #[test]
    fn test_finalized_is_monotone() {
        let mut r = VoteRecord::new(true);
        feed(&mut r, VoteCode::Accepted, 200, 0);
        assert!(r.has_finalized());
        let changes = feed(&mut r, VoteCode::Rejected, 100, 1_000);
        assert!(changes.iter().all(|c| !c));
        assert!(r.is_accepted());
        assert!(r.has_finalized());
    }

    #[test]
    fn test_inflight_limit() {
        let mut r = VoteRecord::new(true);
        assert!(r.register_poll(2));
        assert!(r.register_poll(2));
        assert!(!r.register_poll(2));
        r.clear_inflight();
        assert!(r.register_poll(2));
    }

    #[test]
    fn test_stale_detection() {
        let mut r = VoteRecord::new(true);
        assert!(!r.is_stale(0, 2));
        for i in 0..20u64 {
            let code = if (i / 7) % 2 == 0 { VoteCode::Accepted } else { VoteCode::Rejected };
            r.register_vote(NodeId(i), code, SCORE);
        }
        assert_eq!(r.successful_votes(), 4);
        assert_eq!(r.confidence(), 1);
        assert!(r.is_stale(3, 2));
        assert!(!r.is_stale(3, 4));
        assert!(!r.is_stale(u32::MAX, 2));
    }
}
