//! Per-node misbehavior accounting.
//!
//! Every `ProtocolViolation` adds its `ban_score()` to the sender. A node
//! reaching the threshold is banned: the caller disconnects it and refuses
//! to register it again.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::error::ProtocolViolation;
use crate::ids::NodeId;

pub struct MisbehaviorTracker {
    threshold: u32,
    scores: HashMap<NodeId, u32>,
    banned: HashSet<NodeId>,
}

impl MisbehaviorTracker {
    #[must_use]
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            scores: HashMap::new(),
            banned: HashSet::new(),
        }
    }

    /// Record a violation. Returns `true` when the node just got banned.
    pub fn record(&mut self, node: NodeId, violation: &ProtocolViolation) -> bool {
        if self.banned.contains(&node) {
            return false;
        }
        let score = self.scores.entry(node).or_insert(0);
        *score = score.saturating_add(violation.ban_score());
        warn!("{} misbehaving (+{} -> {}): {}", node, violation.ban_score(), score, violation);
        if *score >= self.threshold {
            warn!("{} banned", node);
            self.banned.insert(node);
            return true;
        }
        false
    }

    #[must_use]
    pub fn score(&self, node: NodeId) -> u32 {
        self.scores.get(&node).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn is_banned(&self, node: NodeId) -> bool {
        self.banned.contains(&node)
    }

    /// Forget the score of a disconnected node. Bans are kept.
    pub fn forget(&mut self, node: NodeId) {
        self.scores.remove(&node);
    }
}
