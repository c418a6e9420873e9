//! # Avalanche Address Discovery Limits
//!
//! `getavaaddr` is rate limited in both directions.
//!
//! - Incoming: a node is answered at most once per interval.
//! - Outgoing: one discovery round per interval. A round that brought no
//!   new node doubles the interval, up to `MAX_BACKOFF_FACTOR` times.

use std::collections::HashMap;

use crate::ids::NodeId;

const MAX_BACKOFF_FACTOR: u64 = 8;

pub struct AddrRequestLimiter {
    interval_secs: u64,
    last_served: HashMap<NodeId, u64>,
    last_request: Option<u64>,
    backoff_factor: u64,
}

impl AddrRequestLimiter {
    #[must_use]
    pub fn new(interval_secs: u64) -> Self {
        Self {
            interval_secs,
            last_served: HashMap::new(),
            last_request: None,
            backoff_factor: 1,
        }
    }

    /// Whether to answer `node` now. Records the answer when allowed.
    pub fn allow_incoming(&mut self, node: NodeId, now: u64) -> bool {
        if let Some(&last) = self.last_served.get(&node) {
            if now.saturating_sub(last) < self.interval_secs {
                return false;
            }
        }
        self.last_served.insert(node, now);
        true
    }

    #[must_use]
    pub fn current_interval(&self) -> u64 {
        self.interval_secs.saturating_mul(self.backoff_factor)
    }

    #[must_use]
    pub fn should_request(&self, now: u64) -> bool {
        match self.last_request {
            Some(last) => now.saturating_sub(last) >= self.current_interval(),
            None => true,
        }
    }

    pub fn record_request(&mut self, now: u64) {
        self.last_request = Some(now);
    }

    /// Feed back whether the last round discovered new nodes.
    pub fn record_outcome(&mut self, found_new: bool) {
        self.backoff_factor = if found_new {
            1
        } else {
            (self.backoff_factor * 2).min(MAX_BACKOFF_FACTOR)
        };
    }

    /// Drop per-node entries older than twice the interval.
    pub fn cleanup(&mut self, now: u64) {
        let keep = self.interval_secs.saturating_mul(2);
        self.last_served
            .retain(|_, last| now.saturating_sub(*last) < keep);
    }
}
