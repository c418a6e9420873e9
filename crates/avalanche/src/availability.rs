//! # Node Availability
//!
//! Rolling score of how useful a node's poll answers are.
//!
//! | Event | Delta |
//! |-------|-------|
//! | timely response with a conclusive vote | +1 |
//! | timely response, only `Unknown`/`Fork` | 0 |
//! | query timeout | -2 |
//!
//! The score is bounded to `[-AVAILABILITY_BOUND, AVAILABILITY_BOUND]` so a
//! long good history cannot hide a node that stopped answering.

use serde::Serialize;

pub const AVAILABILITY_BOUND: i32 = 100;
const RESPONSE_REWARD: i32 = 1;
const TIMEOUT_PENALTY: i32 = 2;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct AvailabilityScore(i32);

impl AvailabilityScore {
    #[must_use]
    #[inline]
    pub const fn value(self) -> i32 {
        self.0
    }

    fn adjust(&mut self, delta: i32) {
        self.0 = self
            .0
            .saturating_add(delta)
            .clamp(-AVAILABILITY_BOUND, AVAILABILITY_BOUND);
    }

    pub fn on_response(&mut self, conclusive: bool) {
        if conclusive {
            self.adjust(RESPONSE_REWARD);
        }
    }

    pub fn on_timeout(&mut self) {
        self.adjust(-TIMEOUT_PENALTY);
    }

    /// Nodes at or below the floor are polled last.
    #[must_use]
    #[inline]
    pub fn is_above(self, floor: i32) -> bool {
        self.0 > floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas() {
        let mut s = AvailabilityScore::default();
        s.on_response(true);
        s.on_response(false);
        assert_eq!(s.value(), 1);
        s.on_timeout();
        assert_eq!(s.value(), -1);
        assert!(s.is_above(-10));
    }

    #[test]
    fn test_bounded() {
        let mut s = AvailabilityScore::default();
        for _ in 0..500 {
            s.on_timeout();
        }
        assert_eq!(s.value(), -AVAILABILITY_BOUND);
        for _ in 0..500 {
            s.on_response(true);
        }
        assert_eq!(s.value(), AVAILABILITY_BOUND);
    }
}
