//! # Cooldown Periods
//!
//! Deterministic cooldown windows used to rate-limit state transitions,
//! most notably conflicting-proof replacement: only one conflicting-proof
//! transition is allowed per stake per cooldown window.
//!
//! ## Determinism
//!
//! All time calculations take the current time as a parameter. There is no
//! access to the system clock, every method is a pure function.
//!
//! ## Overflow
//!
//! `expires_at()` saturates, so a window that would overflow `u64` never
//! expires.

use serde::{Deserialize, Serialize};

/// A window `[start_timestamp, start_timestamp + duration_secs)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownPeriod {
    /// Unix timestamp (seconds) when the window opened.
    pub start_timestamp: u64,
    /// Length of the window in seconds.
    pub duration_secs: u64,
}

impl CooldownPeriod {
    #[must_use]
    pub const fn new(start_timestamp: u64, duration_secs: u64) -> Self {
        Self { start_timestamp, duration_secs }
    }

    /// Unix timestamp at which the window closes.
    #[must_use]
    #[inline]
    pub const fn expires_at(&self) -> u64 {
        self.start_timestamp.saturating_add(self.duration_secs)
    }

    /// `true` while `now < expires_at()`.
    #[must_use]
    #[inline]
    pub const fn is_active(&self, now: u64) -> bool {
        now < self.expires_at()
    }

    /// Seconds left before expiry, zero once expired.
    #[must_use]
    #[inline]
    pub const fn remaining_secs(&self, now: u64) -> u64 {
        self.expires_at().saturating_sub(now)
    }

    /// Push the expiry out to at least `now + duration_secs`.
    ///
    /// Never shortens an active window.
    pub fn extend_from(&mut self, now: u64) {
        if now.saturating_add(self.duration_secs) > self.expires_at() {
            self.start_timestamp = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds() {
        let c = CooldownPeriod::new(1_000, 60);
        assert_eq!(c.expires_at(), 1_060);
        assert!(c.is_active(1_000));
        assert!(c.is_active(1_059));
        assert!(!c.is_active(1_060));
        assert_eq!(c.remaining_secs(1_030), 30);
        assert_eq!(c.remaining_secs(2_000), 0);
    }

    #[test]
    fn test_expiry_saturates() {
        let c = CooldownPeriod::new(u64::MAX - 5, 60);
        assert_eq!(c.expires_at(), u64::MAX);
        assert!(c.is_active(u64::MAX - 1));
    }

    #[test]
    fn test_extend_never_shortens() {
        let mut c = CooldownPeriod::new(1_000, 60);
        c.extend_from(990);
        assert_eq!(c.expires_at(), 1_060);
        c.extend_from(1_030);
        assert_eq!(c.expires_at(), 1_090);
    }

    #[test]
    fn test_zero_duration_is_never_active() {
        let c = CooldownPeriod::new(500, 0);
        assert!(!c.is_active(500));
    }
}
