//! Rule upgrades keyed by median-time-past.
//!
//! An upgrade is active for the next block once the tip median-time-past
//! reaches its activation time. A reorg that moves the tip back below that
//! boundary deactivates it again.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpgradeId(pub u32);

impl fmt::Debug for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upgrade#{}", self.0)
    }
}

impl fmt::Display for UpgradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upgrade {
    pub id: UpgradeId,
    pub activation_time: i64,
}

/// Set of upgrades in force.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSet {
    active: BTreeSet<UpgradeId>,
}

impl RuleSet {
    #[must_use]
    pub fn is_active(&self, id: UpgradeId) -> bool {
        self.active.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpgradeId> + '_ {
        self.active.iter()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationSchedule {
    upgrades: Vec<Upgrade>,
}

impl ActivationSchedule {
    #[must_use]
    pub fn new(upgrades: Vec<Upgrade>) -> Self {
        Self { upgrades }
    }

    #[must_use]
    pub fn rules_at(&self, median_time_past: i64) -> RuleSet {
        RuleSet {
            active: self
                .upgrades
                .iter()
                .filter(|u| median_time_past >= u.activation_time)
                .map(|u| u.id)
                .collect(),
        }
    }
}
