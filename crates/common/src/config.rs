//! Avalanche configuration loaded from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! `validate()` is called by `load_from_file` and rejects values the
//! voting engine cannot work with.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Amount, COIN};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AvalancheConfig {
    // quorum
    /// Total registered stake required before polling starts.
    pub min_quorum_stake: Amount,
    /// Fraction of the registered stake that must be connected.
    pub min_quorum_connected_stake_ratio: f64,
    /// Minimum number of connected avalanche nodes.
    pub min_node_count: usize,
    /// Minimum number of nodes that answered `getavaproofs`.
    pub min_avaproofs_node_count: u64,

    // polling
    pub poll_interval_ms: u64,
    pub query_timeout_ms: u64,
    pub max_element_poll: usize,
    pub max_inflight_poll: u8,
    pub finalization_score: u16,
    pub stale_vote_threshold: u32,
    pub stale_vote_factor: u32,
    pub finalized_items_capacity: usize,

    // proofs
    pub conflicting_proof_cooldown_secs: u64,
    pub enable_proof_replacement: bool,
    pub dangling_timeout_secs: u64,
    pub stake_utxo_dust_threshold: Amount,
    pub min_proof_stake: Amount,
    pub stake_utxo_confirmations: u32,
    pub max_immature_proofs: usize,

    // relay and discovery
    pub avaproofs_timeout_secs: u64,
    pub getavaaddr_interval_secs: u64,

    // node health
    pub availability_floor: i32,
    pub ban_threshold: u32,

    // finality
    pub preconsensus: bool,
    pub staking_rewards_enabled: bool,
    pub staking_reward_percent: u8,
    pub staking_reward_slack_percent: u8,
}

impl Default for AvalancheConfig {
    fn default() -> Self {
        Self {
            min_quorum_stake: 0,
            min_quorum_connected_stake_ratio: 0.2,
            min_node_count: 8,
            min_avaproofs_node_count: 8,

            poll_interval_ms: 10,
            query_timeout_ms: 10_000,
            max_element_poll: 16,
            max_inflight_poll: 10,
            finalization_score: 128,
            stale_vote_threshold: 4096,
            stale_vote_factor: 2,
            finalized_items_capacity: 4096,

            conflicting_proof_cooldown_secs: 60,
            enable_proof_replacement: false,
            dangling_timeout_secs: 900,
            stake_utxo_dust_threshold: 100 * COIN,
            min_proof_stake: 100 * COIN,
            stake_utxo_confirmations: 2016,
            max_immature_proofs: 4000,

            avaproofs_timeout_secs: 120,
            getavaaddr_interval_secs: 120,

            availability_floor: -10,
            ban_threshold: 100,

            preconsensus: false,
            staking_rewards_enabled: true,
            staking_reward_percent: 10,
            staking_reward_slack_percent: 0,
        }
    }
}

impl AvalancheConfig {
    /// Reject values the engine cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.min_quorum_connected_stake_ratio) {
            return Err(ConfigError::Invalid {
                field: "min_quorum_connected_stake_ratio",
                reason: format!("{} is outside [0, 1]", self.min_quorum_connected_stake_ratio),
            });
        }
        if self.finalization_score == 0 {
            return Err(ConfigError::Invalid {
                field: "finalization_score",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_element_poll == 0 {
            return Err(ConfigError::Invalid {
                field: "max_element_poll",
                reason: "must be positive".to_string(),
            });
        }
        if self.max_inflight_poll == 0 {
            return Err(ConfigError::Invalid {
                field: "max_inflight_poll",
                reason: "must be positive".to_string(),
            });
        }
        if self.staking_reward_percent > 100 {
            return Err(ConfigError::Invalid {
                field: "staking_reward_percent",
                reason: format!("{} exceeds 100", self.staking_reward_percent),
            });
        }
        if self.staking_reward_slack_percent > 100 {
            return Err(ConfigError::Invalid {
                field: "staking_reward_slack_percent",
                reason: format!("{} exceeds 100", self.staking_reward_slack_percent),
            });
        }
        if self.min_proof_stake < self.stake_utxo_dust_threshold {
            return Err(ConfigError::Invalid {
                field: "min_proof_stake",
                reason: "must be at least the dust threshold".to_string(),
            });
        }
        Ok(())
    }
}

/// Load and validate a config file.
pub fn load_from_file(path: impl AsRef<Path>) -> Result<AvalancheConfig, ConfigError> {
    let s = fs::read_to_string(path.as_ref())?;
    let cfg: AvalancheConfig = toml::from_str(&s)?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let cfg = AvalancheConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.finalization_score, 128);
        assert_eq!(cfg.max_element_poll, 16);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let toml = r#"
            min_node_count = 4
            enable_proof_replacement = true
            staking_reward_slack_percent = 5
        "#;
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "{}", toml).expect("write");
        let cfg = load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.min_node_count, 4);
        assert!(cfg.enable_proof_replacement);
        assert_eq!(cfg.staking_reward_slack_percent, 5);
        assert_eq!(cfg.query_timeout_ms, 10_000);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let tmp = tempfile::NamedTempFile::new().expect("temp file");
        let mut f = tmp.reopen().expect("reopen");
        write!(f, "min_quorum_connected_stake_ratio = 1.5").expect("write");
        match load_from_file(tmp.path()) {
            Err(ConfigError::Invalid { field, .. }) => {
                assert_eq!(field, "min_quorum_connected_stake_ratio")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_from_file("/nonexistent/ava.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
