//! `ava-node` command line.
//!
//! ```text
//! ava-node [--log-level L] simulate [--nodes N] [--config PATH]
//! ava-node [--log-level L] config [--config PATH]
//! ```
//!
//! `RUST_LOG` takes precedence over `--log-level`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ava_common::config::load_from_file;
use ava_common::AvalancheConfig;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::simulation;

#[derive(Parser, Debug)]
#[command(name = "ava-node", about = "Avalanche pre-consensus node simulator")]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run N in-memory nodes until the shared tip is finalized
    Simulate {
        #[arg(long, default_value_t = 16)]
        nodes: usize,
        /// TOML config file, defaults apply for missing keys
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Print the effective configuration
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Defaults when `path` is `None`, the validated file otherwise.
pub fn load_config(path: Option<&Path>) -> Result<AvalancheConfig> {
    match path {
        Some(p) => load_from_file(p).with_context(|| format!("loading {}", p.display())),
        None => Ok(AvalancheConfig::default()),
    }
}

/// Install the fmt subscriber. A second call is a no-op.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Run `cli` and return what should be printed.
pub async fn execute(cli: Cli) -> Result<String> {
    match cli.command {
        Command::Simulate { nodes, config } => {
            let config = load_config(config.as_deref())?;
            info!("simulating {} nodes", nodes);
            let report = simulation::run(nodes, config).await?;
            serde_json::to_string_pretty(&report).context("encoding report")
        }
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            toml::to_string_pretty(&config).context("encoding config")
        }
    }
}
