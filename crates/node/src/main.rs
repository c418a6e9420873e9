//! `ava-node` entry point. See `ava_node::cli`.

use anyhow::Result;
use ava_node::cli::{execute, init_tracing};
use ava_node::Cli;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);
    let output = execute(cli).await?;
    println!("{}", output);
    Ok(())
}
