//! Multi-node scenarios over the in-memory hub.

use std::io::Write;

use ava_chain::{Block, ChainValidator};
use ava_common::{AvalancheConfig, COIN};
use ava_node::cli::execute;
use ava_node::{Cli, Simulation};
use clap::Parser;

fn scenario_config() -> AvalancheConfig {
    AvalancheConfig {
        stake_utxo_confirmations: 2,
        finalization_score: 16,
        ..AvalancheConfig::default()
    }
}

fn child(parent: &Block, work: u128, nonce: u64) -> Block {
    Block::child_of(parent, parent.time + 600, work, vec![], vec![], 50 * COIN, nonce)
}

#[tokio::test]
async fn test_sixteen_peers_finalize_tip_and_park_rejected_sibling() {
    let mut sim = Simulation::new(16, scenario_config()).expect("simulation");
    sim.connect_all().await.expect("connect");
    for node in sim.nodes() {
        assert_eq!(node.processor().counters().proof_count, 16);
    }

    sim.run_until(200, Simulation::all_quorum).await.expect("quorum");

    let tip = sim.shared_tip().clone();
    for node in sim.nodes() {
        node.event_loop.block_received(tip.hash, sim.now_ms());
    }
    let rounds = sim
        .run_until(500, |s| s.all_finalized(&tip.hash))
        .await
        .expect("tip finalized");
    assert!(rounds > 0);
    for node in sim.nodes() {
        assert_eq!(node.finality().finalization_tip(), Some(tip.hash));
    }

    // Everyone builds `a` on the finalized tip.
    let a = child(&tip, 1, 1);
    for node in sim.nodes() {
        node.chain.add_block(a.clone()).expect("a");
        assert_eq!(node.finality().activate_best_chain(), Ok(Some(a.hash)));
    }

    // Node 0 sees a heavier sibling `b`. Every other node holds it as invalid.
    let b = child(&tip, 5, 2);
    for node in &sim.nodes()[1..] {
        node.chain.add_invalid_block(b.clone()).expect("invalid b");
    }
    sim.announce_block(0, b.clone()).expect("b");
    assert_eq!(sim.nodes()[0].active_tip(), Some(b.hash));

    sim.run_until(500, |s| s.nodes()[0].finality().is_parked(&b.hash))
        .await
        .expect("b parked");
    let node0 = &sim.nodes()[0];
    assert_eq!(node0.active_tip(), Some(a.hash));
    assert!(!node0.chain.is_on_active_chain(&b.hash));

    // More work on top of the parked block does not bring it back.
    let b2 = child(&b, 50, 3);
    sim.announce_block(0, b2.clone()).expect("b2");
    for _ in 0..50 {
        sim.step().await;
        let node0 = &sim.nodes()[0];
        assert_eq!(node0.active_tip(), Some(a.hash));
        assert!(!node0.chain.is_on_active_chain(&b.hash));
        assert!(!node0.chain.is_on_active_chain(&b2.hash));
    }
    for node in &sim.nodes()[1..] {
        assert_eq!(node.active_tip(), Some(a.hash));
    }
}

#[tokio::test]
async fn test_simulate_command_with_config_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(
        file,
        r#"
            stake_utxo_confirmations = 2
            finalization_score = 8
            min_node_count = 8
            min_avaproofs_node_count = 8
        "#
    )
    .expect("write");
    let path = file.path().to_string_lossy().into_owned();

    let cli = Cli::try_parse_from(["ava-node", "simulate", "--nodes", "10", "--config", path.as_str()]).expect("parse");
    let out = execute(cli).await.expect("simulate");
    let report: serde_json::Value = serde_json::from_str(&out).expect("json");
    assert_eq!(report["node_count"], 10);
    assert_eq!(report["finalized"], true);
    let nodes = report["nodes"].as_array().expect("nodes");
    assert_eq!(nodes.len(), 10);
    for node in nodes {
        assert_eq!(node["quorum"], true);
        assert_eq!(node["peers"].as_array().expect("peers").len(), 10);
        assert_eq!(node["counters"]["proof_count"], 10);
    }
}

#[tokio::test]
async fn test_invalid_config_file_is_refused() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    write!(file, "min_quorum_connected_stake_ratio = 1.5").expect("write");
    let path = file.path().to_string_lossy().into_owned();

    let cli = Cli::try_parse_from(["ava-node", "config", "--config", path.as_str()]).expect("parse");
    assert!(execute(cli).await.is_err());
}
