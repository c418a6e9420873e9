//! # Avalanche Node Crate
//!
//! Operator edge of the avalanche pre-consensus layer.
//!
//! | Module | Role |
//! |--------|------|
//! | `simulation` | N in-memory nodes on a `MemoryHub`, driven on a virtual clock |
//! | `cli` | `ava-node` argument parsing, config loading, logging setup |
//!
//! ## Simulation Phases
//!
//! ```text
//!  Simulation::new ──▶ connect_all ──▶ run_until(all_quorum)
//!                                            │
//!                       block_received(tip) ◀┘
//!                                │
//!                                ▼
//!                     run_until(all_finalized) ──▶ report (JSON)
//! ```

pub mod cli;
pub mod simulation;

pub use cli::{load_config, Cli, Command};
pub use simulation::{run, NodeReport, SimNode, Simulation, SimulationReport};
