// src/lib.rs
//! Intent Lab Runner Library
//!
//! Orchestration runtime for paired-agent city experiments: two sandboxed
//! agents per pair, identical simulated-time pressure, durable journals
//! for the downstream evaluator.
//!
//! # Architecture
//!
//! - **runner**: provisioning, sandboxes, pacer, pollers, pair sequencing
//! - **simulation**: the external simulation API boundary
//! - **store**: shared state (SQLite), the active registry, JSONL journals
//! - **observability**: tracing and metrics initialisation
//! - **utils**: configuration and the error taxonomy

// Public module exports
pub mod observability;
pub mod runner;
pub mod simulation;
pub mod store;
pub mod utils;

// Re-export commonly used types
pub use runner::{ExperimentCoordinator, ExperimentSummary, PairRunner};
pub use simulation::{HttpSimulationClient, SimulationApi};
pub use store::StateStore;
pub use utils::config::RunnerConfig;
pub use utils::errors::{Result, RunnerError};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
