// src/main.rs
//! Intent Lab Runner
//!
//! Runs paired-agent city experiments: provisions cities, launches both
//! sandboxes, paces simulated time, and leaves durable records for the
//! evaluator.

use anyhow::Result;
use intent_lab_runner::observability::{init_metrics, init_tracing};
use intent_lab_runner::runner::ExperimentCoordinator;
use intent_lab_runner::simulation::HttpSimulationClient;
use intent_lab_runner::store::StateStore;
use intent_lab_runner::utils::config::RunnerConfig;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first; observability settings live in it
    let config = RunnerConfig::load()?;
    init_tracing(&config.observability)?;
    init_metrics(&config.observability)?;

    info!("Starting Intent Lab Runner v{}", env!("CARGO_PKG_VERSION"));
    info!(
        pairs = config.experiment.pairs,
        total_ticks = config.timing.total_ticks,
        tick_interval_secs = config.timing.tick_interval_secs,
        "configuration loaded"
    );

    let store = Arc::new(StateStore::open(&config.store).await?);
    let api = Arc::new(HttpSimulationClient::new(&config.simulation)?);

    let coordinator = ExperimentCoordinator::new(config, api, store);
    let summary = coordinator.run().await?;

    info!(
        experiment_id = %summary.experiment_id,
        results_dir = %summary.results_dir.display(),
        "all done - hand the results directory to the evaluator"
    );
    Ok(())
}
