// src/runner/coordinator.rs
//! Experiment-level sequencing
//!
//! Runs N pairs back to back, one pair of sandboxes live at a time, and
//! leaves the store rows and journals for the external evaluator. A pair
//! that fails or aborts never stops the run.

use crate::runner::pair::PairRunner;
use crate::runner::provisioning::Provisioner;
use crate::runner::sandbox::SandboxLauncher;
use crate::simulation::client::SimulationApi;
use crate::store::{Journal, StateStore};
use crate::utils::config::RunnerConfig;
use crate::utils::errors::{Result, RunnerError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use ulid::Ulid;

/// End-of-run accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub experiment_id: String,
    pub results_dir: PathBuf,
    pub pairs_requested: usize,
    pub pairs_completed: usize,
    pub pairs_failed: usize,
    pub agents_completed: usize,
    pub agents_timed_out: usize,
    pub agents_crashed: usize,
}

/// Sequences pairs and writes the experiment-level metadata
pub struct ExperimentCoordinator {
    config: RunnerConfig,
    api: Arc<dyn SimulationApi>,
    store: Arc<StateStore>,
}

impl ExperimentCoordinator {
    pub fn new(config: RunnerConfig, api: Arc<dyn SimulationApi>, store: Arc<StateStore>) -> Self {
        Self { config, api, store }
    }

    pub async fn run(&self) -> Result<ExperimentSummary> {
        let experiment_id = format!("exp-{}", Ulid::new().to_string().to_lowercase());
        let run_dir = self.config.experiment.results_dir.join(&experiment_id);
        tokio::fs::create_dir_all(&run_dir)
            .await
            .map_err(|e| RunnerError::Store(format!("results dir: {}", e)))?;

        info!(
            experiment_id = %experiment_id,
            pairs = self.config.experiment.pairs,
            results_dir = %run_dir.display(),
            "experiment starting"
        );

        let provisioner =
            Arc::new(Provisioner::bootstrap(self.api.clone(), self.store.clone()).await?);
        let health_journal = Arc::new(Journal::open(run_dir.join("healthcheck.jsonl")).await?);
        let launcher = SandboxLauncher::new(&self.config, run_dir.clone());

        let pair_runner = PairRunner::new(
            self.api.clone(),
            self.store.clone(),
            provisioner,
            launcher,
            self.config.clone(),
            experiment_id.clone(),
            health_journal,
            run_dir.clone(),
        );

        let total_pairs = self.config.experiment.pairs;
        let settle = Duration::from_secs(self.config.experiment.settle_delay_secs);
        let mut records = Vec::with_capacity(total_pairs);

        for pair_index in 1..=total_pairs as u32 {
            info!(pair_index, total_pairs, "starting pair");
            match pair_runner.run(pair_index).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    // Store-level failure: this pair's data is degraded,
                    // the experiment continues
                    error!(pair_index, error = %e, "pair aborted");
                }
            }

            if (pair_index as usize) < total_pairs {
                tokio::time::sleep(settle).await;
            }
        }

        let summary = self.summarise(&experiment_id, &run_dir, &records);
        self.persist_meta(&experiment_id, &run_dir, &summary).await?;

        info!(
            experiment_id = %experiment_id,
            pairs_completed = summary.pairs_completed,
            pairs_failed = summary.pairs_failed,
            agents_completed = summary.agents_completed,
            agents_timed_out = summary.agents_timed_out,
            agents_crashed = summary.agents_crashed,
            "experiment complete"
        );
        Ok(summary)
    }

    fn summarise(
        &self,
        experiment_id: &str,
        run_dir: &std::path::Path,
        records: &[crate::runner::agent::PairRecord],
    ) -> ExperimentSummary {
        let count_status = |status: &str| {
            records
                .iter()
                .flat_map(|r| &r.agents)
                .filter(|a| a.status == status)
                .count()
        };

        ExperimentSummary {
            experiment_id: experiment_id.to_string(),
            results_dir: run_dir.to_path_buf(),
            pairs_requested: self.config.experiment.pairs,
            pairs_completed: records.iter().filter(|r| r.outcome == "completed").count(),
            pairs_failed: self.config.experiment.pairs
                - records.iter().filter(|r| r.outcome == "completed").count(),
            agents_completed: count_status("completed"),
            agents_timed_out: count_status("timed_out"),
            agents_crashed: count_status("crashed"),
        }
    }

    /// Experiment metadata goes to the store and, for the evaluator, to a
    /// JSON file next to the journals.
    async fn persist_meta(
        &self,
        experiment_id: &str,
        run_dir: &std::path::Path,
        summary: &ExperimentSummary,
    ) -> Result<()> {
        let meta = serde_json::json!({
            "experiment_id": experiment_id,
            "recorded_at": Utc::now(),
            "group_a": self.config.experiment.group_a,
            "group_b": self.config.experiment.group_b,
            "total_ticks": self.config.timing.total_ticks,
            "tick_interval_secs": self.config.timing.tick_interval_secs,
            "summary": summary,
        });

        self.store
            .put(&format!("experiment:{}:meta", experiment_id), &meta.to_string())
            .await?;

        tokio::fs::write(
            run_dir.join("experiment_meta.json"),
            serde_json::to_vec_pretty(&meta)
                .map_err(|e| RunnerError::Store(format!("meta serialize: {}", e)))?,
        )
        .await
        .map_err(|e| RunnerError::Store(format!("meta write: {}", e)))?;

        Ok(())
    }
}
