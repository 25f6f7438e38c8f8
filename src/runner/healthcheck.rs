// src/runner/healthcheck.rs
//! Periodic health-check poller for active cities
//!
//! Polls every city in the active registry at a fixed cadence and appends
//! one timestamped snapshot per city to the durable health journal. A
//! failed poll for one city is logged and skipped; the round continues
//! for the rest and the loop never stops on its own.

use crate::simulation::client::SimulationApi;
use crate::store::{ActiveRegistry, Journal};
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One durable health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub ts: DateTime<Utc>,
    pub agent_id: String,
    pub city_id: String,
    pub population: Option<i64>,
    pub approval: Option<f64>,
    pub funds: Option<f64>,
    pub crime: Option<f64>,
    pub pollution: Option<f64>,
    pub game_year: Option<i64>,
    pub elapsed_seconds: f64,
}

/// Background poller over the active registry
pub struct HealthCheckMonitor {
    api: Arc<dyn SimulationApi>,
    key: String,
    registry: ActiveRegistry,
    journal: Arc<Journal>,
    interval: Duration,
    cancel: CancellationToken,
}

impl HealthCheckMonitor {
    pub fn new(
        api: Arc<dyn SimulationApi>,
        key: String,
        registry: ActiveRegistry,
        journal: Arc<Journal>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            key,
            registry,
            journal,
            interval,
            cancel,
        }
    }

    /// Poll until cancelled. Returns the number of snapshots appended.
    pub async fn run(self) -> u64 {
        let started = Instant::now();
        let mut appended = 0u64;

        loop {
            appended += self.poll_round(started).await;

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(snapshots = appended, "health monitor stopped");
        appended
    }

    /// One pass over a registry snapshot; failures are contained per city.
    async fn poll_round(&self, started: Instant) -> u64 {
        let elapsed = started.elapsed().as_secs_f64();
        let mut appended = 0u64;

        for target in self.registry.snapshot() {
            let stats = match self.api.city_stats(&self.key, &target.city_id).await {
                Ok(stats) => stats,
                Err(e) => {
                    counter!("healthcheck_poll_failures_total").increment(1);
                    warn!(
                        agent_id = %target.agent_id,
                        city_id = %target.city_id,
                        error = %e,
                        "health poll failed"
                    );
                    continue;
                }
            };

            let snapshot = HealthSnapshot {
                ts: Utc::now(),
                agent_id: target.agent_id.clone(),
                city_id: target.city_id.clone(),
                population: stats.population,
                approval: stats.approval,
                funds: stats.funds,
                crime: stats.crime,
                pollution: stats.pollution,
                game_year: stats.game_year,
                elapsed_seconds: elapsed,
            };

            match self.journal.append(&snapshot).await {
                Ok(()) => {
                    counter!("healthcheck_polls_total").increment(1);
                    appended += 1;
                    debug!(
                        agent_id = %target.agent_id,
                        population = ?snapshot.population,
                        approval = ?snapshot.approval,
                        "healthcheck"
                    );
                }
                Err(e) => {
                    warn!(agent_id = %target.agent_id, error = %e, "health append failed");
                }
            }
        }

        appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::testing::FakeSim;
    use crate::store::{read_journal, ActiveTarget};
    use tempfile::tempdir;

    async fn run_monitor(
        sim: Arc<FakeSim>,
        registry: ActiveRegistry,
        rounds_ms: u64,
    ) -> Vec<serde_json::Value> {
        let dir = tempdir().unwrap();
        let journal = Arc::new(Journal::open(dir.path().join("healthcheck.jsonl")).await.unwrap());
        let cancel = CancellationToken::new();

        let monitor = HealthCheckMonitor::new(
            sim as Arc<dyn SimulationApi>,
            "key".into(),
            registry,
            journal.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        );

        let task = tokio::spawn(monitor.run());
        tokio::time::sleep(Duration::from_millis(rounds_ms)).await;
        cancel.cancel();
        task.await.unwrap();

        read_journal(journal.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_polls_every_active_city() {
        let sim = Arc::new(FakeSim::new());
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));
        registry.insert(ActiveTarget::new("b-01", "city-b", "value"));

        let records = run_monitor(sim.clone(), registry, 55).await;

        assert!(sim.stats_polls_for("city-a") >= 3);
        assert!(sim.stats_polls_for("city-b") >= 3);
        assert!(records.iter().any(|r| r["agent_id"] == "a-01"));
        assert!(records.iter().any(|r| r["agent_id"] == "b-01"));
        assert!(records.iter().all(|r| r["population"].is_i64()));
    }

    #[tokio::test]
    async fn test_one_failing_city_does_not_silence_the_rest() {
        let sim = Arc::new(FakeSim::new());
        sim.fail_stats_for.lock().insert("city-a".to_string());

        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));
        registry.insert(ActiveTarget::new("b-01", "city-b", "value"));

        let records = run_monitor(sim.clone(), registry, 55).await;

        // The healthy sibling keeps producing records
        assert!(records.iter().all(|r| r["agent_id"] == "b-01"));
        assert!(records.len() >= 3);
        assert!(sim.stats_polls_for("city-b") >= 3);
    }

    #[tokio::test]
    async fn test_retired_city_stops_being_polled() {
        let sim = Arc::new(FakeSim::new());
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));

        let dir = tempdir().unwrap();
        let journal = Arc::new(Journal::open(dir.path().join("healthcheck.jsonl")).await.unwrap());
        let cancel = CancellationToken::new();
        let monitor = HealthCheckMonitor::new(
            sim.clone() as Arc<dyn SimulationApi>,
            "key".into(),
            registry.clone(),
            journal,
            Duration::from_millis(10),
            cancel.clone(),
        );
        let task = tokio::spawn(monitor.run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        registry.remove("city-a");
        let polls_at_removal = sim.stats_polls_for("city-a");

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        // At most one in-flight round after removal
        assert!(sim.stats_polls_for("city-a") <= polls_at_removal + 1);
    }
}
