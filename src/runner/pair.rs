// src/runner/pair.rs
//! One experiment pair, end to end
//!
//! `idle -> provisioning -> launching -> running -> draining -> retired`.
//!
//! Provision two cities, launch two sandboxes in parallel, run the pacer
//! and both pollers against the active set, wait for both sandboxes (or
//! the pair watchdog), then retire everything and append the pair's
//! durable record. A failed pair cleans up whatever it created and never
//! takes the experiment down with it.

use crate::runner::agent::{AgentRecord, AgentSpec, City, Group, PairRecord, TerminalStatus};
use crate::runner::healthcheck::HealthCheckMonitor;
use crate::runner::pacer::TimePacer;
use crate::runner::provisioning::Provisioner;
use crate::runner::sandbox::SandboxLauncher;
use crate::runner::usage::{ResourceUsageTracker, UsageTarget};
use crate::runner::workspace::Workspace;
use crate::simulation::client::SimulationApi;
use crate::store::{ActiveTarget, Journal, StateStore};
use crate::utils::config::RunnerConfig;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pair lifecycle; `Retired` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairState {
    Idle,
    Provisioning,
    Launching,
    Running,
    Draining,
    Retired,
}

/// Runs pairs sequentially; one live pair owns the active set at a time
pub struct PairRunner {
    api: Arc<dyn SimulationApi>,
    store: Arc<StateStore>,
    provisioner: Arc<Provisioner>,
    launcher: SandboxLauncher,
    config: RunnerConfig,
    experiment_id: String,
    health_journal: Arc<Journal>,

    /// Per-agent logs live under here
    results_dir: PathBuf,
}

impl PairRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn SimulationApi>,
        store: Arc<StateStore>,
        provisioner: Arc<Provisioner>,
        launcher: SandboxLauncher,
        config: RunnerConfig,
        experiment_id: String,
        health_journal: Arc<Journal>,
        results_dir: PathBuf,
    ) -> Self {
        Self {
            api,
            store,
            provisioner,
            launcher,
            config,
            experiment_id,
            health_journal,
            results_dir,
        }
    }

    /// Drive one pair from `idle` to `retired`.
    pub async fn run(&self, pair_index: u32) -> Result<PairRecord> {
        let started_at = Utc::now();
        let mut state = PairState::Idle;
        self.transition(&mut state, PairState::Provisioning, pair_index);

        // ── Provisioning ─────────────────────────────────────────────────
        let (mut city_a, cred_a) = match self
            .provisioner
            .create(pair_index, Group::A, &self.config.experiment.group_a)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                self.transition(&mut state, PairState::Retired, pair_index);
                return self
                    .finish_failed(pair_index, started_at, format!("create city A: {}", e), vec![])
                    .await;
            }
        };

        let (mut city_b, cred_b) = match self
            .provisioner
            .create(pair_index, Group::B, &self.config.experiment.group_b)
            .await
        {
            Ok(created) => created,
            Err(e) => {
                // No leaked city: A is retired before the pair resolves
                self.retire_best_effort(&mut city_a).await;
                self.transition(&mut state, PairState::Retired, pair_index);
                let agents = vec![unlaunched_record(&city_a, Group::A)];
                return self
                    .finish_failed(pair_index, started_at, format!("create city B: {}", e), agents)
                    .await;
            }
        };

        let spec_a = AgentSpec::new(pair_index, Group::A, &city_a.group_label, &city_a.city_id);
        let spec_b = AgentSpec::new(pair_index, Group::B, &city_b.group_label, &city_b.city_id);

        let workspaces = (
            Workspace::prepare(&self.config.sandbox, &spec_a, cred_a),
            Workspace::prepare(&self.config.sandbox, &spec_b, cred_b),
        );
        let (ws_a, ws_b) = match workspaces {
            (Ok(a), Ok(b)) => (a, b),
            (a, b) => {
                let e = a.err().or(b.err()).expect("one side failed");
                self.retire_best_effort(&mut city_a).await;
                self.retire_best_effort(&mut city_b).await;
                self.transition(&mut state, PairState::Retired, pair_index);
                let agents = vec![
                    unlaunched_record(&city_a, Group::A),
                    unlaunched_record(&city_b, Group::B),
                ];
                return self
                    .finish_failed(pair_index, started_at, format!("workspace prep: {}", e), agents)
                    .await;
            }
        };

        // Usage journals open before anything is running, so a store
        // failure here cannot strand a live sandbox.
        let usage_journals = (
            Journal::open(self.results_dir.join(&spec_a.agent_id).join("usage.jsonl")).await,
            Journal::open(self.results_dir.join(&spec_b.agent_id).join("usage.jsonl")).await,
        );
        let (usage_journal_a, usage_journal_b) = match usage_journals {
            (Ok(a), Ok(b)) => (Arc::new(a), Arc::new(b)),
            (a, b) => {
                let e = a.err().or(b.err()).expect("one side failed");
                self.retire_best_effort(&mut city_a).await;
                self.retire_best_effort(&mut city_b).await;
                self.transition(&mut state, PairState::Retired, pair_index);
                let agents = vec![
                    unlaunched_record(&city_a, Group::A),
                    unlaunched_record(&city_b, Group::B),
                ];
                return self
                    .finish_failed(pair_index, started_at, format!("usage journal: {}", e), agents)
                    .await;
            }
        };

        // ── Launching ────────────────────────────────────────────────────
        self.transition(&mut state, PairState::Launching, pair_index);

        // Registered before the sandboxes start, so the pacer and the
        // pollers cover both cities from the agents' first action.
        self.store
            .register_active(ActiveTarget::new(
                &spec_a.agent_id,
                &city_a.city_id,
                &city_a.group_label,
            ))
            .await?;
        self.store
            .register_active(ActiveTarget::new(
                &spec_b.agent_id,
                &city_b.city_id,
                &city_b.group_label,
            ))
            .await?;

        let launches = tokio::join!(
            self.launcher.launch(&spec_a, &ws_a),
            self.launcher.launch(&spec_b, &ws_b),
        );
        let (mut handle_a, mut handle_b) = match launches {
            (Ok(a), Ok(b)) => (a, b),
            (a, b) => {
                let e = match (&a, &b) {
                    (Err(e), _) => e.to_string(),
                    (_, Err(e)) => e.to_string(),
                    _ => unreachable!(),
                };
                // Terminate whichever sandbox did start; its supervisor
                // owns the child and reaps it.
                if let Ok(h) = &a {
                    h.terminate();
                }
                if let Ok(h) = &b {
                    h.terminate();
                }
                self.retire_best_effort(&mut city_a).await;
                self.retire_best_effort(&mut city_b).await;
                self.transition(&mut state, PairState::Retired, pair_index);
                let agents = vec![
                    unlaunched_record(&city_a, Group::A),
                    unlaunched_record(&city_b, Group::B),
                ];
                return self
                    .finish_failed(pair_index, started_at, format!("launch: {}", e), agents)
                    .await;
            }
        };

        // ── Running ──────────────────────────────────────────────────────
        self.transition(&mut state, PairState::Running, pair_index);
        let agents_started_at = Utc::now();

        let loops_cancel = CancellationToken::new();
        let registry = self.store.registry();
        let timing = &self.config.timing;

        let pacer_task = tokio::spawn(
            TimePacer::new(
                self.api.clone(),
                self.provisioner.runner_key().to_string(),
                registry.clone(),
                timing.total_ticks,
                timing.tick_interval(),
                timing.advance_timeout(),
                loops_cancel.clone(),
            )
            .run(),
        );

        let health_task = tokio::spawn(
            HealthCheckMonitor::new(
                self.api.clone(),
                self.provisioner.runner_key().to_string(),
                registry.clone(),
                self.health_journal.clone(),
                timing.healthcheck_interval(),
                loops_cancel.clone(),
            )
            .run(),
        );

        let usage_targets = vec![
            UsageTarget {
                agent_id: handle_a.agent_id.clone(),
                meter: handle_a.meter(),
                journal: usage_journal_a,
            },
            UsageTarget {
                agent_id: handle_b.agent_id.clone(),
                meter: handle_b.meter(),
                journal: usage_journal_b,
            },
        ];
        let usage_task = tokio::spawn(
            ResourceUsageTracker::new(
                usage_targets,
                registry.clone(),
                timing.usage_interval(),
                loops_cancel.clone(),
            )
            .run(),
        );

        // Pair-level watchdog: forcibly terminates whatever still runs.
        // Each agent keeps its own terminal status; a sibling that already
        // finished is untouched (termination is idempotent).
        let pair_watchdog = {
            let kill_a = handle_a.termination_token();
            let kill_b = handle_b.termination_token();
            let budget = timing.pair_budget();
            tokio::spawn(async move {
                tokio::time::sleep(budget).await;
                warn!(budget_secs = budget.as_secs(), "pair watchdog fired");
                kill_a.cancel();
                kill_b.cancel();
            })
        };

        let (status_a, status_b) = tokio::join!(handle_a.wait(), handle_b.wait());
        pair_watchdog.abort();
        info!(
            pair_index,
            status_a = status_a.as_str(),
            status_b = status_b.as_str(),
            "both sandboxes terminal"
        );

        // ── Draining ─────────────────────────────────────────────────────
        self.transition(&mut state, PairState::Draining, pair_index);
        let agents_finished_at = Utc::now();

        loops_cancel.cancel();
        let ticks_completed = pacer_task.await.unwrap_or(0);
        let _ = health_task.await;
        let _ = usage_task.await;

        // Retirement errors are logged, never fatal to the pair
        self.retire_best_effort(&mut city_a).await;
        self.retire_best_effort(&mut city_b).await;

        drop(ws_a);
        drop(ws_b);

        let record = PairRecord {
            pair_index,
            experiment_id: self.experiment_id.clone(),
            outcome: "completed".to_string(),
            failure: None,
            ticks_completed,
            agents: vec![
                launched_record(&spec_a, status_a, agents_started_at, agents_finished_at),
                launched_record(&spec_b, status_b, agents_started_at, agents_finished_at),
            ],
            started_at,
            finished_at: Utc::now(),
        };

        self.append_records(&record).await?;
        self.transition(&mut state, PairState::Retired, pair_index);
        Ok(record)
    }

    async fn retire_best_effort(&self, city: &mut City) {
        if let Err(e) = self.provisioner.retire(city).await {
            error!(city_id = %city.city_id, error = %e, "retirement failed");
        }
    }

    /// Append the pair record plus per-agent records; store failure here is
    /// fatal to this pair's data only.
    async fn append_records(&self, record: &PairRecord) -> Result<()> {
        for agent in &record.agents {
            self.store
                .append_agent_record(&self.experiment_id, &agent.agent_id, agent)
                .await?;
        }
        self.store
            .append_pair_record(&self.experiment_id, record.pair_index, record)
            .await?;
        Ok(())
    }

    async fn finish_failed(
        &self,
        pair_index: u32,
        started_at: DateTime<Utc>,
        failure: String,
        agents: Vec<AgentRecord>,
    ) -> Result<PairRecord> {
        warn!(pair_index, failure = %failure, "pair failed");
        let record = PairRecord {
            pair_index,
            experiment_id: self.experiment_id.clone(),
            outcome: "failed".to_string(),
            failure: Some(failure),
            ticks_completed: 0,
            agents,
            started_at,
            finished_at: Utc::now(),
        };
        self.append_records(&record).await?;
        Ok(record)
    }

    fn transition(&self, state: &mut PairState, to: PairState, pair_index: u32) {
        info!(pair_index, from = ?state, to = ?to, "pair state");
        *state = to;
    }
}

fn launched_record(
    spec: &AgentSpec,
    status: TerminalStatus,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
) -> AgentRecord {
    AgentRecord {
        agent_id: spec.agent_id.clone(),
        group: spec.group_label.clone(),
        city_id: spec.city_id.clone(),
        status: status.as_str().to_string(),
        started_at: Some(started_at),
        finished_at: Some(finished_at),
    }
}

fn unlaunched_record(city: &City, group: Group) -> AgentRecord {
    AgentRecord {
        agent_id: format!("{}-{:02}", group.letter(), city.pair_index),
        group: city.group_label.clone(),
        city_id: city.city_id.clone(),
        status: "not_launched".to_string(),
        started_at: None,
        finished_at: None,
    }
}
