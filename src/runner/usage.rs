// src/runner/usage.rs
//! Agent resource-usage metering and tracking
//!
//! The sandbox stream feeds token/cost events into a per-agent
//! `UsageMeter`; the `ResourceUsageTracker` samples every active meter at a
//! fixed cadence and appends the snapshots to each agent's durable usage
//! journal. One agent's failed sample never silences the others.

use crate::store::{ActiveRegistry, Journal};
use chrono::{DateTime, Utc};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Accumulated consumption counters for one agent
#[derive(Debug, Clone, Default)]
struct UsageTotals {
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: u64,
    cache_creation_tokens: u64,
    cost_usd: f64,
    num_turns: u64,
}

/// One timestamped usage snapshot, as written to the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageSample {
    pub ts: DateTime<Utc>,
    pub agent_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub num_turns: u64,
    pub elapsed_seconds: f64,
}

/// Thread-safe consumption accumulator fed from stream-json events
#[derive(Debug)]
pub struct UsageMeter {
    totals: Mutex<UsageTotals>,
    started: Instant,
}

impl UsageMeter {
    pub fn new() -> Self {
        Self {
            totals: Mutex::new(UsageTotals::default()),
            started: Instant::now(),
        }
    }

    /// Fold one stream-json event into the totals.
    ///
    /// Usage can sit top-level (final result event) or nested under
    /// `message.usage` (intermediate assistant events).
    pub fn observe(&self, event: &serde_json::Value) {
        let usage = event
            .get("usage")
            .or_else(|| event.get("message").and_then(|m| m.get("usage")));

        let mut totals = self.totals.lock();
        if let Some(usage) = usage {
            totals.input_tokens += read_u64(usage, "input_tokens");
            totals.output_tokens += read_u64(usage, "output_tokens");
            totals.cache_read_tokens += read_u64(usage, "cache_read_input_tokens");
            totals.cache_creation_tokens += read_u64(usage, "cache_creation_input_tokens");
        }
        if let Some(cost) = event.get("cost_usd").and_then(|v| v.as_f64()) {
            totals.cost_usd = cost;
        }
        if let Some(turns) = event.get("num_turns").and_then(|v| v.as_u64()) {
            totals.num_turns = turns;
        }
    }

    /// Current totals as a journal-ready sample.
    pub fn sample(&self, agent_id: &str) -> UsageSample {
        let totals = self.totals.lock().clone();
        UsageSample {
            ts: Utc::now(),
            agent_id: agent_id.to_string(),
            total_tokens: totals.input_tokens + totals.output_tokens,
            input_tokens: totals.input_tokens,
            output_tokens: totals.output_tokens,
            cache_read_tokens: totals.cache_read_tokens,
            cache_creation_tokens: totals.cache_creation_tokens,
            cost_usd: totals.cost_usd,
            num_turns: totals.num_turns,
            elapsed_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

impl Default for UsageMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u64(value: &serde_json::Value, key: &str) -> u64 {
    value.get(key).and_then(|v| v.as_u64()).unwrap_or(0)
}

/// One tracked agent: its meter plus its own journal
pub struct UsageTarget {
    pub agent_id: String,
    pub meter: Arc<UsageMeter>,
    pub journal: Arc<Journal>,
}

/// Background sampler over the active agent set
pub struct ResourceUsageTracker {
    targets: Vec<UsageTarget>,
    registry: ActiveRegistry,
    interval: Duration,
    cancel: CancellationToken,
}

impl ResourceUsageTracker {
    pub fn new(
        targets: Vec<UsageTarget>,
        registry: ActiveRegistry,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            targets,
            registry,
            interval,
            cancel,
        }
    }

    /// Sample until cancelled, then emit one final snapshot per target.
    /// Returns the number of samples appended.
    pub async fn run(self) -> u64 {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut appended = 0u64;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    appended += self.sample_round(false).await;
                }
            }
        }

        // Final totals for every target, active or not, so the journal
        // always ends with the terminal numbers.
        appended += self.sample_round(true).await;
        info!(samples = appended, "usage tracker stopped");
        appended
    }

    async fn sample_round(&self, final_round: bool) -> u64 {
        let mut appended = 0u64;
        for target in &self.targets {
            if !final_round && !self.registry.contains_agent(&target.agent_id) {
                continue;
            }

            let sample = target.meter.sample(&target.agent_id);
            match target.journal.append(&sample).await {
                Ok(()) => {
                    counter!("usage_samples_total").increment(1);
                    appended += 1;
                    debug!(
                        agent_id = %target.agent_id,
                        total_tokens = sample.total_tokens,
                        cost_usd = sample.cost_usd,
                        "usage sample"
                    );
                }
                Err(e) => {
                    // Contained per target; the loop keeps sampling the rest
                    warn!(agent_id = %target.agent_id, error = %e, "usage sample failed");
                }
            }
        }
        appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{read_journal, ActiveTarget};
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_observe_top_level_and_nested_usage() {
        let meter = UsageMeter::new();
        meter.observe(&json!({
            "message": {"usage": {"input_tokens": 100, "output_tokens": 20}}
        }));
        meter.observe(&json!({
            "usage": {"input_tokens": 50, "cache_read_input_tokens": 7},
            "cost_usd": 0.12,
            "num_turns": 9
        }));

        let sample = meter.sample("a-01");
        assert_eq!(sample.input_tokens, 150);
        assert_eq!(sample.output_tokens, 20);
        assert_eq!(sample.cache_read_tokens, 7);
        assert_eq!(sample.total_tokens, 170);
        assert_eq!(sample.cost_usd, 0.12);
        assert_eq!(sample.num_turns, 9);
    }

    #[test]
    fn test_observe_ignores_non_usage_events() {
        let meter = UsageMeter::new();
        meter.observe(&json!({"type": "tool_use", "name": "zone"}));
        assert_eq!(meter.sample("a-01").total_tokens, 0);
    }

    #[tokio::test]
    async fn test_tracker_samples_active_agents_until_cancelled() {
        let dir = tempdir().unwrap();
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));

        let meter = Arc::new(UsageMeter::new());
        meter.observe(&json!({"usage": {"input_tokens": 10}}));

        let journal = Arc::new(Journal::open(dir.path().join("a-01/usage.jsonl")).await.unwrap());
        let cancel = CancellationToken::new();
        let tracker = ResourceUsageTracker::new(
            vec![UsageTarget {
                agent_id: "a-01".into(),
                meter: meter.clone(),
                journal: journal.clone(),
            }],
            registry,
            Duration::from_millis(10),
            cancel.clone(),
        );

        let task = tokio::spawn(tracker.run());
        tokio::time::sleep(Duration::from_millis(55)).await;
        cancel.cancel();
        let appended = task.await.unwrap();

        assert!(appended >= 3);
        let records = read_journal(journal.path()).await.unwrap();
        assert_eq!(records.len() as u64, appended);
        assert_eq!(records[0]["agent_id"], "a-01");
        assert_eq!(records[0]["input_tokens"], 10);
    }

    #[tokio::test]
    async fn test_tracker_skips_inactive_but_emits_final_sample() {
        let dir = tempdir().unwrap();
        let registry = ActiveRegistry::new(); // agent never active

        let journal = Arc::new(Journal::open(dir.path().join("b-01/usage.jsonl")).await.unwrap());
        let cancel = CancellationToken::new();
        let tracker = ResourceUsageTracker::new(
            vec![UsageTarget {
                agent_id: "b-01".into(),
                meter: Arc::new(UsageMeter::new()),
                journal: journal.clone(),
            }],
            registry,
            Duration::from_millis(5),
            cancel.clone(),
        );

        let task = tokio::spawn(tracker.run());
        tokio::time::sleep(Duration::from_millis(25)).await;
        cancel.cancel();
        task.await.unwrap();

        // Only the final snapshot, none from the cadence rounds
        let records = read_journal(journal.path()).await.unwrap();
        assert_eq!(records.len(), 1);
    }
}
