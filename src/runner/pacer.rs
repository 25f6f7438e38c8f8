// src/runner/pacer.rs
//! Centralized simulated-time pacer
//!
//! The single authority over simulated time: every city in the active
//! registry is advanced by one month per tick, at a fixed wall-clock
//! interval, so both agents of a pair feel identical time pressure no
//! matter how fast they act. No other component calls the time-advance
//! interface.
//!
//! Each tick works on a registry snapshot and bounds every advance call
//! with its own timeout: a slow or failing city is logged and picked up
//! again next tick, never delaying its sibling or the cadence.

use crate::simulation::client::SimulationApi;
use crate::store::ActiveRegistry;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Months advanced per tick
const MONTHS_PER_TICK: u32 = 1;

/// Fixed-cadence driver of simulated time for all active cities
pub struct TimePacer {
    api: Arc<dyn SimulationApi>,
    key: String,
    registry: ActiveRegistry,
    total_ticks: u32,
    interval: Duration,
    advance_timeout: Duration,
    cancel: CancellationToken,
}

impl TimePacer {
    pub fn new(
        api: Arc<dyn SimulationApi>,
        key: String,
        registry: ActiveRegistry,
        total_ticks: u32,
        interval: Duration,
        advance_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            key,
            registry,
            total_ticks,
            interval,
            advance_timeout,
            cancel,
        }
    }

    /// Tick until the configured total is reached or the pacer is
    /// cancelled. Returns the number of completed ticks.
    pub async fn run(self) -> u32 {
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + self.interval,
            self.interval,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut cycle = 0u32;
        while cycle < self.total_ticks {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(cycle, total = self.total_ticks, "pacer cancelled");
                    return cycle;
                }
                _ = ticker.tick() => {}
            }

            cycle += 1;
            self.advance_all(cycle).await;
            counter!("pacer_ticks_total").increment(1);
            info!(
                cycle,
                total = self.total_ticks,
                remaining = self.total_ticks - cycle,
                "time_tick"
            );
        }

        info!(total_ticks = self.total_ticks, "pacer done");
        cycle
    }

    /// Advance every city in this tick's snapshot, concurrently.
    async fn advance_all(&self, cycle: u32) {
        let snapshot = self.registry.snapshot();

        let calls = snapshot.iter().map(|target| {
            let api = self.api.clone();
            let key = self.key.clone();
            async move {
                let result = tokio::time::timeout(
                    self.advance_timeout,
                    api.advance_time(&key, &target.city_id, MONTHS_PER_TICK),
                )
                .await;

                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        counter!("pacer_advance_failures_total").increment(1);
                        warn!(
                            agent_id = %target.agent_id,
                            city_id = %target.city_id,
                            cycle,
                            error = %e,
                            "time advance failed"
                        );
                    }
                    Err(_) => {
                        counter!("pacer_advance_failures_total").increment(1);
                        warn!(
                            agent_id = %target.agent_id,
                            city_id = %target.city_id,
                            cycle,
                            timeout_secs = self.advance_timeout.as_secs(),
                            "time advance timed out"
                        );
                    }
                }
            }
        });

        futures::future::join_all(calls).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::testing::FakeSim;
    use crate::store::ActiveTarget;

    fn pacer(
        sim: Arc<FakeSim>,
        registry: ActiveRegistry,
        total_ticks: u32,
        cancel: CancellationToken,
    ) -> TimePacer {
        TimePacer::new(
            sim as Arc<dyn SimulationApi>,
            "key".into(),
            registry,
            total_ticks,
            Duration::from_millis(10),
            Duration::from_millis(10),
            cancel,
        )
    }

    #[tokio::test]
    async fn test_exactly_total_ticks_per_active_city() {
        let sim = Arc::new(FakeSim::new());
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));
        registry.insert(ActiveTarget::new("b-01", "city-b", "value"));

        let ticks = pacer(sim.clone(), registry, 20, CancellationToken::new())
            .run()
            .await;

        assert_eq!(ticks, 20);
        assert_eq!(sim.advances_for("city-a"), 20);
        assert_eq!(sim.advances_for("city-b"), 20);
    }

    #[tokio::test]
    async fn test_no_advances_after_retirement() {
        let sim = Arc::new(FakeSim::new());
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));
        registry.insert(ActiveTarget::new("b-01", "city-b", "value"));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pacer(sim.clone(), registry.clone(), 1000, cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(60)).await;
        registry.remove("city-a");
        // Let any in-flight tick drain before reading the count
        tokio::time::sleep(Duration::from_millis(15)).await;
        let advances_at_retirement = sim.advances_for("city-a");

        tokio::time::sleep(Duration::from_millis(60)).await;
        cancel.cancel();
        task.await.unwrap();

        // The retired city saw no further advances; its sibling kept going
        assert_eq!(sim.advances_for("city-a"), advances_at_retirement);
        assert!(sim.advances_for("city-b") > advances_at_retirement);
    }

    #[tokio::test]
    async fn test_failing_city_never_blocks_sibling() {
        let sim = Arc::new(FakeSim::new());
        sim.fail_advance_for.lock().insert("city-a".to_string());

        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));
        registry.insert(ActiveTarget::new("b-01", "city-b", "value"));

        let ticks = pacer(sim.clone(), registry, 15, CancellationToken::new())
            .run()
            .await;

        assert_eq!(ticks, 15);
        assert_eq!(sim.advances_for("city-a"), 0);
        assert_eq!(sim.advances_for("city-b"), 15);
    }

    #[tokio::test]
    async fn test_cancel_stops_early() {
        let sim = Arc::new(FakeSim::new());
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(pacer(sim.clone(), registry, 1000, cancel.clone()).run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let ticks = task.await.unwrap();

        assert!(ticks < 1000);
        assert_eq!(sim.advances_for("city-a"), ticks);
    }
}
