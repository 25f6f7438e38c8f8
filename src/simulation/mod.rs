// src/simulation/mod.rs
//! Simulation API boundary
//!
//! - **client**: the `SimulationApi` trait and its HTTP implementation
//! - **types**: wire types (city stats, create responses)

pub mod client;
pub mod types;

pub use client::{HttpSimulationClient, RetryPolicy, SimulationApi};
pub use types::CityStats;

#[cfg(test)]
pub mod testing {
    //! In-memory fake of the simulation service for fault-injection tests.

    use super::client::SimulationApi;
    use super::types::CityStats;
    use crate::utils::errors::{Result, RunnerError};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted simulation backend: records every call, fails on demand.
    #[derive(Default)]
    pub struct FakeSim {
        next_city: AtomicU32,
        create_calls: AtomicU32,

        /// Cities created, in order
        pub created: Mutex<Vec<String>>,
        /// Cities retired, in order (may repeat)
        pub retired: Mutex<Vec<String>>,
        /// Advance calls per city
        pub advances: Mutex<HashMap<String, u32>>,
        /// Stats polls per city
        pub stats_polls: Mutex<HashMap<String, u32>>,

        /// 1-based create call numbers that should fail
        pub fail_create_on: Mutex<HashSet<u32>>,
        /// Cities whose advance calls fail
        pub fail_advance_for: Mutex<HashSet<String>>,
        /// Cities whose stats polls fail
        pub fail_stats_for: Mutex<HashSet<String>>,
    }

    impl FakeSim {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn advances_for(&self, city_id: &str) -> u32 {
            self.advances.lock().get(city_id).copied().unwrap_or(0)
        }

        pub fn stats_polls_for(&self, city_id: &str) -> u32 {
            self.stats_polls.lock().get(city_id).copied().unwrap_or(0)
        }

        pub fn created_count(&self) -> usize {
            self.created.lock().len()
        }

        pub fn retired_count(&self) -> usize {
            self.retired.lock().len()
        }
    }

    #[async_trait]
    impl SimulationApi for FakeSim {
        async fn create_key(&self) -> Result<String> {
            Ok("fake-key-000000000000".to_string())
        }

        async fn create_city(&self, _key: &str, group: &str) -> Result<String> {
            let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_create_on.lock().contains(&call) {
                return Err(RunnerError::Simulation(format!(
                    "create_city: injected failure on call {}",
                    call
                )));
            }
            let id = format!("city-{}-{}", group, self.next_city.fetch_add(1, Ordering::SeqCst));
            self.created.lock().push(id.clone());
            Ok(id)
        }

        async fn retire_city(&self, _key: &str, city_id: &str) -> Result<()> {
            self.retired.lock().push(city_id.to_string());
            Ok(())
        }

        async fn advance_time(&self, _key: &str, city_id: &str, _months: u32) -> Result<()> {
            if self.fail_advance_for.lock().contains(city_id) {
                return Err(RunnerError::Simulation(format!(
                    "advance_time: injected failure for {}",
                    city_id
                )));
            }
            *self.advances.lock().entry(city_id.to_string()).or_insert(0) += 1;
            Ok(())
        }

        async fn city_stats(&self, _key: &str, city_id: &str) -> Result<CityStats> {
            if self.fail_stats_for.lock().contains(city_id) {
                return Err(RunnerError::Simulation(format!(
                    "city_stats: injected failure for {}",
                    city_id
                )));
            }
            let polls = {
                let mut polls = self.stats_polls.lock();
                let entry = polls.entry(city_id.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            Ok(CityStats {
                population: Some(1000 + polls as i64),
                approval: Some(0.5),
                funds: Some(10_000.0),
                crime: Some(0.1),
                pollution: Some(0.2),
                game_year: Some(2050),
                extra: Default::default(),
            })
        }
    }
}
