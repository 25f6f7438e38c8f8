// src/simulation/client.rs
//! HTTP client for the simulation API
//!
//! All calls are fallible; transient failures (connect errors, timeouts,
//! 429, 5xx) are retried with capped exponential backoff and jitter,
//! anything else surfaces immediately and is never retried.

use crate::simulation::types::{
    CityStats, CreateCityRequest, CreateCityResponse, CreateKeyResponse,
};
use crate::utils::config::SimulationConfig;
use crate::utils::errors::{Result, RunnerError};
use async_trait::async_trait;
use metrics::counter;
use rand::Rng;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::warn;

/// Boundary to the external simulation service.
///
/// The orchestrator only ever talks to cities through this trait, which is
/// what lets the fault-injection tests run without a network.
#[async_trait]
pub trait SimulationApi: Send + Sync {
    /// Mint a scoped API credential
    async fn create_key(&self) -> Result<String>;

    /// Create a city under `key` and return its id
    async fn create_city(&self, key: &str, group: &str) -> Result<String>;

    /// Retire a city; succeeds when the city is already gone upstream
    async fn retire_city(&self, key: &str, city_id: &str) -> Result<()>;

    /// Advance simulated time for one city
    async fn advance_time(&self, key: &str, city_id: &str, months: u32) -> Result<()>;

    /// Fetch the city's observable stats
    async fn city_stats(&self, key: &str, city_id: &str) -> Result<CityStats>;
}

/// Capped exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts per call
    pub max_attempts: u32,

    /// First backoff; doubles each retry
    pub base: Duration,

    /// Hard upper bound on a single sleep
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SimulationConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base: Duration::from_millis(config.backoff_base_ms.max(1)),
            cap: Duration::from_millis(config.backoff_cap_ms.max(1)),
        }
    }

    /// Backoff before retry `attempt` (1-based), jittered up to +25%.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base.as_millis() as u64 * (1u64 << exp);
        let capped = raw.min(self.cap.as_millis() as u64);
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
        Duration::from_millis((capped as f64 * jitter) as u64).min(self.cap)
    }
}

/// Call failure carrying the status that caused it, when there was one
struct ApiFailure {
    status: Option<StatusCode>,
    message: String,
}

impl From<ApiFailure> for RunnerError {
    fn from(failure: ApiFailure) -> Self {
        RunnerError::Simulation(failure.message)
    }
}

/// `SimulationApi` over HTTP
pub struct HttpSimulationClient {
    http: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl HttpSimulationClient {
    pub fn new(config: &SimulationConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent("intent-lab-runner/0.1")
            .build()
            .map_err(|e| RunnerError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: RetryPolicy::from_config(config),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn is_transient(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    /// Send a request, retrying transient failures per the policy.
    async fn call<F>(&self, what: &str, build: F) -> std::result::Result<reqwest::Response, ApiFailure>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut last_error = String::new();

        for attempt in 1..=self.retry.max_attempts {
            match build(&self.http).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp);
                    }
                    if !Self::is_transient(status) {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(ApiFailure {
                            status: Some(status),
                            message: format!("{}: {} {}", what, status, body),
                        });
                    }
                    last_error = format!("{}: {}", what, status);
                }
                Err(e) => {
                    // Connect/timeout class failure
                    last_error = format!("{}: {}", what, e);
                }
            }

            if attempt < self.retry.max_attempts {
                let wait = self.retry.delay(attempt);
                counter!("simulation_retries_total").increment(1);
                warn!(what, attempt, wait_ms = wait.as_millis() as u64, "transient failure, retrying");
                tokio::time::sleep(wait).await;
            }
        }

        Err(ApiFailure {
            status: None,
            message: format!(
                "{} failed after {} attempts: {}",
                what, self.retry.max_attempts, last_error
            ),
        })
    }
}

#[async_trait]
impl SimulationApi for HttpSimulationClient {
    async fn create_key(&self) -> Result<String> {
        let url = self.url("/v1/keys");
        let resp = self.call("create_key", |http| http.post(&url)).await?;

        let parsed: CreateKeyResponse = resp
            .json()
            .await
            .map_err(|e| RunnerError::Simulation(format!("create_key body: {}", e)))?;

        parsed
            .into_key()
            .ok_or_else(|| RunnerError::Simulation("create_key: no key in response".into()))
    }

    async fn create_city(&self, key: &str, group: &str) -> Result<String> {
        let url = self.url("/v1/cities");
        let body = CreateCityRequest { group };
        let resp = self
            .call("create_city", |http| {
                http.post(&url).bearer_auth(key).json(&body)
            })
            .await?;

        let parsed: CreateCityResponse = resp
            .json()
            .await
            .map_err(|e| RunnerError::Simulation(format!("create_city body: {}", e)))?;

        parsed
            .into_id()
            .ok_or_else(|| RunnerError::Simulation("create_city: no city id in response".into()))
    }

    async fn retire_city(&self, key: &str, city_id: &str) -> Result<()> {
        let url = self.url(&format!("/v1/cities/{}", city_id));
        match self
            .call("retire_city", |http| http.delete(&url).bearer_auth(key))
            .await
        {
            Ok(_) => Ok(()),
            // Already gone upstream: retirement is idempotent
            Err(f) if f.status == Some(StatusCode::NOT_FOUND) => {
                warn!(city_id, "retire: city already gone upstream");
                Ok(())
            }
            Err(f) => Err(f.into()),
        }
    }

    async fn advance_time(&self, key: &str, city_id: &str, months: u32) -> Result<()> {
        let url = self.url(&format!("/v1/cities/{}/advance", city_id));
        let body = serde_json::json!({ "months": months });
        self.call("advance_time", |http| {
            http.post(&url).bearer_auth(key).json(&body)
        })
        .await?;
        Ok(())
    }

    async fn city_stats(&self, key: &str, city_id: &str) -> Result<CityStats> {
        let url = self.url(&format!("/v1/cities/{}", city_id));
        let resp = self
            .call("city_stats", |http| http.get(&url).bearer_auth(key))
            .await?;

        resp.json()
            .await
            .map_err(|e| RunnerError::Simulation(format!("city_stats body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_transient_classification() {
        assert!(HttpSimulationClient::is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(HttpSimulationClient::is_transient(StatusCode::BAD_GATEWAY));
        assert!(!HttpSimulationClient::is_transient(StatusCode::NOT_FOUND));
        assert!(!HttpSimulationClient::is_transient(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(400),
        };
        assert!(policy.delay(1) >= Duration::from_millis(100));
        assert!(policy.delay(3) <= Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_millis(400));
    }

    proptest! {
        #[test]
        fn prop_delay_bounded_by_cap(
            base_ms in 1u64..10_000,
            extra_ms in 0u64..50_000,
            attempt in 1u32..24,
        ) {
            let cap_ms = base_ms + extra_ms;
            let policy = RetryPolicy {
                max_attempts: 5,
                base: Duration::from_millis(base_ms),
                cap: Duration::from_millis(cap_ms),
            };
            let delay = policy.delay(attempt);
            prop_assert!(delay <= Duration::from_millis(cap_ms));
            prop_assert!(delay >= Duration::from_millis(base_ms.min(cap_ms)));
        }
    }
}
