// src/runner/provisioning.rs
//! City and credential provisioning
//!
//! Cities are created under one shared runner account; each agent
//! additionally gets its own scoped credential, minted here and consumed
//! by workspace preparation. Nothing touches the active registry on the
//! create path, so a failed create can never leave a half-created city
//! visible to the pacer.

use crate::runner::agent::{City, CityState, Credential, Group};
use crate::simulation::client::SimulationApi;
use crate::store::StateStore;
use crate::utils::errors::{Result, RunnerError};
use std::sync::Arc;
use tracing::{info, warn};

/// Creates and retires cities, owning their lifecycle state
pub struct Provisioner {
    api: Arc<dyn SimulationApi>,
    store: Arc<StateStore>,

    /// Shared account credential used for all runner-side calls
    runner_key: String,
}

impl Provisioner {
    /// Reuse the pooled runner credential, or mint and pool a new one.
    pub async fn bootstrap(api: Arc<dyn SimulationApi>, store: Arc<StateStore>) -> Result<Self> {
        let runner_key = match store.first_pool_key().await? {
            Some(key) => {
                info!(key = %redact(&key), "reusing pooled runner credential");
                key
            }
            None => {
                info!("no pooled credential - minting a new runner key");
                let key = api
                    .create_key()
                    .await
                    .map_err(|e| RunnerError::Provisioning(format!("runner key: {}", e)))?;
                store.push_pool_key(&key).await?;
                info!(key = %redact(&key), "runner credential pooled");
                key
            }
        };

        Ok(Self {
            api,
            store,
            runner_key,
        })
    }

    /// Shared account key for pacer/monitor/retire calls
    pub fn runner_key(&self) -> &str {
        &self.runner_key
    }

    /// Create one city plus its agent-scoped credential.
    ///
    /// Upstream failure surfaces as `ProvisioningError`; no registry entry
    /// exists until the pair runner registers the city at launch.
    pub async fn create(
        &self,
        pair_index: u32,
        group: Group,
        group_label: &str,
    ) -> Result<(City, Credential)> {
        let scoped = self
            .api
            .create_key()
            .await
            .map_err(|e| RunnerError::Provisioning(format!("scoped credential: {}", e)))?;
        let credential = Credential::new(scoped);

        let city_id = self
            .api
            .create_city(&self.runner_key, group_label)
            .await
            .map_err(|e| RunnerError::Provisioning(format!("create city: {}", e)))?;

        let city = City::new(city_id, pair_index, group, group_label);
        info!(
            city_id = %city.city_id,
            pair_index,
            group = %group_label,
            credential = %credential.redacted(),
            "city provisioned"
        );

        Ok((city, credential))
    }

    /// Retire a city: deregister it from the active set first, then free the
    /// upstream slot. Idempotent - retiring a retired city is a no-op, and an
    /// upstream "already gone" is logged, not failed.
    pub async fn retire(&self, city: &mut City) -> Result<()> {
        if city.state == CityState::Retired {
            warn!(city_id = %city.city_id, "retire called twice; skipping");
            return Ok(());
        }

        city.state = CityState::Retiring;

        // Removal precedes the upstream call so the pacer and the pollers
        // stop covering this city before it can disappear under them.
        self.store.deregister_active(&city.city_id).await?;

        self.api
            .retire_city(&self.runner_key, &city.city_id)
            .await
            .map_err(|e| RunnerError::Provisioning(format!("retire city {}: {}", city.city_id, e)))?;

        city.state = CityState::Retired;
        info!(city_id = %city.city_id, "city retired");
        Ok(())
    }
}

fn redact(key: &str) -> String {
    let end = key.len().min(8);
    format!("{}...", &key[..end])
}
