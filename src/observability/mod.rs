// src/observability/mod.rs
//! Tracing and metrics initialisation
//!
//! Call both once at process startup, before any component spawns tasks.

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{Result, RunnerError};
use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Filter comes from `RUNNER_LOG` (default `info`). JSON output is for
/// machine-collected runs; the console format is the default.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_env("RUNNER_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| RunnerError::Config(format!("tracing init failed: {}", e)))
}

/// Install the Prometheus metrics exporter when configured.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    let Some(listen) = &config.prometheus_listen else {
        return Ok(());
    };

    let addr: std::net::SocketAddr = listen
        .parse()
        .map_err(|e| RunnerError::Config(format!("bad prometheus_listen '{}': {}", listen, e)))?;

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| RunnerError::Config(format!("metrics exporter failed: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_listen_addr_rejected() {
        let config = ObservabilityConfig {
            json_logs: false,
            prometheus_listen: Some("not-an-addr".to_string()),
        };
        assert!(init_metrics(&config).is_err());
    }

    #[test]
    fn test_metrics_disabled_by_default() {
        let config = ObservabilityConfig {
            json_logs: false,
            prometheus_listen: None,
        };
        assert!(init_metrics(&config).is_ok());
    }
}
