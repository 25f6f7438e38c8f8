// src/utils/errors.rs
//! Error taxonomy for the experiment runner
//!
//! One variant per failure domain so callers can route on it:
//! provisioning and simulation errors are fatal to a pair, poll errors
//! are contained per-target, store errors abort the current pair only.

use std::time::Duration;
use thiserror::Error;

/// Runner-wide error type
#[derive(Debug, Error)]
pub enum RunnerError {
    /// City or credential creation/retirement failed upstream
    #[error("provisioning failed: {0}")]
    Provisioning(String),

    /// Simulation API call failed (non-transient, not retried)
    #[error("simulation api error: {0}")]
    Simulation(String),

    /// Sandbox launch, stream, or exit failure
    #[error("sandbox failure: {0}")]
    Sandbox(String),

    /// A watchdog fired before the process finished
    #[error("watchdog fired after {0:?}")]
    Timeout(Duration),

    /// A single health-check or usage sample failed
    #[error("poll failed: {0}")]
    Poll(String),

    /// Shared-state read/write failure
    #[error("store failure: {0}")]
    Store(String),

    /// Invalid or unloadable configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Underlying I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RunnerError::Provisioning("quota exceeded".into());
        assert_eq!(err.to_string(), "provisioning failed: quota exceeded");

        let err = RunnerError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RunnerError = io.into();
        assert!(matches!(err, RunnerError::Io(_)));
    }
}
