// src/runner/mod.rs
//! Experiment orchestration runtime
//!
//! This module owns the whole life of an experiment pair:
//!
//! - **Provisioning**: city and credential lifecycle
//! - **Workspace**: isolated per-agent directories with injected secrets
//! - **Sandbox**: containerized agent processes under watchdog supervision
//! - **Pacer**: the single authority advancing simulated time
//! - **Healthcheck / Usage**: independent background pollers
//! - **Pair / Coordinator**: the pair state machine and N-pair sequencing
//!
//! # Architecture
//!
//! ```text
//! ExperimentCoordinator
//! └─ PairRunner (one pair at a time)
//!    ├─ Provisioner ──────────► Simulation API
//!    ├─ SandboxLauncher ×2 ───► container runtime
//!    ├─ TimePacer ────────────► advance_time for the active set
//!    ├─ HealthCheckMonitor ───► city_stats  → healthcheck.jsonl
//!    └─ ResourceUsageTracker ─► usage meters → <agent>/usage.jsonl
//!                 ▲
//!                 └── ActiveRegistry (shared, snapshot reads)
//! ```

pub mod agent;
pub mod coordinator;
pub mod healthcheck;
pub mod pacer;
pub mod pair;
pub mod provisioning;
pub mod sandbox;
pub mod usage;
pub mod workspace;

// Re-export commonly used types
pub use agent::{AgentRecord, AgentSpec, City, CityState, Credential, Group, PairRecord, TerminalStatus};
pub use coordinator::{ExperimentCoordinator, ExperimentSummary};
pub use healthcheck::{HealthCheckMonitor, HealthSnapshot};
pub use pacer::TimePacer;
pub use pair::{PairRunner, PairState};
pub use provisioning::Provisioner;
pub use sandbox::{SandboxHandle, SandboxLauncher};
pub use usage::{ResourceUsageTracker, UsageMeter, UsageSample, UsageTarget};
pub use workspace::Workspace;
