// src/runner/agent.rs
//! Data model for cities, agents, and their durable records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Intent group within a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Group {
    A,
    B,
}

impl Group {
    pub fn letter(&self) -> char {
        match self {
            Group::A => 'a',
            Group::B => 'b',
        }
    }

    /// Intent file name inside the agent workspace
    pub fn intent_file(&self) -> &'static str {
        match self {
            Group::A => "intent_a.txt",
            Group::B => "intent_b.txt",
        }
    }
}

/// City lifecycle; a city brackets exactly one agent's run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CityState {
    Provisioning,
    Active,
    Retiring,
    Retired,
}

/// One simulated environment instance
#[derive(Debug, Clone)]
pub struct City {
    /// Simulation-side identifier
    pub city_id: String,

    /// Owning pair
    pub pair_index: u32,

    /// Intent group
    pub group: Group,

    /// Human label for the group
    pub group_label: String,

    pub created_at: DateTime<Utc>,
    pub state: CityState,
}

impl City {
    pub fn new(city_id: String, pair_index: u32, group: Group, group_label: &str) -> Self {
        Self {
            city_id,
            pair_index,
            group,
            group_label: group_label.to_string(),
            created_at: Utc::now(),
            state: CityState::Active,
        }
    }
}

/// Terminal status of one sandboxed agent; recorded exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    TimedOut,
    Crashed,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::TimedOut => "timed_out",
            TerminalStatus::Crashed => "crashed",
        }
    }
}

/// Launch parameters for one agent
#[derive(Debug, Clone)]
pub struct AgentSpec {
    /// e.g. "a-03"
    pub agent_id: String,

    pub pair_index: u32,
    pub group: Group,
    pub group_label: String,

    /// City this agent manages
    pub city_id: String,
}

impl AgentSpec {
    pub fn new(pair_index: u32, group: Group, group_label: &str, city_id: &str) -> Self {
        Self {
            agent_id: format!("{}-{:02}", group.letter(), pair_index),
            pair_index,
            group,
            group_label: group_label.to_string(),
            city_id: city_id.to_string(),
        }
    }
}

/// Ephemeral scoped secret bound to one city.
///
/// Lives from provisioning until workspace preparation consumes it; the
/// token never reaches logs or durable records.
pub struct Credential(String);

impl Credential {
    pub fn new(token: String) -> Self {
        Self(token)
    }

    /// The raw token, for injection into the workspace only
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Loggable prefix
    pub fn redacted(&self) -> String {
        let end = self.0.len().min(8);
        format!("{}...", &self.0[..end])
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

/// Durable record of one agent's run, appended at pair retirement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub group: String,
    pub city_id: String,

    /// Terminal status, or "not_launched" when the pair failed earlier
    pub status: String,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Durable record of one finished pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRecord {
    pub pair_index: u32,
    pub experiment_id: String,

    /// "completed" when both sandboxes ran to a terminal status,
    /// "failed" when the pair aborted before running
    pub outcome: String,

    /// Reason for a failed outcome
    pub failure: Option<String>,

    /// Simulated-time advances issued while the pair ran
    pub ticks_completed: u32,

    pub agents: Vec<AgentRecord>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_id_format() {
        let spec = AgentSpec::new(3, Group::A, "metric", "city-1");
        assert_eq!(spec.agent_id, "a-03");

        let spec = AgentSpec::new(12, Group::B, "value", "city-2");
        assert_eq!(spec.agent_id, "b-12");
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("sk-supersecret-token-value".to_string());
        let debug = format!("{:?}", cred);
        assert!(!debug.contains("token-value"));
        assert!(debug.starts_with("Credential("));
    }

    #[test]
    fn test_terminal_status_serializes_snake_case() {
        let json = serde_json::to_string(&TerminalStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
    }
}
