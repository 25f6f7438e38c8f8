// src/store/registry.rs
//! In-process active-city registry
//!
//! The one piece of state mutated by more than one component. Inserts and
//! removals happen under a single write lock; the pacer and the pollers only
//! ever take consistent snapshots, so a city retiring mid-tick is either
//! fully in the snapshot or fully absent.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One city currently eligible for time advancement and polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTarget {
    /// Owning agent, e.g. "a-03"
    pub agent_id: String,

    /// Simulation city identifier
    pub city_id: String,

    /// Intent group label
    pub group: String,

    /// When the entry became visible to the background loops
    pub registered_at: DateTime<Utc>,
}

impl ActiveTarget {
    pub fn new(agent_id: &str, city_id: &str, group: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            city_id: city_id.to_string(),
            group: group.to_string(),
            registered_at: Utc::now(),
        }
    }
}

/// Cloneable handle to the shared registry
#[derive(Debug, Clone, Default)]
pub struct ActiveRegistry {
    inner: Arc<RwLock<HashMap<String, ActiveTarget>>>,
}

impl ActiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a target, keyed by city id. Replaces any stale entry.
    pub fn insert(&self, target: ActiveTarget) {
        self.inner.write().insert(target.city_id.clone(), target);
    }

    /// Remove a city; returns the entry if it was present.
    pub fn remove(&self, city_id: &str) -> Option<ActiveTarget> {
        self.inner.write().remove(city_id)
    }

    /// Consistent copy of the current active set, ordered by agent id so
    /// log output is stable.
    pub fn snapshot(&self) -> Vec<ActiveTarget> {
        let mut targets: Vec<ActiveTarget> = self.inner.read().values().cloned().collect();
        targets.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        targets
    }

    /// Whether an agent currently has an active city
    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.inner.read().values().any(|t| t.agent_id == agent_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_remove() {
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));
        registry.insert(ActiveTarget::new("b-01", "city-b", "value"));
        assert_eq!(registry.len(), 2);

        let removed = registry.remove("city-a");
        assert_eq!(removed.unwrap().agent_id, "a-01");
        assert_eq!(registry.len(), 1);

        // Second removal is a no-op
        assert!(registry.remove("city-a").is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));

        let snap = registry.snapshot();
        registry.remove("city-a");

        // Snapshot taken before removal is unaffected
        assert_eq!(snap.len(), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_snapshot_ordering() {
        let registry = ActiveRegistry::new();
        registry.insert(ActiveTarget::new("b-01", "city-b", "value"));
        registry.insert(ActiveTarget::new("a-01", "city-a", "metric"));

        let snap = registry.snapshot();
        assert_eq!(snap[0].agent_id, "a-01");
        assert_eq!(snap[1].agent_id, "b-01");
    }

    #[test]
    fn test_concurrent_mutation() {
        let registry = ActiveRegistry::new();
        let mut handles = vec![];

        for i in 0..8 {
            let reg = registry.clone();
            handles.push(std::thread::spawn(move || {
                let city = format!("city-{}", i);
                let agent = format!("a-{:02}", i);
                for _ in 0..100 {
                    reg.insert(ActiveTarget::new(&agent, &city, "metric"));
                    let _ = reg.snapshot();
                    reg.remove(&city);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
