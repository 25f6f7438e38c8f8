// src/store/state_store.rs
//! Durable shared state using SQLite
//!
//! Single source of truth for experiment metadata, per-agent records, the
//! credential pool, and the durable mirror of the active-city registry.
//! Every insert is its own transaction, so a failed write never corrupts
//! rows from previously retired pairs.

use crate::store::registry::{ActiveRegistry, ActiveTarget};
use crate::utils::config::StoreConfig;
use crate::utils::errors::{Result, RunnerError};
use rusqlite::{params, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable key-value store plus the live registry handle
pub struct StateStore {
    db: Arc<Mutex<Connection>>,
    registry: ActiveRegistry,
}

impl StateStore {
    /// Open the database, initialise the schema, and clear any active-city
    /// rows left behind by a previous run (their agents are gone).
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    RunnerError::Store(format!("store dir {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(&config.db_path)
            .map_err(|e| RunnerError::Store(format!("open {}: {}", config.db_path.display(), e)))?;

        let store = Self {
            db: Arc::new(Mutex::new(conn)),
            registry: ActiveRegistry::new(),
        };

        store.init_schema().await?;
        store.clear_stale_actives().await?;

        info!(path = %config.db_path.display(), "state store opened");
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS credential_pool (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS pair_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                pair_index INTEGER NOT NULL,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS agent_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                experiment_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                record TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS active_cities (
                city_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                group_label TEXT NOT NULL,
                registered_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_pair_experiment
                ON pair_records(experiment_id);
            CREATE INDEX IF NOT EXISTS idx_agent_experiment
                ON agent_records(experiment_id);
            "#,
        )
        .map_err(|e| RunnerError::Store(format!("schema: {}", e)))?;

        Ok(())
    }

    async fn clear_stale_actives(&self) -> Result<()> {
        let db = self.db.lock().await;
        let stale = db
            .execute("DELETE FROM active_cities", [])
            .map_err(|e| RunnerError::Store(format!("clear actives: {}", e)))?;
        if stale > 0 {
            warn!(count = stale, "cleared stale active-city rows from a previous run");
        }
        Ok(())
    }

    /// Handle to the live registry; snapshot reads never touch the database.
    pub fn registry(&self) -> ActiveRegistry {
        self.registry.clone()
    }

    // ── Generic key-value ────────────────────────────────────────────────

    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO kv (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
        .map_err(|e| RunnerError::Store(format!("put {}: {}", key, e)))?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let value = db
            .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
                row.get(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(|e| RunnerError::Store(format!("get {}: {}", key, e)))?;
        Ok(value)
    }

    // ── Credential pool (list semantics) ─────────────────────────────────

    /// Append a minted credential to the pool.
    pub async fn push_pool_key(&self, token: &str) -> Result<()> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO credential_pool (token, created_at) VALUES (?, ?)",
            params![token, chrono::Utc::now().timestamp()],
        )
        .map_err(|e| RunnerError::Store(format!("push pool key: {}", e)))?;
        Ok(())
    }

    /// Peek the oldest pooled credential without removing it.
    pub async fn first_pool_key(&self) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let token = db
            .query_row(
                "SELECT token FROM credential_pool ORDER BY id LIMIT 1",
                [],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .map_err(|e| RunnerError::Store(format!("first pool key: {}", e)))?;
        Ok(token)
    }

    // ── Active-city mirror ───────────────────────────────────────────────

    /// Register a city as active: visible to the background loops first,
    /// then mirrored durably.
    pub async fn register_active(&self, target: ActiveTarget) -> Result<()> {
        self.registry.insert(target.clone());

        let db = self.db.lock().await;
        db.execute(
            "INSERT OR REPLACE INTO active_cities
                 (city_id, agent_id, group_label, registered_at)
             VALUES (?, ?, ?, ?)",
            params![
                target.city_id,
                target.agent_id,
                target.group,
                target.registered_at.to_rfc3339(),
            ],
        )
        .map_err(|e| RunnerError::Store(format!("register {}: {}", target.city_id, e)))?;

        debug!(city_id = %target.city_id, agent_id = %target.agent_id, "city registered active");
        Ok(())
    }

    /// Remove a city from the active set. Idempotent; returns whether the
    /// in-memory entry existed.
    pub async fn deregister_active(&self, city_id: &str) -> Result<bool> {
        let was_present = self.registry.remove(city_id).is_some();

        let db = self.db.lock().await;
        db.execute("DELETE FROM active_cities WHERE city_id = ?", params![city_id])
            .map_err(|e| RunnerError::Store(format!("deregister {}: {}", city_id, e)))?;

        debug!(city_id, was_present, "city deregistered");
        Ok(was_present)
    }

    // ── Experiment records (append-only) ─────────────────────────────────

    /// Append the metadata record for one finished pair.
    pub async fn append_pair_record<T: serde::Serialize>(
        &self,
        experiment_id: &str,
        pair_index: u32,
        record: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| RunnerError::Store(format!("pair record serialize: {}", e)))?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO pair_records (experiment_id, pair_index, record, created_at)
             VALUES (?, ?, ?, ?)",
            params![experiment_id, pair_index, json, chrono::Utc::now().timestamp()],
        )
        .map_err(|e| RunnerError::Store(format!("append pair record: {}", e)))?;
        Ok(())
    }

    /// Append one agent's terminal record.
    pub async fn append_agent_record<T: serde::Serialize>(
        &self,
        experiment_id: &str,
        agent_id: &str,
        record: &T,
    ) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| RunnerError::Store(format!("agent record serialize: {}", e)))?;

        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO agent_records (experiment_id, agent_id, record, created_at)
             VALUES (?, ?, ?, ?)",
            params![experiment_id, agent_id, json, chrono::Utc::now().timestamp()],
        )
        .map_err(|e| RunnerError::Store(format!("append agent record: {}", e)))?;
        Ok(())
    }

    /// All pair records for an experiment, oldest first.
    pub async fn list_pair_records(&self, experiment_id: &str) -> Result<Vec<serde_json::Value>> {
        let db = self.db.lock().await;

        let mut stmt = db
            .prepare("SELECT record FROM pair_records WHERE experiment_id = ? ORDER BY id")
            .map_err(|e| RunnerError::Store(format!("list pair records: {}", e)))?;

        let records = stmt
            .query_map(params![experiment_id], |row| {
                let raw: String = row.get(0)?;
                Ok(raw)
            })
            .map_err(|e| RunnerError::Store(format!("list pair records: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| RunnerError::Store(format!("list pair records: {}", e)))?;

        records
            .into_iter()
            .map(|raw| {
                serde_json::from_str(&raw)
                    .map_err(|e| RunnerError::Store(format!("pair record parse: {}", e)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_store(dir: &tempfile::TempDir) -> StateStore {
        let config = StoreConfig {
            db_path: dir.path().join("test.db"),
        };
        StateStore::open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_kv_roundtrip() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        assert!(store.get("model").await.unwrap().is_none());
        store.put("model", "deepseek-chat").await.unwrap();
        assert_eq!(store.get("model").await.unwrap().unwrap(), "deepseek-chat");

        store.put("model", "other").await.unwrap();
        assert_eq!(store.get("model").await.unwrap().unwrap(), "other");
    }

    #[tokio::test]
    async fn test_credential_pool_order() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;

        assert!(store.first_pool_key().await.unwrap().is_none());
        store.push_pool_key("key-one").await.unwrap();
        store.push_pool_key("key-two").await.unwrap();
        assert_eq!(store.first_pool_key().await.unwrap().unwrap(), "key-one");
    }

    #[tokio::test]
    async fn test_register_deregister_mirror() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir).await;
        let registry = store.registry();

        store
            .register_active(ActiveTarget::new("a-01", "city-a", "metric"))
            .await
            .unwrap();
        assert_eq!(registry.len(), 1);

        assert!(store.deregister_active("city-a").await.unwrap());
        assert!(registry.is_empty());

        // Deregistering again is a logged no-op, not an error
        assert!(!store.deregister_active("city-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_pair_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("test.db"),
        };

        {
            let store = StateStore::open(&config).await.unwrap();
            store
                .append_pair_record("exp-1", 1, &json!({"pair": 1, "status": "completed"}))
                .await
                .unwrap();
        }

        let store = StateStore::open(&config).await.unwrap();
        let records = store.list_pair_records("exp-1").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["status"], "completed");
    }

    #[tokio::test]
    async fn test_stale_actives_cleared_on_open() {
        let dir = tempdir().unwrap();
        let config = StoreConfig {
            db_path: dir.path().join("test.db"),
        };

        {
            let store = StateStore::open(&config).await.unwrap();
            store
                .register_active(ActiveTarget::new("a-01", "city-a", "metric"))
                .await
                .unwrap();
            // Simulated crash: no deregister
        }

        let store = StateStore::open(&config).await.unwrap();
        assert!(store.registry().is_empty());
        assert!(!store.deregister_active("city-a").await.unwrap());
    }
}
