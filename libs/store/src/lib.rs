//! Encrypted event store backing the collector.
//!
//! A single SQLite file holds three tables: registered agents, the
//! append-only event log, and the honeytoken catalog. Sensitive columns
//! (paths and metadata/data maps) are encrypted field-by-field with the
//! process cipher before they touch disk. The UNIQUE constraint on
//! `events.nonce` is the authoritative replay defence: a duplicate insert
//! fails with [`StoreError::DuplicateNonce`] no matter what the in-memory
//! nonce cache has evicted.
//!
//! The connection lives behind a mutex and every public operation runs as a
//! single committed transaction on the blocking thread pool.

mod cipher;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;
use tracing::debug;

pub use cipher::FieldCipher;
pub use hg_wire::EventType;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The nonce is already present in the events table (replay).
    #[error("duplicate nonce: {0}")]
    DuplicateNonce(String),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn internal<E>(err: E) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    StoreError::Internal(err.into())
}

/// Agent liveness states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Healthy,
    Warning,
    Triggered,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Healthy => "healthy",
            AgentStatus::Warning => "warning",
            AgentStatus::Triggered => "triggered",
            AgentStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(AgentStatus::Healthy),
            "warning" => Some(AgentStatus::Warning),
            "triggered" => Some(AgentStatus::Triggered),
            "offline" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub status: AgentStatus,
    pub last_seen: i64,
    pub registered_at: i64,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: i64,
    pub agent_id: String,
    pub token_id: String,
    pub path: String,
    pub event_type: EventType,
    pub timestamp: i64,
    pub nonce: String,
    pub data: Map<String, Value>,
}

/// Input to [`Store::insert_event`]; `timestamp` defaults to now.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub agent_id: String,
    pub token_id: String,
    pub path: String,
    pub event_type: EventType,
    pub nonce: String,
    pub timestamp: Option<i64>,
    pub data: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: String,
    pub name: String,
    pub path: String,
    pub deployed_to: Option<String>,
    pub deployed_at: i64,
    pub status: String,
    pub metadata: Map<String, Value>,
}

/// Input to [`Store::register_token`].
#[derive(Debug, Clone)]
pub struct NewToken {
    pub token_id: String,
    pub name: String,
    pub path: String,
    pub deployed_to: Option<String>,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_agents: u64,
    pub total_events: u64,
    pub total_tokens: u64,
    pub events_24h: u64,
    pub db_size_bytes: u64,
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    agent_id TEXT PRIMARY KEY,
    hostname TEXT,
    ip_address TEXT,
    status TEXT NOT NULL DEFAULT 'healthy',
    last_seen INTEGER NOT NULL,
    registered_at INTEGER NOT NULL,
    metadata TEXT
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_id TEXT NOT NULL,
    token_id TEXT,
    path TEXT,
    event_type TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    nonce TEXT UNIQUE,
    data TEXT,
    FOREIGN KEY (agent_id) REFERENCES agents(agent_id)
);

CREATE TABLE IF NOT EXISTS tokens (
    token_id TEXT PRIMARY KEY,
    name TEXT,
    path TEXT,
    deployed_to TEXT,
    deployed_at INTEGER,
    status TEXT NOT NULL DEFAULT 'active',
    metadata TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_agent ON events(agent_id);
CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp DESC);
"#;

fn now_ts() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Handle to the encrypted store; cheap to clone and share across tasks.
#[derive(Clone)]
pub struct Store {
    conn: Arc<StdMutex<Connection>>,
    cipher: Arc<FieldCipher>,
    path: PathBuf,
}

pub type SharedStore = Arc<Store>;

impl Store {
    /// Opens (creating if needed) the database at `path`, deriving the field
    /// encryption key from `passphrase`.
    pub async fn open(path: impl AsRef<Path>, passphrase: &str) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let passphrase = passphrase.to_string();
        spawn_blocking(move || Self::open_blocking(path, &passphrase))
            .await
            .map_err(internal)?
    }

    fn open_blocking(path: PathBuf, passphrase: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(internal)?;
            }
        }
        let conn = Connection::open(&path).map_err(internal)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(internal)?;
        conn.execute_batch(SCHEMA_SQL).map_err(internal)?;
        debug!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Arc::new(StdMutex::new(conn)),
            cipher: Arc::new(FieldCipher::derive(passphrase)),
            path,
        })
    }

    async fn with_conn<F, T>(&self, func: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection, &FieldCipher) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let cipher = Arc::clone(&self.cipher);
        spawn_blocking(move || {
            let mut guard = conn.lock().unwrap();
            func(&mut guard, &cipher)
        })
        .await
        .map_err(internal)?
    }

    // --- agents ---

    /// Upserts an agent row. `registered_at` is set on first contact only;
    /// every call refreshes `last_seen`.
    pub async fn register_agent(
        &self,
        agent_id: &str,
        hostname: Option<String>,
        ip_address: Option<String>,
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn, cipher| {
            let metadata_json = serde_json::to_string(&metadata).map_err(internal)?;
            let encrypted = cipher.encrypt(&metadata_json)?;
            let now = now_ts();
            conn.execute(
                "INSERT INTO agents (agent_id, hostname, ip_address, last_seen, registered_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(agent_id) DO UPDATE SET
                     hostname = excluded.hostname,
                     ip_address = excluded.ip_address,
                     last_seen = excluded.last_seen,
                     metadata = excluded.metadata",
                params![agent_id, hostname, ip_address, now, now, encrypted],
            )
            .map_err(internal)?;
            Ok(())
        })
        .await
    }

    /// Sets the agent status and refreshes `last_seen`. Returns whether a
    /// row was updated.
    pub async fn update_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<bool, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn, _| {
            let changed = conn
                .execute(
                    "UPDATE agents SET status = ?1, last_seen = ?2 WHERE agent_id = ?3",
                    params![status.as_str(), now_ts(), agent_id],
                )
                .map_err(internal)?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StoreError> {
        let agent_id = agent_id.to_string();
        self.with_conn(move |conn, cipher| {
            let row = conn
                .query_row(
                    "SELECT agent_id, hostname, ip_address, status, last_seen, registered_at, metadata
                     FROM agents WHERE agent_id = ?1",
                    params![agent_id],
                    agent_row,
                )
                .optional()
                .map_err(internal)?;
            row.map(|raw| raw.decrypt(cipher)).transpose()
        })
        .await
    }

    pub async fn get_all_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        self.with_conn(move |conn, cipher| {
            let mut stmt = conn
                .prepare(
                    "SELECT agent_id, hostname, ip_address, status, last_seen, registered_at, metadata
                     FROM agents ORDER BY agent_id",
                )
                .map_err(internal)?;
            let rows = stmt
                .query_map([], agent_row)
                .map_err(internal)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(internal)?;
            rows.into_iter().map(|raw| raw.decrypt(cipher)).collect()
        })
        .await
    }

    // --- events ---

    /// Appends an event. Fails with [`StoreError::DuplicateNonce`] when the
    /// nonce already exists; on success the reporting agent transitions to
    /// `warning` in the same transaction.
    pub async fn insert_event(&self, event: NewEvent) -> Result<i64, StoreError> {
        self.with_conn(move |conn, cipher| {
            let encrypted_path = cipher.encrypt(&event.path)?;
            let data_json = serde_json::to_string(&event.data).map_err(internal)?;
            let encrypted_data = cipher.encrypt(&data_json)?;
            let timestamp = event.timestamp.unwrap_or_else(now_ts);

            let tx = conn.transaction().map_err(internal)?;
            let inserted = tx.execute(
                "INSERT INTO events (agent_id, token_id, path, event_type, timestamp, nonce, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.agent_id,
                    event.token_id,
                    encrypted_path,
                    event.event_type.as_str(),
                    timestamp,
                    event.nonce,
                    encrypted_data
                ],
            );
            match inserted {
                Ok(_) => {}
                Err(rusqlite::Error::SqliteFailure(err, Some(msg)))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation
                        && msg.contains("events.nonce") =>
                {
                    return Err(StoreError::DuplicateNonce(event.nonce));
                }
                Err(err) => return Err(internal(err)),
            }
            let event_id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE agents SET status = ?1, last_seen = ?2 WHERE agent_id = ?3",
                params![AgentStatus::Warning.as_str(), now_ts(), event.agent_id],
            )
            .map_err(internal)?;
            tx.commit().map_err(internal)?;
            Ok(event_id)
        })
        .await
    }

    pub async fn get_event(&self, event_id: i64) -> Result<Option<EventRecord>, StoreError> {
        self.with_conn(move |conn, cipher| {
            let row = conn
                .query_row(
                    "SELECT id, agent_id, token_id, path, event_type, timestamp, nonce, data
                     FROM events WHERE id = ?1",
                    params![event_id],
                    event_row,
                )
                .optional()
                .map_err(internal)?;
            row.map(|raw| raw.decrypt(cipher)).transpose()
        })
        .await
    }

    /// Most recent events first, optionally filtered to one agent.
    pub async fn get_recent_events(
        &self,
        limit: u32,
        agent_id: Option<&str>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let agent_id = agent_id.map(str::to_string);
        self.with_conn(move |conn, cipher| {
            let rows = match agent_id {
                Some(agent) => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, agent_id, token_id, path, event_type, timestamp, nonce, data
                             FROM events WHERE agent_id = ?1
                             ORDER BY timestamp DESC LIMIT ?2",
                        )
                        .map_err(internal)?;
                    stmt.query_map(params![agent, limit], event_row)
                        .map_err(internal)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(internal)?
                }
                None => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, agent_id, token_id, path, event_type, timestamp, nonce, data
                             FROM events ORDER BY timestamp DESC LIMIT ?1",
                        )
                        .map_err(internal)?;
                    stmt.query_map(params![limit], event_row)
                        .map_err(internal)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(internal)?
                }
            };
            rows.into_iter().map(|raw| raw.decrypt(cipher)).collect()
        })
        .await
    }

    pub async fn get_events_by_timerange(
        &self,
        start: i64,
        end: i64,
        agent_id: Option<&str>,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let agent_id = agent_id.map(str::to_string);
        self.with_conn(move |conn, cipher| {
            let rows = match agent_id {
                Some(agent) => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, agent_id, token_id, path, event_type, timestamp, nonce, data
                             FROM events
                             WHERE timestamp >= ?1 AND timestamp <= ?2 AND agent_id = ?3
                             ORDER BY timestamp DESC",
                        )
                        .map_err(internal)?;
                    stmt.query_map(params![start, end, agent], event_row)
                        .map_err(internal)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(internal)?
                }
                None => {
                    let mut stmt = conn
                        .prepare(
                            "SELECT id, agent_id, token_id, path, event_type, timestamp, nonce, data
                             FROM events
                             WHERE timestamp >= ?1 AND timestamp <= ?2
                             ORDER BY timestamp DESC",
                        )
                        .map_err(internal)?;
                    stmt.query_map(params![start, end], event_row)
                        .map_err(internal)?
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(internal)?
                }
            };
            rows.into_iter().map(|raw| raw.decrypt(cipher)).collect()
        })
        .await
    }

    // --- tokens ---

    /// Upserts a honeytoken catalog entry.
    pub async fn register_token(&self, token: NewToken) -> Result<(), StoreError> {
        self.with_conn(move |conn, cipher| {
            let encrypted_path = cipher.encrypt(&token.path)?;
            let metadata_json = serde_json::to_string(&token.metadata).map_err(internal)?;
            let encrypted_metadata = cipher.encrypt(&metadata_json)?;
            conn.execute(
                "INSERT INTO tokens (token_id, name, path, deployed_to, deployed_at, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(token_id) DO UPDATE SET
                     name = excluded.name,
                     path = excluded.path,
                     deployed_to = excluded.deployed_to,
                     deployed_at = excluded.deployed_at,
                     metadata = excluded.metadata",
                params![
                    token.token_id,
                    token.name,
                    encrypted_path,
                    token.deployed_to,
                    now_ts(),
                    encrypted_metadata
                ],
            )
            .map_err(internal)?;
            Ok(())
        })
        .await
    }

    pub async fn get_token(&self, token_id: &str) -> Result<Option<TokenRecord>, StoreError> {
        let token_id = token_id.to_string();
        self.with_conn(move |conn, cipher| {
            let row = conn
                .query_row(
                    "SELECT token_id, name, path, deployed_to, deployed_at, status, metadata
                     FROM tokens WHERE token_id = ?1",
                    params![token_id],
                    token_row,
                )
                .optional()
                .map_err(internal)?;
            row.map(|raw| raw.decrypt(cipher)).transpose()
        })
        .await
    }

    // --- stats ---

    pub async fn get_stats(&self) -> Result<StoreStats, StoreError> {
        let path = self.path.clone();
        self.with_conn(move |conn, _| {
            let count = |sql: &str, params: &[&dyn rusqlite::ToSql]| -> Result<u64, StoreError> {
                conn.query_row(sql, params, |row| row.get::<_, i64>(0))
                    .map(|n| n.max(0) as u64)
                    .map_err(internal)
            };
            let day_ago = now_ts() - 86_400;
            Ok(StoreStats {
                total_agents: count("SELECT COUNT(*) FROM agents", &[])?,
                total_events: count("SELECT COUNT(*) FROM events", &[])?,
                total_tokens: count("SELECT COUNT(*) FROM tokens", &[])?,
                events_24h: count("SELECT COUNT(*) FROM events WHERE timestamp > ?1", &[&day_ago])?,
                db_size_bytes: std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0),
            })
        })
        .await
    }
}

// --- row decoding ---

struct RawAgent {
    agent_id: String,
    hostname: Option<String>,
    ip_address: Option<String>,
    status: String,
    last_seen: i64,
    registered_at: i64,
    metadata: Option<String>,
}

fn agent_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAgent> {
    Ok(RawAgent {
        agent_id: row.get(0)?,
        hostname: row.get(1)?,
        ip_address: row.get(2)?,
        status: row.get(3)?,
        last_seen: row.get(4)?,
        registered_at: row.get(5)?,
        metadata: row.get(6)?,
    })
}

impl RawAgent {
    fn decrypt(self, cipher: &FieldCipher) -> Result<AgentRecord, StoreError> {
        let status = AgentStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Internal(anyhow::anyhow!("unknown agent status: {}", self.status))
        })?;
        Ok(AgentRecord {
            agent_id: self.agent_id,
            hostname: self.hostname,
            ip_address: self.ip_address,
            status,
            last_seen: self.last_seen,
            registered_at: self.registered_at,
            metadata: decrypt_map(cipher, self.metadata)?,
        })
    }
}

struct RawEvent {
    id: i64,
    agent_id: String,
    token_id: String,
    path: String,
    event_type: String,
    timestamp: i64,
    nonce: String,
    data: Option<String>,
}

fn event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEvent> {
    Ok(RawEvent {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        token_id: row.get(2)?,
        path: row.get(3)?,
        event_type: row.get(4)?,
        timestamp: row.get(5)?,
        nonce: row.get(6)?,
        data: row.get(7)?,
    })
}

impl RawEvent {
    fn decrypt(self, cipher: &FieldCipher) -> Result<EventRecord, StoreError> {
        let event_type = EventType::parse(&self.event_type).ok_or_else(|| {
            StoreError::Internal(anyhow::anyhow!("unknown event type: {}", self.event_type))
        })?;
        Ok(EventRecord {
            id: self.id,
            agent_id: self.agent_id,
            token_id: self.token_id,
            path: cipher.decrypt(&self.path)?,
            event_type,
            timestamp: self.timestamp,
            nonce: self.nonce,
            data: decrypt_map(cipher, self.data)?,
        })
    }
}

struct RawToken {
    token_id: String,
    name: String,
    path: String,
    deployed_to: Option<String>,
    deployed_at: i64,
    status: String,
    metadata: Option<String>,
}

fn token_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawToken> {
    Ok(RawToken {
        token_id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        deployed_to: row.get(3)?,
        deployed_at: row.get(4)?,
        status: row.get(5)?,
        metadata: row.get(6)?,
    })
}

impl RawToken {
    fn decrypt(self, cipher: &FieldCipher) -> Result<TokenRecord, StoreError> {
        Ok(TokenRecord {
            token_id: self.token_id,
            name: self.name,
            path: cipher.decrypt(&self.path)?,
            deployed_to: self.deployed_to,
            deployed_at: self.deployed_at,
            status: self.status,
            metadata: decrypt_map(cipher, self.metadata)?,
        })
    }
}

fn decrypt_map(
    cipher: &FieldCipher,
    blob: Option<String>,
) -> Result<Map<String, Value>, StoreError> {
    match blob {
        Some(blob) if !blob.is_empty() => {
            let json = cipher.decrypt(&blob)?;
            serde_json::from_str(&json).map_err(internal)
        }
        _ => Ok(Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path().join("honeygrid.db"), "test-passphrase")
            .await
            .unwrap();
        (dir, store)
    }

    fn metadata(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn sample_event(agent: &str, nonce: &str) -> NewEvent {
        NewEvent {
            agent_id: agent.into(),
            token_id: "token-abc".into(),
            path: "/srv/decoys/payroll.xlsx".into(),
            event_type: EventType::Opened,
            nonce: nonce.into(),
            timestamp: None,
            data: metadata(&[("process_name", json!("cat"))]),
        }
    }

    #[tokio::test]
    async fn register_and_fetch_agent() {
        let (_dir, store) = open_store().await;
        store
            .register_agent(
                "agent-001",
                Some("ws-1".into()),
                Some("10.0.0.5".into()),
                metadata(&[("port", json!(40123))]),
            )
            .await
            .unwrap();

        let agent = store.get_agent("agent-001").await.unwrap().unwrap();
        assert_eq!(agent.agent_id, "agent-001");
        assert_eq!(agent.hostname.as_deref(), Some("ws-1"));
        assert_eq!(agent.status, AgentStatus::Healthy);
        assert_eq!(agent.metadata["port"], json!(40123));
        assert!(agent.registered_at > 0);
    }

    #[tokio::test]
    async fn reregister_keeps_registered_at() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        // Backdate the row, then upsert again.
        store
            .with_conn(|conn, _| {
                conn.execute(
                    "UPDATE agents SET registered_at = 1000, last_seen = 1000 WHERE agent_id = 'agent-001'",
                    [],
                )
                .map_err(internal)?;
                Ok(())
            })
            .await
            .unwrap();
        store
            .register_agent("agent-001", Some("renamed".into()), None, Map::new())
            .await
            .unwrap();

        let agent = store.get_agent("agent-001").await.unwrap().unwrap();
        assert_eq!(agent.registered_at, 1000);
        assert!(agent.last_seen > 1000);
        assert_eq!(agent.hostname.as_deref(), Some("renamed"));
    }

    #[tokio::test]
    async fn update_status_refreshes_last_seen() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        assert!(
            store
                .update_agent_status("agent-001", AgentStatus::Offline)
                .await
                .unwrap()
        );
        let agent = store.get_agent("agent-001").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);

        assert!(
            !store
                .update_agent_status("agent-404", AgentStatus::Healthy)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn insert_event_roundtrip_and_warning_transition() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();

        let id = store
            .insert_event(sample_event("agent-001", "nonce-1"))
            .await
            .unwrap();
        assert!(id > 0);

        let event = store.get_event(id).await.unwrap().unwrap();
        assert_eq!(event.path, "/srv/decoys/payroll.xlsx");
        assert_eq!(event.event_type, EventType::Opened);
        assert_eq!(event.data["process_name"], json!("cat"));

        let agent = store.get_agent("agent-001").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Warning);
    }

    #[tokio::test]
    async fn duplicate_nonce_rejected() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        store
            .insert_event(sample_event("agent-001", "nonce-dup"))
            .await
            .unwrap();

        let err = store
            .insert_event(sample_event("agent-001", "nonce-dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateNonce(n) if n == "nonce-dup"));

        let events = store.get_recent_events(10, None).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn sensitive_columns_are_ciphertext_on_disk() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        store
            .insert_event(sample_event("agent-001", "nonce-1"))
            .await
            .unwrap();

        let raw_path: String = store
            .with_conn(|conn, _| {
                conn.query_row("SELECT path FROM events LIMIT 1", [], |row| row.get(0))
                    .map_err(internal)
            })
            .await
            .unwrap();
        assert_ne!(raw_path, "/srv/decoys/payroll.xlsx");
        assert!(!raw_path.contains("payroll"));
    }

    #[tokio::test]
    async fn recent_events_ordering_limit_and_filter() {
        let (_dir, store) = open_store().await;
        for agent in ["agent-001", "agent-002"] {
            store
                .register_agent(agent, None, None, Map::new())
                .await
                .unwrap();
        }
        for i in 0..5i64 {
            let mut ev = sample_event("agent-001", &format!("n-a-{i}"));
            ev.timestamp = Some(1000 + i);
            store.insert_event(ev).await.unwrap();
        }
        let mut other = sample_event("agent-002", "n-b-0");
        other.timestamp = Some(2000);
        store.insert_event(other).await.unwrap();

        let recent = store.get_recent_events(3, None).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].timestamp, 2000);
        assert!(recent.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));

        let only_a = store
            .get_recent_events(10, Some("agent-001"))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 5);
        assert!(only_a.iter().all(|e| e.agent_id == "agent-001"));
    }

    #[tokio::test]
    async fn timerange_query() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        for (i, ts) in [1000i64, 2000, 3000].iter().enumerate() {
            let mut ev = sample_event("agent-001", &format!("n-{i}"));
            ev.timestamp = Some(*ts);
            store.insert_event(ev).await.unwrap();
        }

        let mid = store
            .get_events_by_timerange(1500, 2500, None)
            .await
            .unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].timestamp, 2000);
    }

    #[tokio::test]
    async fn event_with_unknown_token_accepted() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        let mut ev = sample_event("agent-001", "n-1");
        ev.token_id = "never-registered".into();
        assert!(store.insert_event(ev).await.is_ok());
    }

    #[tokio::test]
    async fn token_upsert_and_decrypt() {
        let (_dir, store) = open_store().await;
        let token = NewToken {
            token_id: "token-abc".into(),
            name: "Payroll decoy".into(),
            path: "/srv/decoys/payroll.xlsx".into(),
            deployed_to: Some("agent-001".into()),
            metadata: metadata(&[("campaign", json!("q3"))]),
        };
        store.register_token(token.clone()).await.unwrap();

        let fetched = store.get_token("token-abc").await.unwrap().unwrap();
        assert_eq!(fetched.path, "/srv/decoys/payroll.xlsx");
        assert_eq!(fetched.status, "active");
        assert_eq!(fetched.metadata["campaign"], json!("q3"));

        let mut renamed = token;
        renamed.name = "Payroll decoy v2".into();
        store.register_token(renamed).await.unwrap();
        let fetched = store.get_token("token-abc").await.unwrap().unwrap();
        assert_eq!(fetched.name, "Payroll decoy v2");
    }

    #[tokio::test]
    async fn stats_counts() {
        let (_dir, store) = open_store().await;
        store
            .register_agent("agent-001", None, None, Map::new())
            .await
            .unwrap();
        store
            .insert_event(sample_event("agent-001", "n-now"))
            .await
            .unwrap();
        let mut old = sample_event("agent-001", "n-old");
        old.timestamp = Some(now_ts() - 2 * 86_400);
        store.insert_event(old).await.unwrap();
        store
            .register_token(NewToken {
                token_id: "t-1".into(),
                name: "t".into(),
                path: "/x".into(),
                deployed_to: None,
                metadata: Map::new(),
            })
            .await
            .unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total_agents, 1);
        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.total_tokens, 1);
        assert_eq!(stats.events_24h, 1);
        assert!(stats.db_size_bytes > 0);
    }

    #[tokio::test]
    async fn reopen_with_same_passphrase_reads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("honeygrid.db");
        {
            let store = Store::open(&path, "pw").await.unwrap();
            store
                .register_agent("agent-001", None, None, Map::new())
                .await
                .unwrap();
            store
                .insert_event(sample_event("agent-001", "n-1"))
                .await
                .unwrap();
        }
        let store = Store::open(&path, "pw").await.unwrap();
        let events = store.get_recent_events(10, None).await.unwrap();
        assert_eq!(events[0].path, "/srv/decoys/payroll.xlsx");
    }

    #[tokio::test]
    async fn reopen_with_wrong_passphrase_fails_decryption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("honeygrid.db");
        {
            let store = Store::open(&path, "pw").await.unwrap();
            store
                .register_agent("agent-001", None, None, Map::new())
                .await
                .unwrap();
            store
                .insert_event(sample_event("agent-001", "n-1"))
                .await
                .unwrap();
        }
        let store = Store::open(&path, "wrong").await.unwrap();
        assert!(matches!(
            store.get_recent_events(10, None).await,
            Err(StoreError::Crypto(_))
        ));
    }
}
