//! Beacon Storage -- rusqlite persistence for the mesh.
//!
//! Two concerns survive a restart: the list of confirmed connections and the
//! per-event trust anchors. Dedup caches and the live profile table are
//! in-memory only and never touch this crate.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::broadcast;

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch { expected: u32, found: u32 },
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionRow {
    pub peer_id: String,
    pub connected_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustAnchorRow {
    pub event_id: String,
    pub host_id: String,
    pub locked_at: String,
}

/// Change notification for the confirmed-connections list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionChange {
    Added(String),
    Removed(String),
}

/// Confirmed-connections store.
pub trait ConnectionStore: Send + Sync {
    fn is_connected(&self, peer_id: &str) -> Result<bool>;
    fn add_connection(&self, peer_id: &str) -> Result<()>;
    fn remove_connection(&self, peer_id: &str) -> Result<bool>;
    fn list_connections(&self) -> Result<Vec<ConnectionRow>>;
    fn subscribe(&self) -> broadcast::Receiver<ConnectionChange>;
}

/// Durable `event_id -> host_id` trust anchors.
pub trait TrustAnchorStore: Send + Sync {
    /// Lock `event_id` to `host_id` unless already locked. Returns the host
    /// the event is locked to after the call.
    fn lock_anchor(&self, event_id: &str, host_id: &str) -> Result<String>;
    fn anchor(&self, event_id: &str) -> Result<Option<String>>;
    fn clear_anchor(&self, event_id: &str) -> Result<bool>;
    fn list_anchors(&self) -> Result<Vec<TrustAnchorRow>>;
}

/// SQLite-backed storage.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    db_path: Option<PathBuf>,
    changes: broadcast::Sender<ConnectionChange>,
}

impl SqliteStorage {
    fn db(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let storage = Self::from_connection(conn, Some(db_path.to_path_buf()));
        storage.ensure_schema()?;
        tracing::debug!(db = %db_path.display(), "storage: opened");
        Ok(storage)
    }

    /// Private in-memory database (tests, ephemeral nodes).
    pub fn open_in_memory() -> Result<Self> {
        let storage = Self::from_connection(Connection::open_in_memory()?, None);
        storage.ensure_schema()?;
        Ok(storage)
    }

    fn from_connection(conn: Connection, db_path: Option<PathBuf>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            conn: Mutex::new(conn),
            db_path,
            changes,
        }
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.db()?;
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='schema_version'",
            [],
            |row| row.get(0),
        )?;

        if !table_exists {
            conn.execute_batch(include_str!("schema_v1.sql"))?;
            tracing::info!(version = SCHEMA_VERSION, "storage: initialised schema");
        }

        let version: u32 = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?
            .unwrap_or(0);

        if version != SCHEMA_VERSION {
            return Err(StorageError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION,
                found: version,
            });
        }

        Ok(())
    }

    fn notify(&self, change: ConnectionChange) {
        // No subscribers is fine.
        let _ = self.changes.send(change);
    }
}

impl ConnectionStore for SqliteStorage {
    fn is_connected(&self, peer_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let found: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM connections WHERE peer_id = ?1",
            params![peer_id],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    fn add_connection(&self, peer_id: &str) -> Result<()> {
        let inserted = {
            let conn = self.db()?;
            conn.execute(
                "INSERT OR IGNORE INTO connections (peer_id) VALUES (?1)",
                params![peer_id],
            )?
        };
        if inserted > 0 {
            tracing::info!(peer = peer_id, "storage: connection added");
            self.notify(ConnectionChange::Added(peer_id.to_string()));
        }
        Ok(())
    }

    fn remove_connection(&self, peer_id: &str) -> Result<bool> {
        let changes = {
            let conn = self.db()?;
            conn.execute("DELETE FROM connections WHERE peer_id = ?1", params![peer_id])?
        };
        if changes > 0 {
            tracing::info!(peer = peer_id, "storage: connection removed");
            self.notify(ConnectionChange::Removed(peer_id.to_string()));
        }
        Ok(changes > 0)
    }

    fn list_connections(&self) -> Result<Vec<ConnectionRow>> {
        let conn = self.db()?;
        let mut stmt =
            conn.prepare("SELECT peer_id, connected_at FROM connections ORDER BY peer_id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ConnectionRow {
                    peer_id: row.get(0)?,
                    connected_at: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn subscribe(&self) -> broadcast::Receiver<ConnectionChange> {
        self.changes.subscribe()
    }
}

impl TrustAnchorStore for SqliteStorage {
    fn lock_anchor(&self, event_id: &str, host_id: &str) -> Result<String> {
        let conn = self.db()?;
        conn.execute(
            "INSERT OR IGNORE INTO trust_anchors (event_id, host_id) VALUES (?1, ?2)",
            params![event_id, host_id],
        )?;
        let locked: String = conn.query_row(
            "SELECT host_id FROM trust_anchors WHERE event_id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        Ok(locked)
    }

    fn anchor(&self, event_id: &str) -> Result<Option<String>> {
        let conn = self.db()?;
        let host = conn
            .query_row(
                "SELECT host_id FROM trust_anchors WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(host)
    }

    fn clear_anchor(&self, event_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let changes = conn.execute(
            "DELETE FROM trust_anchors WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(changes > 0)
    }

    fn list_anchors(&self) -> Result<Vec<TrustAnchorRow>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, host_id, locked_at FROM trust_anchors ORDER BY event_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(TrustAnchorRow {
                    event_id: row.get(0)?,
                    host_id: row.get(1)?,
                    locked_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
