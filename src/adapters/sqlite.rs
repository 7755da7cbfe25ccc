//! SQLite-backed store.
//!
//! A single `kv` table holds every blob. Expiry is stored as unix
//! milliseconds and filtered on read; `purge_expired` reclaims the rows.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::Store;
use crate::config::EngineConfig;
use crate::error::StoreError;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    expires_at INTEGER
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv (expires_at);
"#;

/// Store persisted to a SQLite database file
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) a database at `path`
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!(
                    "failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "Opened SQLite store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open the database configured for the engine
    pub fn open_default(config: &EngineConfig) -> Result<Self, StoreError> {
        Self::open(&config.database_path())
    }

    /// Private in-memory database
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Delete expired rows, returning how many were removed
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now],
            )
        })
        .await
    }

    /// Run a blocking closure against the connection off the async executor
    async fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
            f(&*guard).map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite task failed: {}", e)))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn get(&self, key: &str, default: &str) -> Result<String, StoreError> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        let value = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT value FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![key, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await?;

        Ok(value.unwrap_or_else(|| default.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        let expires_at = if ttl.is_zero() {
            None
        } else {
            let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            Some(Utc::now().timestamp_millis().saturating_add(ttl_ms))
        };

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                params![key, value, expires_at],
            )
        })
        .await?;

        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        let owned = key.to_string();
        let now = Utc::now().timestamp_millis();
        let result = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT 1 FROM kv WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
                    params![owned, now],
                    |_| Ok(()),
                )
                .optional()
            })
            .await;

        match result {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(key, error = %e, "SQLite exists check failed");
                false
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let removed = self
            .with_conn(move |conn| conn.execute("DELETE FROM kv WHERE key = ?1", params![key]))
            .await?;
        Ok(removed > 0)
    }
}
