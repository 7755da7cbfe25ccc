//! In-process store.
//!
//! Used as the default store in tests and as the fallback the engine writes
//! to when the primary store fails. Expiry uses tokio's clock, so paused
//! test time applies to it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::Store;
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// HashMap-backed store with TTL
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        match self.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, e| e.is_live(now));
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Entry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str, default: &str) -> Result<String, StoreError> {
        let now = Instant::now();
        let entries = self.lock()?;
        Ok(entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
            .unwrap_or_else(|| default.to_string()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> bool {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.get(key).map(|e| e.is_live(now)).unwrap_or(false))
            .unwrap_or(false)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_returns_default_for_missing_key() {
        let store = MemoryStore::new();
        assert_eq!(store.get("missing", "fallback").await.unwrap(), "fallback");

        store.set("k", "v", Duration::ZERO).await.unwrap();
        assert_eq!(store.get("k", "").await.unwrap(), "v");
        assert!(store.exists("k").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let store = MemoryStore::new();
        store.set("short", "v", Duration::from_secs(5)).await.unwrap();
        store.set("forever", "v", Duration::ZERO).await.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(!store.exists("short").await);
        assert_eq!(store.get("short", "gone").await.unwrap(), "gone");
        assert!(store.exists("forever").await);
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::ZERO).await.unwrap();

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
