//! Persistence glue for instances and resilience attempts.
//!
//! Writes go to the primary store. When the primary fails the record is
//! written to an in-process fallback instead, so callers never fail on a
//! persistence error. A successful primary write drops the fallback copy,
//! so a record still held by the fallback is the newest one and reads
//! prefer it over the primary.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::adapters::{MemoryStore, Store};
use crate::domain::{Attempt, Instance};
use crate::error::StoreError;

/// Key used by health checks
const PROBE_KEY: &str = "health:probe";

/// Typed access to persisted records
pub struct InstanceStore {
    primary: Arc<dyn Store>,
    fallback: MemoryStore,
    prefix: String,
}

impl InstanceStore {
    pub fn new(primary: Arc<dyn Store>, prefix: impl Into<String>) -> Self {
        Self {
            primary,
            fallback: MemoryStore::new(),
            prefix: prefix.into(),
        }
    }

    pub fn instance_key(&self, tag: &str, id: &str) -> String {
        format!("{}:instance:{}:{}", self.prefix, tag, id)
    }

    pub fn attempt_key(&self, tag: &str, id: &str) -> String {
        format!("{}:attempt:{}:{}", self.prefix, tag, id)
    }

    /// Index of attempt ids per flow tag
    pub fn attempts_index_key(&self, tag: &str) -> String {
        format!("{}:attempts:{}", self.prefix, tag)
    }

    /// Number of records currently held by the fallback
    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }

    pub async fn save_instance(&self, instance: &Instance, ttl: Duration) {
        let key = self.instance_key(&instance.tag, &instance.id);
        self.write(&key, instance, ttl).await;
    }

    pub async fn load_instance(&self, tag: &str, id: &str) -> Option<Instance> {
        self.read(&self.instance_key(tag, id)).await
    }

    pub async fn save_attempt(&self, attempt: &Attempt) {
        let key = self.attempt_key(&attempt.tag, &attempt.id);
        self.write(&key, attempt, attempt.retention()).await;
    }

    pub async fn load_attempt(&self, tag: &str, id: &str) -> Option<Attempt> {
        self.read(&self.attempt_key(tag, id)).await
    }

    /// Record `id` under the tag index
    pub async fn index_attempt(&self, tag: &str, id: &str, ttl: Duration) {
        let key = self.attempts_index_key(tag);
        let mut ids: Vec<String> = self.read(&key).await.unwrap_or_default();
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
            self.write(&key, &ids, ttl).await;
        }
    }

    pub async fn indexed_attempts(&self, tag: &str) -> Vec<String> {
        self.read(&self.attempts_index_key(tag)).await.unwrap_or_default()
    }

    pub async fn delete_attempt(&self, tag: &str, id: &str) {
        self.remove(&self.attempt_key(tag, id)).await;
    }

    /// Delete every attempt indexed under `tag` and the index itself
    pub async fn delete_attempts_for_tag(&self, tag: &str) -> Vec<String> {
        let ids = self.indexed_attempts(tag).await;
        for id in &ids {
            self.delete_attempt(tag, id).await;
        }
        self.remove(&self.attempts_index_key(tag)).await;
        ids
    }

    /// Whether the primary store accepts a write and reads it back
    pub async fn probe(&self) -> Result<bool, StoreError> {
        let key = format!("{}:{}", self.prefix, PROBE_KEY);
        self.primary
            .set(&key, "ok", Duration::from_secs(60))
            .await?;
        Ok(self.primary.exists(&key).await)
    }

    async fn write<T: Serialize + ?Sized>(&self, key: &str, record: &T, ttl: Duration) {
        let blob = match serde_json::to_string(record) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(key, error = %e, "Failed to serialize record");
                return;
            }
        };

        match self.primary.set(key, &blob, ttl).await {
            Ok(()) => {
                debug!(key, store = self.primary.name(), "Record persisted");
                // Drop any stale copy written while the primary was down
                let _ = self.fallback.delete(key).await;
            }
            Err(e) => {
                warn!(
                    key,
                    store = self.primary.name(),
                    error = %e,
                    "Primary store write failed, using in-process fallback"
                );
                let _ = self.fallback.set(key, &blob, ttl).await;
            }
        }
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let blob = match self.fallback.get(key, "").await {
            Ok(blob) if !blob.is_empty() => blob,
            _ => match self.primary.get(key, "").await {
                Ok(blob) if !blob.is_empty() => blob,
                Ok(_) => return None,
                Err(e) => {
                    warn!(key, store = self.primary.name(), error = %e, "Primary store read failed");
                    return None;
                }
            },
        };

        match serde_json::from_str(&blob) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable record");
                None
            }
        }
    }

    async fn remove(&self, key: &str) {
        if let Err(e) = self.primary.delete(key).await {
            warn!(key, error = %e, "Primary store delete failed");
        }
        let _ = self.fallback.delete(key).await;
    }
}
