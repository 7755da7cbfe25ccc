//! Port interfaces for external collaborators.
//!
//! The engine consumes three ports: a key-value store for persistence, a
//! publish/subscribe bus for status notifications, and a boolean expression
//! evaluator for branch predicates. Each port ships with an in-process
//! implementation.

pub mod bus;
pub mod expression;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::Context;
use crate::error::{ExpressionError, NotifyError, StoreError};

// Re-export the shipped implementations
pub use bus::LocalBus;
pub use expression::JexlEvaluator;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Key-value persistence with per-entry time-to-live
#[async_trait]
pub trait Store: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Read a value, returning `default` if the key is absent or expired
    async fn get(&self, key: &str, default: &str) -> Result<String, StoreError>;

    /// Write a value. A zero `ttl` means the entry never expires.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> bool;

    /// Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// A message delivered to subscribers
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Value,
}

/// Subscription callback
pub type Handler = Arc<dyn Fn(Message) + Send + Sync>;

/// Fire-and-forget publish/subscribe
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), NotifyError>;

    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), NotifyError>;
}

/// Boolean predicate evaluation against a context
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, expression: &str, context: &Context) -> Result<bool, ExpressionError>;
}
