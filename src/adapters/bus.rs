//! In-process publish/subscribe bus.
//!
//! One `tokio::sync::broadcast` channel per topic. Publishing to a topic
//! with no subscribers is a no-op.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::{Handler, Message, Notifier};
use crate::error::NotifyError;

/// Default per-topic channel capacity
pub const DEFAULT_CAPACITY: usize = 256;

/// Broadcast bus keyed by topic
pub struct LocalBus {
    channels: Mutex<HashMap<String, broadcast::Sender<Message>>>,
    capacity: usize,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Raw receiver for a topic, receiving all future messages
    pub fn receiver(&self, topic: &str) -> broadcast::Receiver<Message> {
        self.sender(topic).subscribe()
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Message> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

#[async_trait]
impl Notifier for LocalBus {
    async fn publish(&self, topic: &str, payload: Value) -> Result<(), NotifyError> {
        let sender = self.sender(topic);
        let message = Message {
            topic: topic.to_string(),
            payload,
        };
        // No subscribers is fine
        let delivered = sender.send(message).unwrap_or(0);
        debug!(topic, delivered, "Published message");
        Ok(())
    }

    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), NotifyError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| NotifyError::NoRuntime(topic.to_string()))?;
        let mut rx = self.sender(topic).subscribe();
        let topic = topic.to_string();

        runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler(message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%topic, skipped, "Subscriber lagged, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(())
    }
}
