//! In-process message bus backed by per-topic broadcast channels

use super::{MessageBus, Record, Subscription};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;

/// Default per-topic channel capacity.
const DEFAULT_CAPACITY: usize = 256;

/// In-memory bus: one broadcast channel per topic, created lazily.
///
/// Fan-out follows broadcast semantics: every subscriber sees every record
/// published after it subscribed. Publishing to a topic with no subscribers
/// silently drops the record.
pub struct InMemoryBus {
    topics: DashMap<String, broadcast::Sender<Record>>,
    capacity: usize,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<Record> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: serde_json::Value) -> Result<()> {
        let record = Record {
            topic: topic.to_string(),
            key: key.to_string(),
            payload,
        };
        // A send error only means nobody is listening right now.
        let _ = self.sender(topic).send(record);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Subscription {
        self.sender(topic).subscribe()
    }
}
