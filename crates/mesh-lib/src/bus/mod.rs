//! Minimal publish/subscribe abstraction over keyed JSON records
//!
//! Every pipeline stage is a consumer over one topic and a producer to
//! another. The trait keeps stages independent of the concrete transport;
//! [`InMemoryBus`] is the in-process implementation.

mod memory;

pub use memory::InMemoryBus;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Logical topic names connecting the pipeline stages.
pub mod topics {
    pub const TELEMETRY: &str = "telemetry";
    pub const FEATURES: &str = "features";
    pub const FORECASTS: &str = "forecasts";
    pub const CHCONFIGS: &str = "chconfigs";
    pub const COMMANDS: &str = "commands";
    pub const DASHBOARD: &str = "dashboard";
}

/// A keyed JSON record on a topic. Keys are node ids throughout.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub key: String,
    pub payload: serde_json::Value,
}

/// Independent consumer handle for one topic.
pub type Subscription = broadcast::Receiver<Record>;

/// Publish/subscribe interface over keyed JSON records.
///
/// Publishing is best-effort: delivery to zero subscribers is not an error,
/// and producers never retry. Consumers that fall behind lose the oldest
/// records; downstream handlers are idempotent under redelivery.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a record. Returns an error only on transport failure.
    async fn publish(&self, topic: &str, key: &str, payload: serde_json::Value) -> Result<()>;

    /// Subscribe to a topic. Each subscription sees every record published
    /// after the subscription was created.
    fn subscribe(&self, topic: &str) -> Subscription;
}

/// Serialize `value` and publish it on `topic` keyed by `key`.
pub async fn publish_json<T: Serialize>(
    bus: &dyn MessageBus,
    topic: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    let payload = serde_json::to_value(value)?;
    bus.publish(topic, key, payload).await
}

/// Decode a record payload into a typed message.
///
/// A malformed payload is a per-record drop, never a consumer failure.
pub fn decode<T: DeserializeOwned>(record: &Record) -> Option<T> {
    match serde_json::from_value(record.payload.clone()) {
        Ok(v) => Some(v),
        Err(e) => {
            debug!(topic = %record.topic, key = %record.key, error = %e, "Dropping malformed record");
            None
        }
    }
}
