//! Aggregation tick loop
//!
//! Drives the periodic feature emission independently of telemetry ingest.

use super::Aggregator;
use std::sync::Arc;
use tokio::time::interval;
use tracing::info;

/// Wall-clock driven tick loop around an [`Aggregator`].
pub struct AggregationLoop {
    aggregator: Arc<Aggregator>,
}

impl AggregationLoop {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self { aggregator }
    }

    /// Tick until shutdown. The loop exits at the next tick boundary.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let tick = self.aggregator.config().tick_interval;
        info!(tick_ms = tick.as_millis() as u64, "Starting aggregation loop");

        let mut ticker = interval(tick);
        // The first interval tick fires immediately; skip it so the first
        // window has a chance to fill.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.aggregator.aggregate_and_publish().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down aggregation loop");
                    break;
                }
            }
        }
    }
}
