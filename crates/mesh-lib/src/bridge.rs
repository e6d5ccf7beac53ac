//! Dashboard fan-out bridge
//!
//! Re-wraps pipeline records as `{type, payload}` events on the dashboard
//! topic. Payloads that fail DTO validation are forwarded with a `_raw`
//! event type rather than dropped, so the dashboard can still show them.

use crate::bus::{topics, MessageBus, Record};
use crate::health::{stages, PipelineHealth};
use crate::models::{ChannelConfig, Command, EventMessage, Feature, Forecast};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{info, warn};

/// Fans pipeline topics out to the dashboard topic.
pub struct DashboardBridge {
    bus: Arc<dyn MessageBus>,
    health: Option<PipelineHealth>,
}

impl DashboardBridge {
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus, health: None }
    }

    /// Attach a health tracker; forwarded events report through it.
    pub fn with_health(mut self, health: PipelineHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Consume all fan-out source topics until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut features = self.bus.subscribe(topics::FEATURES);
        let mut forecasts = self.bus.subscribe(topics::FORECASTS);
        let mut plans = self.bus.subscribe(topics::CHCONFIGS);
        let mut commands = self.bus.subscribe(topics::COMMANDS);
        info!("Starting dashboard bridge");

        loop {
            let (record, event_type) = tokio::select! {
                rec = features.recv() => match rec {
                    Ok(r) => (r, "feature_update"),
                    Err(_) => continue,
                },
                rec = forecasts.recv() => match rec {
                    Ok(r) => (r, "forecast_update"),
                    Err(_) => continue,
                },
                rec = plans.recv() => match rec {
                    Ok(r) => (r, "optimizer_plan"),
                    Err(_) => continue,
                },
                rec = commands.recv() => match rec {
                    Ok(r) => (r, "command_status"),
                    Err(_) => continue,
                },
                _ = shutdown.recv() => {
                    info!("Shutting down dashboard bridge");
                    break;
                }
            };

            let event = wrap_event(event_type, &record);
            let payload = match serde_json::to_value(&event) {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "Failed to encode dashboard event");
                    continue;
                }
            };
            if let Err(e) = self.bus.publish(topics::DASHBOARD, &record.key, payload).await {
                warn!(error = %e, "Failed to publish dashboard event");
            }
            if let Some(health) = &self.health {
                health.heartbeat(stages::BRIDGE);
            }
        }
    }
}

/// Wrap a record for the dashboard, validating the payload against its DTO.
fn wrap_event(event_type: &str, record: &Record) -> EventMessage {
    let valid = match event_type {
        "feature_update" => validates::<Feature>(record),
        "forecast_update" => validates::<Forecast>(record),
        "optimizer_plan" => validates::<ChannelConfig>(record),
        "command_status" => validates::<Command>(record),
        _ => false,
    };

    EventMessage {
        event_type: if valid {
            event_type.to_string()
        } else {
            format!("{}_raw", event_type)
        },
        payload: record.payload.clone(),
    }
}

fn validates<T: DeserializeOwned>(record: &Record) -> bool {
    serde_json::from_value::<T>(record.payload.clone()).is_ok()
}
