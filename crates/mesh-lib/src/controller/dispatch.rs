//! Deduplicating command dispatch
//!
//! Two gates guard every emission: a change cooldown suppressing any
//! command too soon after the last one, and an identical-config hold
//! suppressing repeats of the same channel.

use crate::bus::{self, topics, MessageBus, Subscription};
use crate::health::{stages, PipelineHealth};
use crate::models::{ChannelConfig, Command};
use crate::observability::PipelineMetrics;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Command name understood by the nodes.
const SET_CHANNEL: &str = "SET_CHANNEL";

/// Configuration for the controller dispatch stage
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Minimum time between any two commands to a node (default: 60 s).
    /// Zero disables the gate.
    pub change_cooldown: Duration,
    /// Minimum time between identical-channel commands (default: 30 s).
    /// Zero disables the gate.
    pub hold: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            change_cooldown: Duration::from_secs(60),
            hold: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct NodeDispatchState {
    last_sent_channel: Option<u32>,
    last_sent_at: Option<Instant>,
    last_change_at: Option<Instant>,
    config_seq: u64,
}

/// Controller stage: channel configs in, node commands out.
pub struct Dispatcher {
    bus: Arc<dyn MessageBus>,
    config: ControllerConfig,
    nodes: RwLock<HashMap<String, NodeDispatchState>>,
    metrics: PipelineMetrics,
    health: Option<PipelineHealth>,
}

impl Dispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, config: ControllerConfig) -> Self {
        Self {
            bus,
            config,
            nodes: RwLock::new(HashMap::new()),
            metrics: PipelineMetrics::new(),
            health: None,
        }
    }

    /// Attach a health tracker; the consumer loop reports through it.
    pub fn with_health(mut self, health: PipelineHealth) -> Self {
        self.health = Some(health);
        self
    }

    /// Apply the dedupe gates and build the command, or `None` when
    /// suppressed. State is updated only on emission.
    pub fn dispatch(&self, cfg: &ChannelConfig) -> Option<Command> {
        let mut nodes = self.nodes.write().unwrap();
        let ns = nodes.entry(cfg.node_id.clone()).or_default();

        if self.config.change_cooldown > Duration::ZERO {
            if let Some(at) = ns.last_change_at {
                if at.elapsed() < self.config.change_cooldown {
                    debug!(node = %cfg.node_id, channel = cfg.channel, "Suppressed by change cooldown");
                    self.metrics.inc_commands_suppressed();
                    return None;
                }
            }
        }

        if self.config.hold > Duration::ZERO && ns.last_sent_channel == Some(cfg.channel) {
            if let Some(at) = ns.last_sent_at {
                if at.elapsed() < self.config.hold {
                    debug!(node = %cfg.node_id, channel = cfg.channel, "Suppressed by identical-config hold");
                    self.metrics.inc_commands_suppressed();
                    return None;
                }
            }
        }

        ns.config_seq += 1;
        let now = Instant::now();
        ns.last_sent_channel = Some(cfg.channel);
        ns.last_sent_at = Some(now);
        ns.last_change_at = Some(now);

        self.metrics.inc_commands_dispatched();
        Some(Command {
            node_id: cfg.node_id.clone(),
            command: SET_CHANNEL.to_string(),
            payload: cfg.channel.to_string(),
            config_version: format!("v{}:{}", ns.config_seq, Utc::now().to_rfc3339()),
        })
    }

    /// Dispatch a config and publish the resulting command, if any.
    pub async fn handle_config(&self, cfg: ChannelConfig) {
        if let Some(cmd) = self.dispatch(&cfg) {
            info!(node = %cmd.node_id, payload = %cmd.payload, version = %cmd.config_version,
                "Dispatching SET_CHANNEL");
            if let Err(e) =
                bus::publish_json(self.bus.as_ref(), topics::COMMANDS, &cmd.node_id, &cmd).await
            {
                warn!(node = %cmd.node_id, error = %e, "Failed to publish command");
            }
        }
    }

    /// Consume the chconfigs topic until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let mut sub: Subscription = self.bus.subscribe(topics::CHCONFIGS);
        info!(
            cooldown_ms = self.config.change_cooldown.as_millis() as u64,
            hold_ms = self.config.hold.as_millis() as u64,
            "Starting controller dispatch"
        );

        loop {
            tokio::select! {
                rec = sub.recv() => {
                    match rec {
                        Ok(record) => {
                            if let Some(cfg) = bus::decode::<ChannelConfig>(&record) {
                                self.handle_config(cfg).await;
                            }
                            if let Some(health) = &self.health {
                                health.heartbeat(stages::CONTROLLER);
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Controller lagged, configs lost");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            if let Some(health) = &self.health {
                                health.mark_failed(stages::CONTROLLER, "chconfigs topic closed");
                            }
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down controller dispatch");
                    break;
                }
            }
        }
    }
}
