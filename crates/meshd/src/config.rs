//! Daemon configuration
//!
//! Loaded from the environment with the `MESH_` prefix; every key has a
//! default matching the documented pipeline behavior.

use anyhow::Result;
use mesh_lib::aggregator::AggregatorConfig;
use mesh_lib::controller::ControllerConfig;
use mesh_lib::optimizer::Tunables;
use serde::Deserialize;
use std::time::Duration;

/// Control plane configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MeshConfig {
    /// HTTP port for health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Aggregation window in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Aggregation tick interval in milliseconds
    #[serde(default = "default_schedule_ms")]
    pub schedule_ms: u64,

    /// Per-(node, channel) sample buffer bound
    #[serde(default = "default_max_samples")]
    pub max_samples_per_channel: usize,

    /// Synthesize samples from interference scans
    #[serde(default = "default_synthesize_scans")]
    pub synthesize_scans: bool,

    /// CSV of allowed channels, e.g. "1,6,11"
    #[serde(default = "default_channels")]
    pub channels: String,

    /// Consecutive improving ticks required before a commit
    #[serde(default = "default_min_confirmations")]
    pub min_confirmations: u32,

    /// Minimum net improvement (busy-points) required to commit
    #[serde(default)]
    pub improvement_threshold: f64,

    /// Cost added proportional to (1 - confidence)
    #[serde(default)]
    pub low_confidence_penalty_scale: f64,

    /// Fixed cost of any move
    #[serde(default)]
    pub base_move_cost: f64,

    /// Per-associated-client reassociation cost
    #[serde(default = "default_client_penalty")]
    pub client_penalty_per_client: f64,

    /// Hysteresis between commits in milliseconds; zero disables
    #[serde(default)]
    pub min_time_between_moves_ms: u64,

    /// Extra cost for a candidate in the recent-targets history
    #[serde(default)]
    pub history_penalty: f64,

    /// Recent-targets deque bound
    #[serde(default = "default_recent_targets_size")]
    pub recent_targets_size: usize,

    /// Identical-config hold in milliseconds
    #[serde(default = "default_hold_ms")]
    pub hold_ms: u64,

    /// Change cooldown in milliseconds
    #[serde(default = "default_change_cooldown_ms")]
    pub change_cooldown_ms: u64,
}

fn default_api_port() -> u16 {
    8080
}

fn default_window_seconds() -> u64 {
    60
}

fn default_schedule_ms() -> u64 {
    15_000
}

fn default_max_samples() -> usize {
    300
}

fn default_synthesize_scans() -> bool {
    true
}

fn default_channels() -> String {
    "1,6,11".to_string()
}

fn default_min_confirmations() -> u32 {
    3
}

fn default_client_penalty() -> f64 {
    0.2
}

fn default_recent_targets_size() -> usize {
    5
}

fn default_hold_ms() -> u64 {
    30_000
}

fn default_change_cooldown_ms() -> u64 {
    60_000
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            window_seconds: default_window_seconds(),
            schedule_ms: default_schedule_ms(),
            max_samples_per_channel: default_max_samples(),
            synthesize_scans: default_synthesize_scans(),
            channels: default_channels(),
            min_confirmations: default_min_confirmations(),
            improvement_threshold: 0.0,
            low_confidence_penalty_scale: 0.0,
            base_move_cost: 0.0,
            client_penalty_per_client: default_client_penalty(),
            min_time_between_moves_ms: 0,
            history_penalty: 0.0,
            recent_targets_size: default_recent_targets_size(),
            hold_ms: default_hold_ms(),
            change_cooldown_ms: default_change_cooldown_ms(),
        }
    }
}

impl MeshConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MESH"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// Parse the channel plan CSV, skipping malformed entries.
    pub fn channel_plan(&self) -> Vec<u32> {
        self.channels
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect()
    }

    pub fn aggregator(&self) -> AggregatorConfig {
        AggregatorConfig {
            window_seconds: self.window_seconds,
            tick_interval: Duration::from_millis(self.schedule_ms),
            max_samples_per_channel: self.max_samples_per_channel,
            synthesize_scans: self.synthesize_scans,
            channels: self.channel_plan(),
        }
    }

    pub fn tunables(&self) -> Tunables {
        Tunables {
            min_confirmations: self.min_confirmations,
            improvement_threshold: self.improvement_threshold,
            low_confidence_penalty_scale: self.low_confidence_penalty_scale,
            base_move_cost: self.base_move_cost,
            client_penalty_per_client: self.client_penalty_per_client,
            min_time_between_moves: Duration::from_millis(self.min_time_between_moves_ms),
            history_penalty: self.history_penalty,
            recent_targets_size: self.recent_targets_size,
        }
    }

    pub fn controller(&self) -> ControllerConfig {
        ControllerConfig {
            change_cooldown: Duration::from_millis(self.change_cooldown_ms),
            hold: Duration::from_millis(self.hold_ms),
        }
    }
}
