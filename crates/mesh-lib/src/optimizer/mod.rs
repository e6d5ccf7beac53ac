//! Channel-selection optimizer stage
//!
//! A per-node state machine that ingests forecasts, scores candidate
//! channels under a cost function and emits channel-change decisions with
//! hysteresis, confirmation and anti-oscillation controls.

mod cost;
mod engine;

pub use engine::{Optimizer, OptimizerStats};

use std::time::{Duration, Instant};

/// Optimizer tunables.
///
/// The defaults favor stability: three confirming ticks before a commit,
/// no hysteresis window, and a small per-client reassociation cost.
#[derive(Debug, Clone)]
pub struct Tunables {
    /// Consecutive improving ticks required before committing
    pub min_confirmations: u32,
    /// Minimum net improvement (busy-points) required to commit
    pub improvement_threshold: f64,
    /// Cost added proportional to (1 - confidence)
    pub low_confidence_penalty_scale: f64,
    /// Fixed cost of any move
    pub base_move_cost: f64,
    /// Per-associated-client reassociation cost
    pub client_penalty_per_client: f64,
    /// Minimum time between committed moves; zero disables hysteresis
    pub min_time_between_moves: Duration,
    /// Extra cost for a candidate present in the node's recent targets
    pub history_penalty: f64,
    /// Bound of the recent-targets deque
    pub recent_targets_size: usize,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            min_confirmations: 3,
            improvement_threshold: 0.0,
            low_confidence_penalty_scale: 0.0,
            base_move_cost: 0.0,
            client_penalty_per_client: 0.2,
            min_time_between_moves: Duration::ZERO,
            history_penalty: 0.0,
            recent_targets_size: 5,
        }
    }
}

/// Latest forecast for one (node, channel), replaced on every arrival.
#[derive(Debug, Clone)]
pub struct ForecastEntry {
    pub forecast: f64,
    pub confidence: f64,
    pub synthetic: bool,
    pub sample_count: u32,
    pub avg_num_clients: Option<f64>,
    pub last_updated: Instant,
    /// Whether a non-synthetic forecast was ever seen for this channel.
    /// Survives entry overwrites so scan-only channels stay distinguishable.
    pub seen_real: bool,
}
