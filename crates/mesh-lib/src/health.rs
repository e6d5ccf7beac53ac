//! Stage health derived from pipeline activity
//!
//! Rather than flipping status flags by hand, stages push heartbeats from
//! their run loops and health is computed at probe time. A cadenced stage
//! (the aggregation tick) counts as stalled once it misses a few expected
//! intervals; event-driven stages (optimizer, controller, bridge) have no
//! cadence and only go unhealthy when their consumer loop dies. Failures
//! are sticky: loops are not restarted within a process.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

/// A cadenced stage is stalled after missing this many expected intervals.
const STALL_INTERVALS: u32 = 3;

/// Computed status of one pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    /// Doing work, or idle within its expected cadence
    Ok,
    /// A cadenced stage that stopped producing heartbeats
    Stalled,
    /// The stage's loop exited and will not come back
    Failed,
}

impl StageStatus {
    /// A stalled stage may recover on its own; a failed one cannot.
    pub fn is_operational(&self) -> bool {
        !matches!(self, StageStatus::Failed)
    }
}

/// Per-stage view returned by the health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Seconds since the stage last did work; absent before first activity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_seconds: Option<u64>,
}

/// Overall health probe response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: StageStatus,
    pub stages: HashMap<String, StageReport>,
}

/// Readiness probe response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessReport {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Stage names used across the pipeline
pub mod stages {
    pub const AGGREGATOR: &str = "aggregator";
    pub const OPTIMIZER: &str = "optimizer";
    pub const CONTROLLER: &str = "controller";
    pub const BRIDGE: &str = "bridge";
}

#[derive(Debug)]
struct StageState {
    /// Expected heartbeat interval; `None` for event-driven stages
    cadence: Option<Duration>,
    registered_at: Instant,
    last_heartbeat: Option<Instant>,
    failure: Option<String>,
}

impl StageState {
    fn report(&self) -> StageReport {
        let idle_seconds = self.last_heartbeat.map(|t| t.elapsed().as_secs());

        if let Some(reason) = &self.failure {
            return StageReport {
                status: StageStatus::Failed,
                detail: Some(reason.clone()),
                idle_seconds,
            };
        }

        if let Some(cadence) = self.cadence {
            let since = self.last_heartbeat.unwrap_or(self.registered_at).elapsed();
            if since > cadence * STALL_INTERVALS {
                return StageReport {
                    status: StageStatus::Stalled,
                    detail: Some(format!("no activity for {}s", since.as_secs())),
                    idle_seconds,
                };
            }
        }

        StageReport {
            status: StageStatus::Ok,
            detail: None,
            idle_seconds,
        }
    }
}

#[derive(Default)]
struct Inner {
    stages: HashMap<String, StageState>,
    started: bool,
}

/// Shared health tracker handed to every pipeline stage
#[derive(Clone)]
pub struct PipelineHealth {
    inner: Arc<RwLock<Inner>>,
}

impl Default for PipelineHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineHealth {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    /// Register a stage. Cadenced stages are expected to heartbeat at
    /// roughly `cadence`; event-driven stages pass `None`.
    pub fn register(&self, name: &str, cadence: Option<Duration>) {
        let mut inner = self.inner.write().unwrap();
        inner.stages.insert(
            name.to_string(),
            StageState {
                cadence,
                registered_at: Instant::now(),
                last_heartbeat: None,
                failure: None,
            },
        );
    }

    /// Record that a stage just did work. Unregistered names are ignored.
    pub fn heartbeat(&self, name: &str) {
        let mut inner = self.inner.write().unwrap();
        if let Some(stage) = inner.stages.get_mut(name) {
            stage.last_heartbeat = Some(Instant::now());
        }
    }

    /// Record a terminal stage failure. Sticky for the process lifetime.
    pub fn mark_failed(&self, name: &str, reason: impl Into<String>) {
        let mut inner = self.inner.write().unwrap();
        if let Some(stage) = inner.stages.get_mut(name) {
            stage.failure = Some(reason.into());
        }
    }

    /// Flip the readiness gate once wiring is complete.
    pub fn set_started(&self, started: bool) {
        let mut inner = self.inner.write().unwrap();
        inner.started = started;
    }

    /// Compute the health report. Failed dominates stalled dominates ok.
    pub fn health(&self) -> HealthReport {
        let inner = self.inner.read().unwrap();
        let stages: HashMap<String, StageReport> = inner
            .stages
            .iter()
            .map(|(name, state)| (name.clone(), state.report()))
            .collect();

        let mut status = StageStatus::Ok;
        for report in stages.values() {
            match report.status {
                StageStatus::Failed => {
                    status = StageStatus::Failed;
                    break;
                }
                StageStatus::Stalled => status = StageStatus::Stalled,
                StageStatus::Ok => {}
            }
        }

        HealthReport { status, stages }
    }

    /// Compute readiness: started, and no stage has terminally failed.
    pub fn readiness(&self) -> ReadinessReport {
        let started = self.inner.read().unwrap().started;
        if !started {
            return ReadinessReport {
                ready: false,
                reason: Some("Pipeline not started".to_string()),
            };
        }

        let health = self.health();
        if let Some((name, _)) = health
            .stages
            .iter()
            .find(|(_, r)| r.status == StageStatus::Failed)
        {
            return ReadinessReport {
                ready: false,
                reason: Some(format!("stage {} failed", name)),
            };
        }

        ReadinessReport {
            ready: true,
            reason: None,
        }
    }
}
