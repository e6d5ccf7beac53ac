//! Windowed telemetry aggregation
//!
//! Folds raw telemetry into per-node/per-channel feature vectors over a
//! sliding window, synthesizing samples from passive interference scans
//! when a channel has no recent active measurement.

use super::window::SampleWindow;
use crate::bus::{self, topics, MessageBus, Subscription};
use crate::health::{stages, PipelineHealth};
use crate::models::{Feature, SampleSource, ScanEntry, Telemetry};
use crate::observability::PipelineMetrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// RSSI mapping bounds for scan synthesis: clamp to [-95, -40] dBm, then
/// scale linearly to busy percent [0, 100].
const RSSI_FLOOR: f64 = -95.0;
const RSSI_CEIL: f64 = -40.0;

/// Configuration for the aggregation stage
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Sliding window length in seconds (default: 60)
    pub window_seconds: u64,
    /// Aggregation tick interval (default: 15 seconds)
    pub tick_interval: Duration,
    /// Per-(node, channel) sample buffer bound (default: 300)
    pub max_samples_per_channel: usize,
    /// Whether to synthesize samples from interference scans
    pub synthesize_scans: bool,
    /// Channel plan to aggregate over
    pub channels: Vec<u32>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            window_seconds: 60,
            tick_interval: Duration::from_secs(15),
            max_samples_per_channel: 300,
            synthesize_scans: true,
            channels: vec![1, 6, 11],
        }
    }
}

/// Most recent interference scan reported by a node.
#[derive(Debug, Clone)]
struct ScanRecord {
    scan: Vec<ScanEntry>,
    observed_at: DateTime<Utc>,
}

/// Windowed aggregation stage: telemetry in, features out.
pub struct Aggregator {
    bus: Arc<dyn MessageBus>,
    config: AggregatorConfig,
    buffers: RwLock<HashMap<String, HashMap<u32, SampleWindow>>>,
    latest_scans: RwLock<HashMap<String, ScanRecord>>,
    metrics: PipelineMetrics,
    health: Option<PipelineHealth>,
}

impl Aggregator {
    pub fn new(bus: Arc<dyn MessageBus>, config: AggregatorConfig) -> Self {
        Self {
            bus,
            config,
            buffers: RwLock::new(HashMap::new()),
            latest_scans: RwLock::new(HashMap::new()),
            metrics: PipelineMetrics::new(),
            health: None,
        }
    }

    /// Attach a health tracker; each tick reports a heartbeat through it.
    pub fn with_health(mut self, health: PipelineHealth) -> Self {
        self.health = Some(health);
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Non-blocking ingest of one telemetry sample.
    ///
    /// Records without a node id or channel are dropped. A piggybacked
    /// interference scan overwrites the node's previous scan.
    pub async fn add_telemetry(&self, t: Telemetry) {
        let (node, channel) = match (t.node_id.clone(), t.channel) {
            (Some(n), Some(c)) => (n, c),
            _ => {
                debug!("Dropping telemetry without nodeId or channel");
                self.metrics.inc_telemetry_dropped();
                return;
            }
        };

        let scan = t.interference_scan.clone();
        let observed_at = t.parsed_timestamp().unwrap_or_else(Utc::now);

        {
            let mut buffers = self.buffers.write().await;
            buffers
                .entry(node.clone())
                .or_default()
                .entry(channel)
                .or_insert_with(|| SampleWindow::new(self.config.max_samples_per_channel))
                .push(t);
        }

        if let Some(scan) = scan {
            let mut scans = self.latest_scans.write().await;
            scans.insert(node, ScanRecord { scan, observed_at });
        }
    }

    /// One aggregation tick: emit a feature per (node, configured channel)
    /// covering the last window. Publishing is best-effort.
    pub async fn aggregate_and_publish(&self) {
        let timer = std::time::Instant::now();
        let now = Utc::now();
        let window_start = now - ChronoDuration::seconds(self.config.window_seconds as i64);

        let nodes: Vec<String> = {
            let buffers = self.buffers.read().await;
            let scans = self.latest_scans.read().await;
            let mut nodes: Vec<String> = buffers.keys().chain(scans.keys()).cloned().collect();
            nodes.sort();
            nodes.dedup();
            nodes
        };
        self.metrics.set_nodes_tracked(nodes.len() as i64);

        let mut published = 0usize;
        for node in &nodes {
            for &channel in &self.config.channels {
                if let Some(feature) = self.window_feature(node, channel, window_start, now).await {
                    match bus::publish_json(self.bus.as_ref(), topics::FEATURES, node, &feature)
                        .await
                    {
                        Ok(()) => {
                            published += 1;
                            self.metrics.inc_features_published();
                        }
                        Err(e) => {
                            warn!(node = %node, channel, error = %e, "Failed to publish feature")
                        }
                    }
                }
            }
        }

        self.metrics
            .observe_aggregation_tick(timer.elapsed().as_secs_f64());
        if let Some(health) = &self.health {
            health.heartbeat(stages::AGGREGATOR);
        }
        debug!(
            nodes = nodes.len(),
            published, "Aggregation tick complete"
        );
    }

    /// Compute the feature for one (node, channel), or `None` when the
    /// window is empty and nothing could be synthesized.
    async fn window_feature(
        &self,
        node: &str,
        channel: u32,
        window_start: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Feature> {
        let (mut window_list, has_recent_real) = {
            let mut buffers = self.buffers.write().await;
            match buffers.get_mut(node).and_then(|chans| chans.get_mut(&channel)) {
                Some(w) => {
                    w.prune_before(window_start);
                    (w.snapshot(), w.has_recent_real(window_start))
                }
                None => (Vec::new(), false),
            }
        };

        if !has_recent_real && self.config.synthesize_scans {
            let mut scans = self.latest_scans.write().await;
            match scans.get(node) {
                Some(rec) if rec.observed_at >= window_start => {
                    if let Some(sample) =
                        synthesize_sample(node, channel, &rec.scan, rec.observed_at)
                    {
                        window_list.push(sample);
                    }
                }
                Some(_) => {
                    // Stale scans never synthesize; drop them.
                    scans.remove(node);
                }
                None => {}
            }
        }

        if window_list.is_empty() {
            return None;
        }

        Some(compute_feature(
            node,
            channel,
            &window_list,
            window_start,
            now,
            self.config.window_seconds,
        ))
    }

    /// Consume the telemetry topic until shutdown.
    ///
    /// Handler faults abandon the offending record; the loop continues.
    pub async fn run_ingest(
        self: Arc<Self>,
        mut shutdown: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut sub: Subscription = self.bus.subscribe(topics::TELEMETRY);
        info!("Starting telemetry ingest");

        loop {
            tokio::select! {
                rec = sub.recv() => {
                    match rec {
                        Ok(record) => {
                            if let Some(t) = bus::decode::<Telemetry>(&record) {
                                self.add_telemetry(t).await;
                            } else {
                                self.metrics.inc_telemetry_dropped();
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "Telemetry ingest lagged, records lost");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            if let Some(health) = &self.health {
                                health.mark_failed(stages::AGGREGATOR, "telemetry topic closed");
                            }
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down telemetry ingest");
                    break;
                }
            }
        }
    }
}

/// Build a synthetic sample for `channel` from the first matching scan entry.
///
/// A `busy` reading is used directly; otherwise an `rssi` reading is mapped
/// linearly from [-95, -40] dBm onto [0, 100] busy percent.
fn synthesize_sample(
    node: &str,
    channel: u32,
    scan: &[ScanEntry],
    observed_at: DateTime<Utc>,
) -> Option<Telemetry> {
    let entry = scan.iter().find(|e| e.channel == Some(channel))?;

    let (busy, rssi) = if let Some(b) = entry.busy {
        (round2(b), None)
    } else if let Some(r) = entry.rssi {
        (round2(rssi_to_busy(r)), Some(r.round() as i32))
    } else {
        return None;
    };

    Some(Telemetry {
        node_id: Some(node.to_string()),
        timestamp: Some(observed_at.to_rfc3339()),
        radio_id: None,
        channel: Some(channel),
        rssi,
        snr: None,
        tx_bytes: Some(0),
        rx_bytes: Some(0),
        tx_retries: Some(-1),
        num_clients: None,
        channel_busy_percent: Some(busy),
        interference_scan: None,
        sample_source: SampleSource::Scan,
    })
}

fn rssi_to_busy(rssi: f64) -> f64 {
    let clamped = rssi.clamp(RSSI_FLOOR, RSSI_CEIL);
    (clamped - RSSI_FLOOR) / (RSSI_CEIL - RSSI_FLOOR) * 100.0
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fold a window of samples into one feature vector.
///
/// Means are taken over samples that carry the field; absent rssi is
/// neutral for the minimum and absent txBytes counts as zero.
fn compute_feature(
    node: &str,
    channel: u32,
    list: &[Telemetry],
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    window_seconds: u64,
) -> Feature {
    let mut busy_sum = 0.0;
    let mut busy_n = 0usize;
    let mut max_busy = f64::NEG_INFINITY;
    let mut rssi_sum = 0.0;
    let mut rssi_n = 0usize;
    let mut min_rssi = i32::MAX;
    let mut clients_sum = 0.0;
    let mut clients_n = 0usize;
    let mut sum_tx: u64 = 0;
    let mut last_seen = None;
    let mut all_scan = true;

    for t in list {
        if let Some(b) = t.channel_busy_percent {
            busy_sum += b;
            busy_n += 1;
            max_busy = max_busy.max(b);
        }
        if let Some(r) = t.rssi {
            rssi_sum += f64::from(r);
            rssi_n += 1;
            min_rssi = min_rssi.min(r);
        }
        if let Some(c) = t.num_clients {
            clients_sum += f64::from(c);
            clients_n += 1;
        }
        sum_tx += t.tx_bytes.unwrap_or(0);
        last_seen = t.timestamp.clone();
        if t.sample_source != SampleSource::Scan {
            all_scan = false;
        }
    }

    Feature {
        node_id: node.to_string(),
        channel,
        window_start: window_start.to_rfc3339(),
        window_end: window_end.to_rfc3339(),
        granularity: format!("{}s", window_seconds),
        sample_count: list.len(),
        avg_channel_busy_percent: if busy_n > 0 { busy_sum / busy_n as f64 } else { 0.0 },
        max_channel_busy_percent: if max_busy.is_finite() { max_busy } else { 0.0 },
        min_rssi: if min_rssi == i32::MAX { 0 } else { min_rssi },
        avg_rssi: if rssi_n > 0 { rssi_sum / rssi_n as f64 } else { 0.0 },
        sum_tx_bytes: sum_tx,
        avg_num_clients: if clients_n > 0 { clients_sum / clients_n as f64 } else { 0.0 },
        last_seen,
        synthetic: all_scan,
    }
}
