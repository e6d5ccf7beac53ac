//! Wire-format data models for the mesh control plane
//!
//! All payloads travel as camelCase JSON keyed by nodeId. Telemetry and
//! Forecast fields are frequently absent on the wire, so they are modeled
//! as `Option` and every consumer defaults explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Origin of a telemetry sample.
///
/// Unknown wire values collapse to `Measured` so a stray source tag never
/// discards the whole record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleSource {
    /// Active measurement on the node's operating channel.
    #[default]
    Measured,
    /// Synthesized from a passive interference scan.
    Scan,
}

impl<'de> Deserialize<'de> for SampleSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "scan" => SampleSource::Scan,
            _ => SampleSource::Measured,
        })
    }
}

/// One entry of a passive interference scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanEntry {
    pub channel: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<f64>,
}

/// Raw radio telemetry emitted by a mesh node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    pub node_id: Option<String>,
    pub timestamp: Option<String>,
    pub radio_id: Option<String>,
    pub channel: Option<u32>,
    pub rssi: Option<i32>,
    pub snr: Option<i32>,
    pub tx_bytes: Option<u64>,
    pub rx_bytes: Option<u64>,
    pub tx_retries: Option<i32>,
    pub num_clients: Option<u32>,
    pub channel_busy_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interference_scan: Option<Vec<ScanEntry>>,
    #[serde(default)]
    pub sample_source: SampleSource,
}

impl Telemetry {
    /// Parse the raw timestamp string, if present and well-formed.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Per-(node, channel) feature vector over one aggregation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub node_id: String,
    pub channel: u32,
    pub window_start: String,
    pub window_end: String,
    pub granularity: String,
    pub sample_count: usize,
    pub avg_channel_busy_percent: f64,
    pub max_channel_busy_percent: f64,
    pub min_rssi: i32,
    pub avg_rssi: f64,
    pub sum_tx_bytes: u64,
    pub avg_num_clients: f64,
    pub last_seen: Option<String>,
    pub synthetic: bool,
}

/// Near-future channel busyness prediction produced by the forecaster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forecast {
    pub node_id: Option<String>,
    pub channel: Option<u32>,
    pub timestamp: Option<String>,
    pub forecast_busy_percent: Option<f64>,
    pub confidence: Option<f64>,
    #[serde(default)]
    pub synthetic: bool,
    pub sample_count: Option<u32>,
    pub avg_num_clients: Option<f64>,
    pub window_seconds: Option<u64>,
}

/// Channel reassignment decision emitted by the optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub node_id: String,
    pub channel: u32,
    pub reason: String,
}

/// Configuration command dispatched to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub node_id: String,
    pub command: String,
    pub payload: String,
    pub config_version: String,
}

/// Dashboard fan-out envelope: `{type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}
