//! Windowed telemetry aggregation stage
//!
//! This module maintains bounded per-(node, channel) sample buffers,
//! synthesizes samples from passive interference scans and emits one
//! feature vector per (node, channel) on a periodic tick.

mod r#loop;
mod service;
mod window;

pub use r#loop::AggregationLoop;
pub use service::{Aggregator, AggregatorConfig};
pub use window::SampleWindow;
