//! Core library for the wireless mesh control plane
//!
//! This crate provides the decision stages of the mesh management
//! pipeline:
//! - Windowed telemetry aggregation with scan synthesis
//! - Channel-selection optimization with confirmation and hysteresis
//! - Deduplicating command dispatch
//! - A minimal publish/subscribe bus connecting the stages
//! - Health checks and observability

pub mod aggregator;
pub mod bridge;
pub mod bus;
pub mod controller;
pub mod health;
pub mod models;
pub mod observability;
pub mod optimizer;

pub use health::{HealthReport, PipelineHealth, ReadinessReport, StageReport, StageStatus};
pub use models::*;
pub use observability::PipelineMetrics;
