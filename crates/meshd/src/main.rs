//! Wireless mesh control plane daemon
//!
//! Wires the pipeline stages over the in-process bus: telemetry is folded
//! into features, forecasts drive channel decisions, decisions become
//! SET_CHANNEL commands, and everything fans out to the dashboard topic.

use anyhow::Result;
use mesh_lib::aggregator::{AggregationLoop, Aggregator};
use mesh_lib::bridge::DashboardBridge;
use mesh_lib::bus::InMemoryBus;
use mesh_lib::controller::Dispatcher;
use mesh_lib::health::stages;
use mesh_lib::optimizer::Optimizer;
use mesh_lib::{PipelineHealth, PipelineMetrics};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const MESHD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = MESHD_VERSION, "Starting meshd");

    let config = config::MeshConfig::load()?;
    info!(
        channels = %config.channels,
        window_seconds = config.window_seconds,
        "Control plane configured"
    );

    // The aggregation tick has a known cadence; the other stages are
    // event-driven and only fail when their consumer loop dies.
    let aggregator_config = config.aggregator();
    let health = PipelineHealth::new();
    health.register(stages::AGGREGATOR, Some(aggregator_config.tick_interval));
    health.register(stages::OPTIMIZER, None);
    health.register(stages::CONTROLLER, None);
    health.register(stages::BRIDGE, None);

    let metrics = PipelineMetrics::new();

    let bus = Arc::new(InMemoryBus::new());
    let aggregator = Arc::new(
        Aggregator::new(bus.clone(), aggregator_config).with_health(health.clone()),
    );
    let optimizer = Arc::new(
        Optimizer::new(bus.clone(), config.tunables()).with_health(health.clone()),
    );
    let dispatcher = Arc::new(
        Dispatcher::new(bus.clone(), config.controller()).with_health(health.clone()),
    );
    let bridge = Arc::new(DashboardBridge::new(bus.clone()).with_health(health.clone()));

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(8);

    let mut stage_handles = Vec::new();
    stage_handles.push(tokio::spawn(
        aggregator.clone().run_ingest(shutdown_tx.subscribe()),
    ));
    stage_handles.push(tokio::spawn(
        AggregationLoop::new(aggregator).run(shutdown_tx.subscribe()),
    ));
    stage_handles.push(tokio::spawn(optimizer.run(shutdown_tx.subscribe())));
    stage_handles.push(tokio::spawn(dispatcher.run(shutdown_tx.subscribe())));
    stage_handles.push(tokio::spawn(bridge.run(shutdown_tx.subscribe())));

    let app_state = Arc::new(api::AppState::new(health.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    health.set_started(true);
    info!("Control plane ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    // In-flight handlers finish; each loop exits at its next boundary.
    let _ = shutdown_tx.send(());
    for handle in stage_handles {
        let _ = handle.await;
    }
    api_handle.abort();

    Ok(())
}
