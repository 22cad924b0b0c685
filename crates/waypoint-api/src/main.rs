//! Binary entrypoint for the Waypoint API server.
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use waypoint_api::{run, AppState};
use waypoint_core::WaypointConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Listen address and config file can be overridden with WAYPOINT_ADDR / WAYPOINT_CONFIG
    let addr = std::env::var("WAYPOINT_ADDR").unwrap_or_else(|_| "0.0.0.0:8787".to_string());
    let config = match std::env::var("WAYPOINT_CONFIG") {
        Ok(path) => WaypointConfig::from_path(&path)
            .with_context(|| format!("loading configuration from {}", path))?,
        Err(_) => WaypointConfig::default(),
    };

    let state = AppState::from_config(&config).context("building application state")?;
    run(&addr, Arc::new(state))
        .await
        .with_context(|| format!("serving on {}", addr))
}
