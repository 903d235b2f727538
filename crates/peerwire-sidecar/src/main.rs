//! Peerwire Sidecar - metered TCP relay for peer connections

mod config;
mod relay;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use peerwire_metering::PeerMetering;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::SidecarConfig;
use crate::relay::Relay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Peerwire Sidecar v{}...", peerwire_common::VERSION);

    let config_path = std::env::args().nth(1);
    let config = SidecarConfig::load(config_path.as_deref())?;
    tracing::info!("Loaded configuration: {:?}", config);

    let metering = Arc::new(PeerMetering::new(&config.metering)?);
    let _logger = telemetry::spawn_event_logger(&metering);
    let _stats = telemetry::spawn_stats_reporter(
        metering.clone(),
        Duration::from_secs(config.stats_interval_secs.max(1)),
    );

    let relay = Relay::new(config, metering);
    tokio::select! {
        res = relay.run() => res?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down..."),
    }

    Ok(())
}
