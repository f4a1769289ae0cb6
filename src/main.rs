//! # Text relay
//!
//! Accepts TCP participants on a single port, registers each one after its
//! name handshake, and broadcasts every message to all connected participants.
//!
//! ## Features
//! - Length-prefixed binary framing with bounded name and message sizes
//! - Per-IP rate limiting of incoming connections
//! - Graceful shutdown on Ctrl+C
//! - Environment-based configuration loading (`RELAY_*`, `.env`)
//! - Health monitoring via HTTP metrics endpoint

use text_relay::{
    config::RelayConfig,
    server::{health, HealthMetrics, Relay},
    utils::RelayError,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Entry point for the relay.
///
/// Initializes logging, loads configuration from the environment,
/// and runs the relay until interrupted.
///
/// # Errors
/// Returns an error if configuration validation fails or if the relay fails to bind its port.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let _ = dotenv::dotenv();
    init_tracing();

    let config = RelayConfig::from_env()?;
    config.validate()?;

    let metrics = HealthMetrics::new().map_err(RelayError::from)?;

    if let Some(addr) = config.metrics_addr()? {
        tokio::spawn(serve_metrics(metrics.clone(), addr));
    }

    let relay = Relay::bind(config, metrics).await?;
    info!("Relay listening on {}", relay.local_addr()?);

    relay.run_until_ctrl_c().await?;
    info!("Relay stopped");

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn serve_metrics(metrics: HealthMetrics, addr: std::net::SocketAddr) {
    if let Err(e) = health::serve_metrics_http(metrics, addr).await {
        error!("Metrics endpoint stopped: {}", e);
    }
}
