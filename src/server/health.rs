use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use axum::{Json, Router, routing::get, extract::State, response::IntoResponse};
use serde_json::json;
use std::net::SocketAddr;
use tracing::info;

use crate::utils::error::RelayError;

/// Struct for managing relay health metrics.
#[derive(Clone)]
pub struct HealthMetrics {
    /// Number of registered sessions.
    pub sessions: IntGauge,
    /// Message frames received from participants.
    pub messages_received: IntCounter,
    /// Attributed frames queued to recipients.
    pub frames_sent: IntCounter,
    /// Connections dropped before completing their handshake.
    pub handshake_failures: IntCounter,
    /// Connections refused by the accept rate limiter.
    pub rejected_connections: IntCounter,
    /// Prometheus registry used to store and manage the metrics.
    registry: Registry,
}

impl HealthMetrics {
    /// Creates a new instance of `HealthMetrics` and registers the metrics with Prometheus.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let sessions = IntGauge::new("relay_sessions", "Registered sessions")?;
        let messages_received = IntCounter::new("relay_messages_received", "Total messages received")?;
        let frames_sent = IntCounter::new("relay_frames_sent", "Total frames queued to recipients")?;
        let handshake_failures = IntCounter::new("relay_handshake_failures", "Failed handshakes")?;
        let rejected_connections = IntCounter::new("relay_rejected_connections", "Rate limited connections")?;

        registry.register(Box::new(sessions.clone()))?;
        registry.register(Box::new(messages_received.clone()))?;
        registry.register(Box::new(frames_sent.clone()))?;
        registry.register(Box::new(handshake_failures.clone()))?;
        registry.register(Box::new(rejected_connections.clone()))?;

        Ok(Self {
            sessions,
            messages_received,
            frames_sent,
            handshake_failures,
            rejected_connections,
            registry,
        })
    }

    /// Exposes the current state of all registered metrics in Prometheus-compatible format.
    pub fn expose_metrics(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Routes serving `/metrics` (Prometheus text) and `/health` (JSON).
pub fn router(metrics: HealthMetrics) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(metrics)
}

/// Serves the metrics routes over plain HTTP until the process exits.
///
/// # Errors
/// Returns `RelayError::MetricsError` if the address cannot be bound or the server fails.
pub async fn serve_metrics_http(metrics: HealthMetrics, addr: SocketAddr) -> Result<(), RelayError> {
    let server = axum::Server::try_bind(&addr)
        .map_err(|e| RelayError::MetricsError(format!("bind {}: {}", addr, e)))?;

    info!("Metrics listening on {}", addr);
    server
        .serve(router(metrics).into_make_service())
        .await
        .map_err(|e| RelayError::MetricsError(e.to_string()))
}

async fn metrics_handler(State(metrics): State<HealthMetrics>) -> impl IntoResponse {
    match metrics.expose_metrics() {
        Ok(body) => (axum::http::StatusCode::OK, body),
        Err(e) => (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn health_handler(State(metrics): State<HealthMetrics>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": metrics.sessions.get(),
    }))
}
