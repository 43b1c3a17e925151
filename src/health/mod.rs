//! Health check endpoints
//!
//! The router reads shard status through a watch channel so the binary can
//! swap in a restarted manager's state without rebuilding the server.

use crate::metrics::{self, GatewayMetrics};
use crate::shard::{ShardSnapshot, ShardState};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::watch;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub shards_total: usize,
    pub shards_connected: usize,
    pub shards: Vec<ShardSnapshot>,
}

impl ReadyResponse {
    fn from_state(state: &ShardState) -> Self {
        Self {
            ready: state.is_ready(),
            shards_total: state.shard_count(),
            shards_connected: state.connected_shards(),
            shards: state.snapshot(),
        }
    }
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    /// Status of the current manager's shards
    pub shards: watch::Receiver<ShardState>,
    pub metrics: GatewayMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness endpoint - returns 200 once every shard is connected
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let response = ReadyResponse::from_state(&state.shards.borrow());

    if response.ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    metrics::set_shards_connected(state.shards.borrow().connected_shards());

    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}
