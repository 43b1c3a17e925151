//! Prometheus metrics module
//!
//! Recording goes through the `metrics` facade and is a no-op until the
//! binary installs a recorder with [`GatewayMetrics::install`].

use crate::error::GatewayError;
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Duration;

/// Installed Prometheus recorder
#[derive(Clone)]
pub struct GatewayMetrics {
    handle: Arc<PrometheusHandle>,
}

impl GatewayMetrics {
    /// Install the global recorder and register metric descriptions
    pub fn install() -> Result<Self, GatewayError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| GatewayError::MetricsInstall(e.to_string()))?;

        Self::register_metrics();

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_shard_connect_attempts_total",
            Unit::Count,
            "Shard connect attempts, retries included"
        );
        describe_counter!(
            "gateway_shard_connects_total",
            Unit::Count,
            "Shards that finished connecting"
        );
        describe_counter!(
            "gateway_errors_total",
            Unit::Count,
            "Shard manager errors by type"
        );

        describe_histogram!(
            "gateway_shard_connect_duration_seconds",
            Unit::Seconds,
            "Time to connect one shard, pacing included"
        );
        describe_histogram!(
            "gateway_shutdown_duration_seconds",
            Unit::Seconds,
            "Time to disconnect every shard"
        );

        describe_gauge!(
            "gateway_shards_connected",
            Unit::Count,
            "Number of shards holding a live session"
        );
        describe_gauge!(
            "gateway_guilds_total",
            Unit::Count,
            "Guilds across all shards"
        );
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Record one connect attempt
pub fn record_connect_attempt(shard_id: u32) {
    counter!(
        "gateway_shard_connect_attempts_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);
}

/// Record a shard that connected
pub fn record_connect(shard_id: u32, duration: Duration) {
    counter!(
        "gateway_shard_connects_total",
        "shard_id" => shard_id.to_string()
    )
    .increment(1);

    histogram!(
        "gateway_shard_connect_duration_seconds",
        "shard_id" => shard_id.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a manager error
pub fn record_error(shard_id: Option<u32>, error_type: &'static str) {
    let shard = shard_id.map_or_else(|| "none".to_string(), |id| id.to_string());
    counter!(
        "gateway_errors_total",
        "shard_id" => shard,
        "error_type" => error_type
    )
    .increment(1);
}

/// Record a completed shutdown
pub fn record_shutdown(duration: Duration) {
    histogram!("gateway_shutdown_duration_seconds").record(duration.as_secs_f64());
}

/// Set connected shard count
pub fn set_shards_connected(count: usize) {
    gauge!("gateway_shards_connected").set(count as f64);
}

/// Set guild count across all shards
pub fn set_guilds(count: usize) {
    gauge!("gateway_guilds_total").set(count as f64);
}
