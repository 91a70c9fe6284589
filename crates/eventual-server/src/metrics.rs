//! Metrics collection and export for eventual.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "eventual_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "eventual_connections_active";
    pub const MESSAGES_TOTAL: &str = "eventual_messages_total";
    pub const MESSAGES_BYTES: &str = "eventual_messages_bytes";
    pub const CHANNELS_ACTIVE: &str = "eventual_channels_active";
    pub const SUBSCRIPTIONS_TOTAL: &str = "eventual_subscriptions_total";
    pub const AUTH_FAILURES_TOTAL: &str = "eventual_auth_failures_total";
    pub const PEER_DELIVERIES_TOTAL: &str = "eventual_peer_deliveries_total";
    pub const LATENCY_SECONDS: &str = "eventual_latency_seconds";
    pub const ERRORS_TOTAL: &str = "eventual_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of client connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open client connections"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of messages processed");
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of channels");
    metrics::describe_counter!(
        names::SUBSCRIPTIONS_TOTAL,
        "Total number of channel subscription requests"
    );
    metrics::describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Requests rejected for a missing or invalid token"
    );
    metrics::describe_counter!(
        names::PEER_DELIVERIES_TOTAL,
        "Events offered to peer brokers, by outcome"
    );
    metrics::describe_histogram!(
        names::LATENCY_SECONDS,
        "Client frame processing latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a message.
pub fn record_message(bytes: usize, direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record client frame latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::LATENCY_SECONDS).record(seconds);
}

pub fn record_subscription(channels: usize) {
    counter!(names::SUBSCRIPTIONS_TOTAL).increment(channels as u64);
}

pub fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}

/// Record a rejected token. `surface` is `client`, `http` or `rpc`.
pub fn record_auth_failure(surface: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "surface" => surface).increment(1);
}

/// Record an outbound peer delivery. `outcome` is `ok`, `error` or `skipped`.
pub fn record_peer_delivery(outcome: &'static str) {
    counter!(names::PEER_DELIVERIES_TOTAL, "outcome" => outcome).increment(1);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}
