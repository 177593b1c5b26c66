//! Metrics collection and export.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const SESSIONS_TOTAL: &str = "banter_sessions_total";
    pub const SESSIONS_ACTIVE: &str = "banter_sessions_active";
    pub const TOPICS_ACTIVE: &str = "banter_topics_active";
    pub const MESSAGES_TOTAL: &str = "banter_messages_total";
    pub const MESSAGES_BYTES: &str = "banter_messages_bytes";
    pub const DISPATCH_SECONDS: &str = "banter_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "banter_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::SESSIONS_TOTAL,
        "Total number of sessions since server start"
    );
    metrics::describe_gauge!(names::SESSIONS_ACTIVE, "Current number of live sessions");
    metrics::describe_gauge!(names::TOPICS_ACTIVE, "Current number of live topic actors");
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of envelopes processed");
    metrics::describe_counter!(names::MESSAGES_BYTES, "Total bytes of envelopes processed");
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Envelope dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new().with_http_listener(addr).install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record an envelope.
pub fn record_message(bytes: usize, direction: &str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction.to_string()).increment(1);
    counter!(names::MESSAGES_BYTES, "direction" => direction.to_string()).increment(bytes as u64);
}

/// Record envelope dispatch latency.
pub fn record_dispatch(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Update the live topic count.
pub fn set_active_topics(count: usize) {
    gauge!(names::TOPICS_ACTIVE).set(count as f64);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records session close on drop.
pub struct SessionMetricsGuard;

impl SessionMetricsGuard {
    /// Create a new guard, recording a session start.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::SESSIONS_TOTAL).increment(1);
        gauge!(names::SESSIONS_ACTIVE).increment(1.0);
        Self
    }
}

impl Default for SessionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionMetricsGuard {
    fn drop(&mut self) {
        gauge!(names::SESSIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic without an installed recorder.
        let _guard = SessionMetricsGuard::new();
        record_message(128, "inbound");
        record_error("decode");
    }
}
