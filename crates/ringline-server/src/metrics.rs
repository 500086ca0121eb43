//! Metrics collection and export for Ringline.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use ringline_core::{EndReason, RouterStats};
use ringline_protocol::ErrorCode;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "ringline_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "ringline_connections_active";
    pub const HANDSHAKE_FAILURES_TOTAL: &str = "ringline_handshake_failures_total";
    pub const FRAMES_TOTAL: &str = "ringline_frames_total";
    pub const REJECTIONS_TOTAL: &str = "ringline_rejections_total";
    pub const RELAY_LATENCY_SECONDS: &str = "ringline_relay_latency_seconds";
    pub const PRESENCE_ONLINE: &str = "ringline_presence_online";
    pub const CALLS_LIVE: &str = "ringline_calls_live";
    pub const CALLS_RETAINED: &str = "ringline_calls_retained";
    pub const CALLS_ENDED_TOTAL: &str = "ringline_calls_ended_total";
    pub const INVARIANT_VIOLATIONS_TOTAL: &str = "ringline_invariant_violations_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::HANDSHAKE_FAILURES_TOTAL,
        "Connections closed before completing the handshake"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Frames processed, by direction");
    metrics::describe_counter!(names::REJECTIONS_TOTAL, "Rejected client frames, by error code");
    metrics::describe_histogram!(
        names::RELAY_LATENCY_SECONDS,
        "Time spent dispatching one inbound frame"
    );
    metrics::describe_gauge!(names::PRESENCE_ONLINE, "Identities currently registered");
    metrics::describe_gauge!(names::CALLS_LIVE, "Calls not yet in a terminal state");
    metrics::describe_gauge!(names::CALLS_RETAINED, "Ended calls kept for lookups");
    metrics::describe_counter!(names::CALLS_ENDED_TOTAL, "Calls ended by the server, by reason");
    metrics::describe_counter!(
        names::INVARIANT_VIOLATIONS_TOTAL,
        "Call state invariant violations detected"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a connection that never completed its handshake.
pub fn record_handshake_failure() {
    counter!(names::HANDSHAKE_FAILURES_TOTAL).increment(1);
}

/// Record a frame; `direction` is `inbound` or `outbound`.
pub fn record_frame(direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
}

/// Record a rejection sent to a client.
pub fn record_rejection(code: ErrorCode) {
    counter!(names::REJECTIONS_TOTAL, "code" => code.label()).increment(1);
}

/// Record dispatch latency.
pub fn record_latency(seconds: f64) {
    histogram!(names::RELAY_LATENCY_SECONDS).record(seconds);
}

/// Record a call ended by a timer or a lost participant.
pub fn record_call_ended(reason: EndReason) {
    counter!(names::CALLS_ENDED_TOTAL, "reason" => reason.as_str()).increment(1);
}

/// Publish a stats snapshot.
pub fn set_router_stats(stats: &RouterStats) {
    gauge!(names::PRESENCE_ONLINE).set(stats.online as f64);
    gauge!(names::CALLS_LIVE).set(stats.live_calls as f64);
    gauge!(names::CALLS_RETAINED).set(stats.retained_calls as f64);
    counter!(names::INVARIANT_VIOLATIONS_TOTAL).absolute(stats.invariant_violations);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
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
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: every call is a no-op.
        let _guard = ConnectionMetricsGuard::new();
        record_frame("inbound");
        record_rejection(ErrorCode::RateLimited);
        record_call_ended(EndReason::Timeout);
        set_router_stats(&RouterStats::default());
    }
}
