//! Prometheus metrics for WebSocket sessions.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `aether_sessions_active` | Gauge | `path` | Open sessions |
//! | `aether_sessions_opened_total` | Counter | `path` | Sessions accepted |
//! | `aether_sessions_closed_total` | Counter | `path`, `initiator` | Sessions torn down |
//! | `aether_session_duration_seconds` | Histogram | `path` | Session lifetime |
//! | `aether_messages_received_total` | Counter | `path` | Inbound frames delivered to handlers |
//! | `aether_messages_sent_total` | Counter | `path` | Outbound application frames |
//! | `aether_rate_limited_total` | Counter | `path` | Inbound frames dropped by the rate limiter |
//! | `aether_backpressure_dropped_total` | Counter | `path`, `strategy` | Outbound frames dropped by backpressure |
//! | `aether_heartbeat_pings_total` | Counter | `path` | Heartbeat pings sent |
//!
//! Recording before [`init_metrics`] is a no-op, so the session runtime
//! records unconditionally.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

use crate::error::TelemetryError;
use crate::TelemetryResult;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names.
pub mod names {
    /// Open sessions gauge.
    pub const SESSIONS_ACTIVE: &str = "aether_sessions_active";
    /// Accepted sessions counter.
    pub const SESSIONS_OPENED: &str = "aether_sessions_opened_total";
    /// Closed sessions counter.
    pub const SESSIONS_CLOSED: &str = "aether_sessions_closed_total";
    /// Session lifetime histogram.
    pub const SESSION_DURATION: &str = "aether_session_duration_seconds";
    /// Inbound frames counter.
    pub const MESSAGES_RECEIVED: &str = "aether_messages_received_total";
    /// Outbound frames counter.
    pub const MESSAGES_SENT: &str = "aether_messages_sent_total";
    /// Rate-limited frames counter.
    pub const RATE_LIMITED: &str = "aether_rate_limited_total";
    /// Backpressure drops counter.
    pub const BACKPRESSURE_DROPPED: &str = "aether_backpressure_dropped_total";
    /// Heartbeat pings counter.
    pub const HEARTBEAT_PINGS: &str = "aether_heartbeat_pings_total";
}

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Address for the scrape endpoint (e.g. "0.0.0.0:9090"). When unset
    /// the recorder is installed without a listener and metrics are only
    /// available through [`render_metrics`].
    pub addr: Option<String>,

    /// Buckets for the session duration histogram, in seconds.
    pub duration_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: None,
            duration_buckets: vec![1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0],
        }
    }
}

/// Installs the Prometheus recorder and, when an address is configured,
/// spawns its HTTP listener on the current tokio runtime.
///
/// # Errors
///
/// Returns `TelemetryError` if the address is invalid or a recorder is
/// already installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let mut builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full(names::SESSION_DURATION.to_string()),
            &config.duration_buckets,
        )
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let handle = if let Some(addr) = &config.addr {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|e| TelemetryError::InvalidAddress(format!("{addr}: {e}")))?;
        builder = builder.with_http_listener(addr);

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder)
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = exporter.await {
                tracing::warn!(error = ?e, "Metrics listener stopped");
            }
        });
        handle
    } else {
        builder
            .install_recorder()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?
    };

    let _ = METRICS_HANDLE.set(handle);
    register_metric_descriptions();

    Ok(())
}

/// Renders metrics in Prometheus text format, if initialized.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_gauge!(names::SESSIONS_ACTIVE, "Number of open WebSocket sessions");
    describe_counter!(names::SESSIONS_OPENED, "Total sessions accepted");
    describe_counter!(names::SESSIONS_CLOSED, "Total sessions closed by initiator");
    describe_histogram!(names::SESSION_DURATION, "Session lifetime in seconds");
    describe_counter!(names::MESSAGES_RECEIVED, "Inbound frames delivered to handlers");
    describe_counter!(names::MESSAGES_SENT, "Outbound application frames written");
    describe_counter!(names::RATE_LIMITED, "Inbound frames dropped by rate limiting");
    describe_counter!(
        names::BACKPRESSURE_DROPPED,
        "Outbound frames discarded by the backpressure strategy"
    );
    describe_counter!(names::HEARTBEAT_PINGS, "Heartbeat ping frames sent");
}

/// Records an accepted session.
pub fn record_session_opened(path: &str) {
    counter!(names::SESSIONS_OPENED, "path" => path.to_string()).increment(1);
    gauge!(names::SESSIONS_ACTIVE, "path" => path.to_string()).increment(1.0);
}

/// Records a session teardown.
pub fn record_session_closed(path: &str, initiator: &'static str, lifetime: Duration) {
    counter!(
        names::SESSIONS_CLOSED,
        "path" => path.to_string(),
        "initiator" => initiator
    )
    .increment(1);
    gauge!(names::SESSIONS_ACTIVE, "path" => path.to_string()).decrement(1.0);
    histogram!(names::SESSION_DURATION, "path" => path.to_string()).record(lifetime.as_secs_f64());
}

/// Records an inbound frame handed to the processing stage.
pub fn record_message_received(path: &str) {
    counter!(names::MESSAGES_RECEIVED, "path" => path.to_string()).increment(1);
}

/// Records an outbound application frame.
pub fn record_message_sent(path: &str) {
    counter!(names::MESSAGES_SENT, "path" => path.to_string()).increment(1);
}

/// Records an inbound frame denied by the rate limiter.
pub fn record_rate_limited(path: &str) {
    counter!(names::RATE_LIMITED, "path" => path.to_string()).increment(1);
}

/// Records an outbound frame discarded by a backpressure strategy.
pub fn record_backpressure_drop(path: &str, strategy: &'static str) {
    counter!(
        names::BACKPRESSURE_DROPPED,
        "path" => path.to_string(),
        "strategy" => strategy
    )
    .increment(1);
}

/// Records a heartbeat ping.
pub fn record_heartbeat_ping(path: &str) {
    counter!(names::HEARTBEAT_PINGS, "path" => path.to_string()).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_disabled() {
        let config = MetricsConfig::default();
        assert!(!config.enabled);
        assert!(config.addr.is_none());
        assert!(!config.duration_buckets.is_empty());
    }

    #[test]
    fn test_disabled_metrics_is_noop() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_address_rejected() {
        let config = MetricsConfig {
            enabled: true,
            addr: Some("not-an-address".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            init_metrics(&config),
            Err(TelemetryError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_session_opened("/chat/{room}");
        record_message_received("/chat/{room}");
        record_rate_limited("/chat/{room}");
        record_backpressure_drop("/chat/{room}", "drop_latest");
        record_heartbeat_ping("/chat/{room}");
        record_session_closed("/chat/{room}", "client", Duration::from_secs(3));
    }
}
