//! Observability for aether: structured logging and Prometheus metrics.
//!
//! ```rust,ignore
//! use aether_telemetry::{init_telemetry, LogConfig, MetricsConfig, TelemetryConfig};
//!
//! init_telemetry(&TelemetryConfig {
//!     logging: LogConfig::production(),
//!     metrics: MetricsConfig { enabled: true, addr: Some("0.0.0.0:9090".into()), ..Default::default() },
//! })?;
//! ```

pub mod error;
pub mod logging;
pub mod metrics;

use serde::{Deserialize, Serialize};

pub use error::TelemetryError;
pub use logging::{init_logging, LogConfig};
pub use metrics::{init_metrics, render_metrics, MetricsConfig};

/// Result type for telemetry operations.
pub type TelemetryResult<T> = Result<T, TelemetryError>;

/// Logging and metrics configuration together.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Logging configuration.
    pub logging: LogConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

/// Installs logging then metrics.
///
/// # Errors
///
/// Returns the first installation failure.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryResult<()> {
    init_logging(&config.logging)?;
    init_metrics(&config.metrics)?;
    Ok(())
}
