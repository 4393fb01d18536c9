//! Flow-control and runtime configuration.
//!
//! [`FlowControlConfig`] is resolved once per endpoint at registration
//! and never mutated afterwards. [`ServiceConfig`] covers the process-wide
//! runtime: transport limits and registry maintenance.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{WsError, WsResult};

/// Heartbeat ping settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Whether pings are sent.
    pub enabled: bool,
    /// Seconds between pings.
    pub interval_secs: u64,
    /// Seconds without any inbound frame before the session is closed.
    pub timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 30,
            timeout_secs: 60,
        }
    }
}

impl HeartbeatConfig {
    /// Enabled heartbeat with the given interval and timeout.
    pub fn every(interval_secs: u64, timeout_secs: u64) -> Self {
        Self {
            enabled: true,
            interval_secs,
            timeout_secs,
        }
    }

    /// Ping interval.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Inbound silence tolerated before closing.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Unit of a rate-limit refresh period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    /// Nanoseconds.
    Nanoseconds,
    /// Microseconds.
    Microseconds,
    /// Milliseconds.
    Milliseconds,
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
}

impl TimeUnit {
    /// `amount` of this unit as a duration.
    pub fn duration(self, amount: u64) -> Duration {
        match self {
            Self::Nanoseconds => Duration::from_nanos(amount),
            Self::Microseconds => Duration::from_micros(amount),
            Self::Milliseconds => Duration::from_millis(amount),
            Self::Seconds => Duration::from_secs(amount),
            Self::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            Self::Hours => Duration::from_secs(amount.saturating_mul(3_600)),
            Self::Days => Duration::from_secs(amount.saturating_mul(86_400)),
        }
    }

    /// Lower-case unit name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nanoseconds => "nanoseconds",
            Self::Microseconds => "microseconds",
            Self::Milliseconds => "milliseconds",
            Self::Seconds => "seconds",
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
        }
    }
}

/// Key granularity for inbound rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateLimitScope {
    /// One limiter per session.
    Session,
    /// One limiter per authenticated user; anonymous sessions fall back to
    /// their session id.
    User,
    /// One limiter per remote IP; unknown addresses fall back to the
    /// session id.
    Ip,
}

impl RateLimitScope {
    /// Upper-case scope name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Session => "SESSION",
            Self::User => "USER",
            Self::Ip => "IP",
        }
    }
}

/// Inbound rate-limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Whether inbound messages are rate limited.
    pub enabled: bool,
    /// Permits granted per refresh period.
    pub limit_for_period: u32,
    /// Refresh period length, in `time_unit`.
    pub refresh_period: u64,
    /// Unit of `refresh_period`.
    pub time_unit: TimeUnit,
    /// How long an acquire may wait for a permit, in milliseconds.
    pub timeout_ms: u64,
    /// Limiter key granularity.
    pub scope: RateLimitScope,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit_for_period: 10,
            refresh_period: 1,
            time_unit: TimeUnit::Seconds,
            timeout_ms: 25,
            scope: RateLimitScope::Session,
        }
    }
}

impl RateLimitConfig {
    /// Enabled limit of `limit_for_period` permits per `refresh_period` `time_unit`.
    pub fn per(limit_for_period: u32, refresh_period: u64, time_unit: TimeUnit) -> Self {
        Self {
            enabled: true,
            limit_for_period,
            refresh_period,
            time_unit,
            ..Self::default()
        }
    }

    /// Set the acquire timeout.
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Set the scope.
    pub fn scope(mut self, scope: RateLimitScope) -> Self {
        self.scope = scope;
        self
    }

    /// Refresh period as a duration.
    pub fn refresh_duration(&self) -> Duration {
        self.time_unit.duration(self.refresh_period)
    }

    /// Acquire timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outbound backpressure strategy.
///
/// Deserializes from the upper-case names `BUFFER`, `DROP_OLDEST`,
/// `DROP_LATEST` and `ERROR`; anything else is kept as
/// [`BackpressureStrategy::Unrecognized`] and degrades to pass-through at
/// session start with a warning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackpressureStrategy {
    /// Queue up to `buffer_size` pending messages, dropping the oldest on overflow.
    Buffer,
    /// Keep only the most recent pending message.
    DropOldest,
    /// Keep the pending message and discard newer ones until it is sent.
    DropLatest,
    /// Fail the session when the consumer falls behind.
    Error,
    /// A strategy name that is not understood.
    Unrecognized(String),
}

impl BackpressureStrategy {
    /// Canonical name.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Buffer => "BUFFER",
            Self::DropOldest => "DROP_OLDEST",
            Self::DropLatest => "DROP_LATEST",
            Self::Error => "ERROR",
            Self::Unrecognized(name) => name,
        }
    }
}

impl From<String> for BackpressureStrategy {
    fn from(name: String) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "BUFFER" => Self::Buffer,
            "DROP_OLDEST" => Self::DropOldest,
            "DROP_LATEST" => Self::DropLatest,
            "ERROR" => Self::Error,
            _ => Self::Unrecognized(name),
        }
    }
}

impl From<&str> for BackpressureStrategy {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<BackpressureStrategy> for String {
    fn from(strategy: BackpressureStrategy) -> Self {
        strategy.as_str().to_string()
    }
}

impl fmt::Display for BackpressureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound backpressure settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Whether a strategy is applied.
    pub enabled: bool,
    /// The strategy.
    pub strategy: BackpressureStrategy,
    /// Pending-message bound, used only by `BUFFER`.
    pub buffer_size: usize,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strategy: BackpressureStrategy::Buffer,
            buffer_size: 256,
        }
    }
}

impl BackpressureConfig {
    /// Enabled `BUFFER` strategy with the given bound.
    pub fn buffer(buffer_size: usize) -> Self {
        Self {
            enabled: true,
            strategy: BackpressureStrategy::Buffer,
            buffer_size,
        }
    }

    /// Enabled strategy with the default buffer size.
    pub fn strategy(strategy: impl Into<BackpressureStrategy>) -> Self {
        Self {
            enabled: true,
            strategy: strategy.into(),
            ..Self::default()
        }
    }
}

/// Per-endpoint flow control: heartbeat, inbound rate limit and outbound
/// backpressure.
///
/// # Example
///
/// ```
/// use aether_ws::{BackpressureConfig, FlowControlConfig, HeartbeatConfig, RateLimitConfig, TimeUnit};
///
/// let flow = FlowControlConfig::new()
///     .heartbeat(HeartbeatConfig::every(30, 60))
///     .rate_limit(RateLimitConfig::per(10, 1, TimeUnit::Seconds))
///     .backpressure(BackpressureConfig::buffer(64));
///
/// assert!(flow.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowControlConfig {
    /// Heartbeat settings.
    pub heartbeat: HeartbeatConfig,
    /// Inbound rate-limit settings.
    pub rate_limit: RateLimitConfig,
    /// Outbound backpressure settings.
    pub backpressure: BackpressureConfig,
}

impl FlowControlConfig {
    /// All policies disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set heartbeat settings.
    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Set rate-limit settings.
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Set backpressure settings.
    pub fn backpressure(mut self, backpressure: BackpressureConfig) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Reject settings that can only be programmer error. An unrecognized
    /// backpressure strategy is accepted here and degrades at runtime.
    pub fn validate(&self) -> WsResult<()> {
        let hb = &self.heartbeat;
        if hb.enabled {
            if hb.interval_secs == 0 {
                return Err(WsError::invalid_config("heartbeat interval must be positive"));
            }
            if hb.timeout_secs < hb.interval_secs {
                return Err(WsError::invalid_config(format!(
                    "heartbeat timeout ({}s) is shorter than the interval ({}s)",
                    hb.timeout_secs, hb.interval_secs
                )));
            }
        }

        let rl = &self.rate_limit;
        if rl.enabled {
            if rl.limit_for_period == 0 {
                return Err(WsError::invalid_config("rate limit must allow at least one permit"));
            }
            if rl.refresh_duration().is_zero() {
                return Err(WsError::invalid_config("rate limit refresh period must be positive"));
            }
        }

        let bp = &self.backpressure;
        if bp.enabled && bp.strategy == BackpressureStrategy::Buffer && bp.buffer_size == 0 {
            return Err(WsError::invalid_config("BUFFER backpressure needs a positive buffer size"));
        }

        Ok(())
    }
}

/// Transport limits applied to accepted sockets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Maximum frame size in bytes.
    pub max_frame_size: usize,
    /// How long teardown waits to flush a close frame, in milliseconds.
    pub close_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024, // 64 MB
            max_frame_size: 16 * 1024 * 1024,   // 16 MB
            close_timeout_ms: 1_000,
        }
    }
}

impl TransportConfig {
    /// tungstenite protocol settings.
    pub fn to_protocol_config(&self) -> tungstenite::protocol::WebSocketConfig {
        tungstenite::protocol::WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_frame_size))
    }

    /// Close-frame flush timeout.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Session registry maintenance settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Seconds between orphan sweeps.
    pub cleanup_interval_secs: u64,
    /// Seconds before the first sweep.
    pub cleanup_initial_delay_secs: u64,
    /// Seconds a rate limiter may sit unused before it is evicted.
    pub limiter_idle_ttl_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            cleanup_initial_delay_secs: 60,
            limiter_idle_ttl_secs: 600,
        }
    }
}

impl RegistryConfig {
    /// Sweep interval.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Delay before the first sweep.
    pub fn cleanup_initial_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_initial_delay_secs)
    }

    /// Idle time after which a limiter is evicted.
    pub fn limiter_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.limiter_idle_ttl_secs)
    }
}

/// Process-wide runtime settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Transport limits.
    pub transport: TransportConfig,
    /// Registry maintenance.
    pub registry: RegistryConfig,
}

impl ServiceConfig {
    /// Default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set transport limits.
    pub fn transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    /// Set registry maintenance.
    pub fn registry(mut self, registry: RegistryConfig) -> Self {
        self.registry = registry;
        self
    }

    /// Reject zero intervals.
    pub fn validate(&self) -> WsResult<()> {
        if self.registry.cleanup_interval_secs == 0 {
            return Err(WsError::invalid_config("cleanup interval must be positive"));
        }
        if self.transport.max_frame_size > self.transport.max_message_size {
            return Err(WsError::invalid_config(
                "max frame size cannot exceed max message size",
            ));
        }
        Ok(())
    }
}
