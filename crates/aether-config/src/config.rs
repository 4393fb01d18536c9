//! Configuration types.
//!
//! [`AetherConfig`] is the root of a configuration file: where to listen,
//! how to log, which metrics to export, runtime limits, and the endpoint
//! table with per-endpoint flow control.

use std::net::SocketAddr;
use std::time::Duration;

use aether_telemetry::{LogConfig, MetricsConfig, TelemetryConfig};
use aether_ws::{
    EndpointMode, EndpointRouter, FlowControlConfig, RegistryConfig, ServiceConfig, SharedHandler,
    TransportConfig,
};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Complete aether configuration.
///
/// # Example
///
/// ```
/// use aether_config::AetherConfig;
///
/// let config = AetherConfig::default();
/// assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
/// assert!(config.endpoints.is_empty());
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AetherConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging.
    #[serde(default)]
    pub logging: LogConfig,

    /// Prometheus metrics.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Transport limits.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Registry maintenance.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Endpoint table.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

/// How connections reach the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerKind {
    /// HTTP/1.1 server performing the upgrade through hyper.
    #[default]
    Http,
    /// Raw TCP with the handshake done by tokio-tungstenite.
    Tcp,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Socket address to bind.
    pub bind_addr: String,
    /// Listener flavour.
    pub listener: ListenerKind,
    /// Seconds live sessions get to close during shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            listener: ListenerKind::Http,
            shutdown_grace_secs: 30,
        }
    }
}

/// One endpoint: a path template and its flow control.
///
/// ```toml
/// [[endpoints]]
/// path = "/chat/{room}"
/// mode = "broadcast"
///
/// [endpoints.flow.rate_limit]
/// enabled = true
/// limit_for_period = 10
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Path template, e.g. `/chat/{room}`.
    pub path: String,
    /// `session` (default) or `broadcast`.
    #[serde(default)]
    pub mode: EndpointMode,
    /// Heartbeat, rate limit and backpressure.
    #[serde(default)]
    pub flow: FlowControlConfig,
}

impl EndpointConfig {
    /// Per-session endpoint at `path` with `flow`.
    pub fn new(path: impl Into<String>, flow: FlowControlConfig) -> Self {
        Self {
            path: path.into(),
            mode: EndpointMode::Session,
            flow,
        }
    }

    /// Switch the inbound mode.
    pub fn mode(mut self, mode: EndpointMode) -> Self {
        self.mode = mode;
        self
    }
}

impl AetherConfig {
    /// Pretty debug logging, metrics off.
    pub fn development() -> Self {
        Self {
            logging: LogConfig::development(),
            ..Self::default()
        }
    }

    /// JSON logging and a metrics listener on port 9090.
    pub fn production() -> Self {
        Self {
            logging: LogConfig::production(),
            metrics: MetricsConfig {
                enabled: true,
                addr: Some("0.0.0.0:9090".to_string()),
                ..MetricsConfig::default()
            },
            ..Self::default()
        }
    }

    /// Append an endpoint.
    pub fn endpoint(mut self, path: impl Into<String>, flow: FlowControlConfig) -> Self {
        self.endpoints.push(EndpointConfig::new(path, flow));
        self
    }

    /// Flow control configured for exactly `path`.
    pub fn flow_for(&self, path: &str) -> Option<&FlowControlConfig> {
        self.endpoints.iter().find(|e| e.path == path).map(|e| &e.flow)
    }

    /// Runtime settings for [`WebSocketService`](aether_ws::WebSocketService).
    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig::new()
            .transport(self.transport.clone())
            .registry(self.registry.clone())
    }

    /// Logging and metrics settings for [`aether_telemetry::init_telemetry`].
    pub fn telemetry(&self) -> TelemetryConfig {
        TelemetryConfig {
            logging: self.logging.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Shutdown grace period.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_grace_secs)
    }

    /// Build the endpoint table, asking `handler_for` for the handler of
    /// each configured path.
    ///
    /// # Errors
    ///
    /// `MissingHandler` if `handler_for` returns `None`, `InvalidValue` if
    /// an endpoint is rejected by the router.
    pub fn build_router<F>(&self, mut handler_for: F) -> Result<EndpointRouter, ConfigError>
    where
        F: FnMut(&str) -> Option<SharedHandler>,
    {
        let mut router = EndpointRouter::new();
        for (i, endpoint) in self.endpoints.iter().enumerate() {
            let handler = handler_for(&endpoint.path).ok_or_else(|| ConfigError::MissingHandler {
                path: endpoint.path.clone(),
            })?;
            router
                .add_with_mode(&endpoint.path, handler, endpoint.flow.clone(), endpoint.mode)
                .map_err(|e| ConfigError::invalid_value(format!("endpoints[{i}]"), e.to_string()))?;
        }
        Ok(router)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::invalid_value(
                "server.bind_addr",
                format!("invalid socket address: {}", self.server.bind_addr),
            ));
        }

        if self.metrics.enabled {
            if let Some(addr) = &self.metrics.addr {
                if addr.parse::<SocketAddr>().is_err() {
                    return Err(ConfigError::invalid_value(
                        "metrics.addr",
                        format!("invalid socket address: {addr}"),
                    ));
                }
            }
        }

        if self.logging.enabled && self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid_value("logging.level", "must not be empty"));
        }

        self.service_config()
            .validate()
            .map_err(|e| ConfigError::invalid_value("transport/registry", e.to_string()))?;

        for (i, endpoint) in self.endpoints.iter().enumerate() {
            if !endpoint.path.starts_with('/') {
                return Err(ConfigError::invalid_value(
                    format!("endpoints[{i}].path"),
                    format!("must start with '/': {}", endpoint.path),
                ));
            }
            if self.endpoints[..i].iter().any(|e| e.path == endpoint.path) {
                return Err(ConfigError::invalid_value(
                    format!("endpoints[{i}].path"),
                    format!("duplicate endpoint: {}", endpoint.path),
                ));
            }
            endpoint
                .flow
                .validate()
                .map_err(|e| ConfigError::invalid_value(format!("endpoints[{i}].flow"), e.to_string()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_ws::{handler_fn, BackpressureConfig, HandlerError, HeartbeatConfig, Inbound, Outbound, SessionContext};

    async fn idle(_ctx: SessionContext, _inbound: Inbound, _outbound: Outbound) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AetherConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.listener, ListenerKind::Http);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(30));
    }

    #[test]
    fn test_presets() {
        assert!(!AetherConfig::development().logging.json_format);
        let production = AetherConfig::production();
        assert!(production.metrics.enabled);
        assert!(production.validate().is_ok());
    }

    #[test]
    fn test_invalid_bind_addr() {
        let mut config = AetherConfig::default();
        config.server.bind_addr = "localhost".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.bind_addr"));
    }

    #[test]
    fn test_invalid_endpoint_flow_names_index() {
        let config = AetherConfig::default()
            .endpoint("/ok", FlowControlConfig::default())
            .endpoint("/bad", FlowControlConfig::new().heartbeat(HeartbeatConfig::every(30, 10)));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("endpoints[1].flow"));
    }

    #[test]
    fn test_duplicate_and_relative_paths_rejected() {
        let duplicate = AetherConfig::default()
            .endpoint("/a", FlowControlConfig::default())
            .endpoint("/a", FlowControlConfig::default());
        assert!(duplicate.validate().is_err());

        let relative = AetherConfig::default().endpoint("a", FlowControlConfig::default());
        assert!(relative.validate().is_err());
    }

    #[test]
    fn test_flow_for() {
        let flow = FlowControlConfig::new().backpressure(BackpressureConfig::buffer(8));
        let config = AetherConfig::default().endpoint("/feed", flow.clone());
        assert_eq!(config.flow_for("/feed"), Some(&flow));
        assert_eq!(config.flow_for("/other"), None);
    }

    #[test]
    fn test_build_router() {
        let config = AetherConfig::default()
            .endpoint("/chat/{room}", FlowControlConfig::default())
            .endpoint("/feed", FlowControlConfig::default());

        let router = config.build_router(|_| Some(handler_fn(idle))).unwrap();
        assert_eq!(router.len(), 2);
        assert!(router.resolve("/chat/lobby").is_some());

        let missing = config.build_router(|path| (path == "/feed").then(|| handler_fn(idle)));
        assert!(matches!(missing, Err(ConfigError::MissingHandler { path }) if path == "/chat/{room}"));
    }

    #[test]
    fn test_service_config_carries_limits() {
        let mut config = AetherConfig::default();
        config.transport.close_timeout_ms = 250;
        config.registry.cleanup_interval_secs = 5;
        let service = config.service_config();
        assert_eq!(service.transport.close_timeout(), Duration::from_millis(250));
        assert_eq!(service.registry.cleanup_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_endpoint_mode_from_toml() {
        let config: AetherConfig = toml::from_str(
            r#"
            [[endpoints]]
            path = "/lobby"
            mode = "broadcast"

            [[endpoints]]
            path = "/feed"
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoints[0].mode, EndpointMode::Broadcast);
        assert_eq!(config.endpoints[1].mode, EndpointMode::Session);

        let router = config.build_router(|_| Some(handler_fn(idle))).unwrap();
        assert_eq!(router.endpoint("/lobby").unwrap().mode(), EndpointMode::Broadcast);
        assert_eq!(router.endpoint("/feed").unwrap().mode(), EndpointMode::Session);
    }
}
