//! Layered configuration loading.
//!
//! Defaults, then a TOML or JSON file, then `PREFIX__SECTION__KEY`
//! environment variables.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::{AetherConfig, ConfigError, ListenerKind};

/// Configuration loader.
///
/// # Example
///
/// ```no_run
/// use aether_config::ConfigLoader;
///
/// # fn main() -> Result<(), aether_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_defaults()
///     .with_file("aether.toml")?
///     .with_env_prefix("AETHER")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: AetherConfig,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// A loader holding the defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: AetherConfig::default(),
            env_prefix: None,
        }
    }

    /// Reset to the default configuration.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.config = AetherConfig::default();
        self
    }

    /// Start from the development preset.
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = AetherConfig::development();
        self
    }

    /// Start from the production preset.
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = AetherConfig::production();
        self
    }

    /// Load a `.toml` or `.json` file, chosen by extension.
    ///
    /// # Errors
    ///
    /// Missing file, unreadable file, unsupported extension, or a parse
    /// failure (unknown fields included).
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;
        self.config = Self::parse_file(&content, path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Ok(self)
    }

    /// Load a file if it exists.
    ///
    /// # Errors
    ///
    /// As [`with_file`](Self::with_file) when the file exists.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration text in `format` ("toml" or "json").
    ///
    /// ```
    /// use aether_config::ConfigLoader;
    ///
    /// let toml = r#"
    ///     [server]
    ///     bind_addr = "127.0.0.1:3000"
    ///
    ///     [[endpoints]]
    ///     path = "/chat/{room}"
    /// "#;
    ///
    /// let config = ConfigLoader::new().with_string(toml, "toml").unwrap().load().unwrap();
    /// assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
    /// assert_eq!(config.endpoints[0].path, "/chat/{room}");
    /// ```
    ///
    /// # Errors
    ///
    /// Unsupported format or a parse failure.
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_lowercase().as_str() {
            "toml" => toml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            _ => {
                return Err(ConfigError::validation_error(format!(
                    "unsupported configuration format: {format}"
                )))
            }
        };
        Ok(self)
    }

    /// Apply `PREFIX__SECTION__KEY` environment overrides on load.
    ///
    /// - `AETHER__SERVER__BIND_ADDR=0.0.0.0:9000`
    /// - `AETHER__LOGGING__LEVEL=debug`
    /// - `AETHER__METRICS__ENABLED=true`
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Read a `.env` file into the process environment if one exists.
    ///
    /// # Errors
    ///
    /// Never fails today; a missing file is not an error.
    pub fn with_dotenv(self) -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "Loaded .env file");
        }
        Ok(self)
    }

    /// Apply environment overrides and validate.
    ///
    /// # Errors
    ///
    /// A malformed override or a validation failure.
    pub fn load(mut self) -> Result<AetherConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }
        self.config.validate()?;
        Ok(self.config)
    }

    /// The configuration as loaded so far, without overrides or validation.
    #[must_use]
    pub fn load_unvalidated(self) -> AetherConfig {
        self.config
    }

    fn parse_file(content: &str, path: &Path) -> Result<AetherConfig, ConfigError> {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        match extension.as_deref() {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            _ => Err(ConfigError::validation_error(format!(
                "unsupported configuration file format: {}",
                path.display()
            ))),
        }
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let vars: HashMap<String, String> = env::vars().filter(|(k, _)| k.starts_with(prefix)).collect();
        for (key, value) in vars {
            self.apply_env_var(&key, &value, prefix)?;
        }
        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let Some(rest) = key.strip_prefix(prefix).and_then(|k| k.strip_prefix("__")) else {
            // Same prefix, different variable (e.g. AETHERX_...).
            return Ok(());
        };
        let parts: Vec<&str> = rest.split("__").collect();
        let config = &mut self.config;

        match parts.as_slice() {
            ["SERVER", "BIND_ADDR"] => config.server.bind_addr = value.to_string(),
            ["SERVER", "LISTENER"] => {
                config.server.listener = match value.to_lowercase().as_str() {
                    "http" => ListenerKind::Http,
                    "tcp" => ListenerKind::Tcp,
                    _ => return Err(ConfigError::env_parse_error(key, "expected 'http' or 'tcp'")),
                };
            }
            ["SERVER", "SHUTDOWN_GRACE_SECS"] => config.server.shutdown_grace_secs = parse_int(key, value)?,

            ["LOGGING", "ENABLED"] => config.logging.enabled = parse_flag(key, value)?,
            ["LOGGING", "LEVEL"] => config.logging.level = value.to_string(),
            ["LOGGING", "JSON_FORMAT"] => config.logging.json_format = parse_flag(key, value)?,

            ["METRICS", "ENABLED"] => config.metrics.enabled = parse_flag(key, value)?,
            ["METRICS", "ADDR"] => {
                config.metrics.addr = (!value.is_empty()).then(|| value.to_string());
            }

            ["TRANSPORT", "MAX_MESSAGE_SIZE"] => config.transport.max_message_size = parse_int(key, value)?,
            ["TRANSPORT", "MAX_FRAME_SIZE"] => config.transport.max_frame_size = parse_int(key, value)?,
            ["TRANSPORT", "CLOSE_TIMEOUT_MS"] => config.transport.close_timeout_ms = parse_int(key, value)?,

            ["REGISTRY", "CLEANUP_INTERVAL_SECS"] => {
                config.registry.cleanup_interval_secs = parse_int(key, value)?;
            }
            ["REGISTRY", "CLEANUP_INITIAL_DELAY_SECS"] => {
                config.registry.cleanup_initial_delay_secs = parse_int(key, value)?;
            }
            ["REGISTRY", "LIMITER_IDLE_TTL_SECS"] => {
                config.registry.limiter_idle_ttl_secs = parse_int(key, value)?;
            }

            _ => debug!(var = key, "Ignoring unknown configuration variable"),
        }

        Ok(())
    }
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::env_parse_error(key, "expected integer"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env_parse_error(key, "expected boolean"))
}

/// Parse a boolean from a string.
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_ws::BackpressureStrategy;
    use std::io::Write;

    #[test]
    fn test_loader_new() {
        let config = ConfigLoader::new().load().unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_loader_presets() {
        let dev = ConfigLoader::new().with_development().load().unwrap();
        assert_eq!(dev.logging.level, "debug");
        let prod = ConfigLoader::new().with_production().load().unwrap();
        assert!(prod.logging.json_format);
    }

    #[test]
    fn test_loader_with_string_json() {
        let json = r#"{"server": {"bind_addr": "127.0.0.1:3000"}, "endpoints": [{"path": "/feed"}]}"#;
        let config = ConfigLoader::new().with_string(json, "json").unwrap().load().unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:3000");
        assert_eq!(config.endpoints.len(), 1);
    }

    #[test]
    fn test_loader_rejects_unknown_fields() {
        let toml = r#"
            [server]
            bind_addr = "127.0.0.1:3000"
            http2 = true
        "#;
        assert!(matches!(
            ConfigLoader::new().with_string(toml, "toml"),
            Err(ConfigError::TomlError(_))
        ));
    }

    #[test]
    fn test_loader_rejects_unknown_format() {
        assert!(ConfigLoader::new().with_string("", "yaml").is_err());
    }

    #[test]
    fn test_loader_with_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
            [logging]
            level = "warn"

            [[endpoints]]
            path = "/feed"

            [endpoints.flow.backpressure]
            enabled = true
            strategy = "DROP_OLDEST"
            "#
        )
        .unwrap();

        let config = ConfigLoader::new().with_file(file.path()).unwrap().load().unwrap();
        assert_eq!(config.logging.level, "warn");
        let flow = config.flow_for("/feed").unwrap();
        assert_eq!(flow.backpressure.strategy, BackpressureStrategy::DropOldest);
    }

    #[test]
    fn test_loader_with_unsupported_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(ConfigLoader::new().with_file(file.path()).is_err());
    }

    #[test]
    fn test_loader_with_file_not_found() {
        let result = ConfigLoader::new().with_file("/nonexistent/aether.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_loader_with_optional_file_not_found() {
        let config = ConfigLoader::new()
            .with_optional_file("/nonexistent/aether.toml")
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_load_validates() {
        let toml = r#"
            [[endpoints]]
            path = "/feed"

            [endpoints.flow.rate_limit]
            enabled = true
            limit_for_period = 0
        "#;
        let loader = ConfigLoader::new().with_string(toml, "toml").unwrap();
        assert!(loader.load().is_err());

        let unvalidated = ConfigLoader::new().with_string(toml, "toml").unwrap().load_unvalidated();
        assert_eq!(unvalidated.endpoints[0].flow.rate_limit.limit_for_period, 0);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("on"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    // Overrides are exercised through apply_env_var; mutating the process
    // environment is unsafe and the workspace forbids unsafe code.

    #[test]
    fn test_apply_env_var_server() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("AETHER__SERVER__BIND_ADDR", "127.0.0.1:9000", "AETHER").unwrap();
        loader.apply_env_var("AETHER__SERVER__LISTENER", "tcp", "AETHER").unwrap();
        assert_eq!(loader.config.server.bind_addr, "127.0.0.1:9000");
        assert_eq!(loader.config.server.listener, ListenerKind::Tcp);
    }

    #[test]
    fn test_apply_env_var_sections() {
        let mut loader = ConfigLoader::new();
        loader.apply_env_var("AETHER__LOGGING__LEVEL", "trace", "AETHER").unwrap();
        loader.apply_env_var("AETHER__METRICS__ENABLED", "yes", "AETHER").unwrap();
        loader.apply_env_var("AETHER__TRANSPORT__CLOSE_TIMEOUT_MS", "250", "AETHER").unwrap();
        loader.apply_env_var("AETHER__REGISTRY__LIMITER_IDLE_TTL_SECS", "30", "AETHER").unwrap();
        assert_eq!(loader.config.logging.level, "trace");
        assert!(loader.config.metrics.enabled);
        assert_eq!(loader.config.transport.close_timeout_ms, 250);
        assert_eq!(loader.config.registry.limiter_idle_ttl_secs, 30);
    }

    #[test]
    fn test_apply_env_var_invalid() {
        let mut loader = ConfigLoader::new();
        assert!(loader.apply_env_var("AETHER__TRANSPORT__MAX_FRAME_SIZE", "big", "AETHER").is_err());
        assert!(loader.apply_env_var("AETHER__LOGGING__ENABLED", "maybe", "AETHER").is_err());
        assert!(loader.apply_env_var("AETHER__SERVER__LISTENER", "udp", "AETHER").is_err());
        assert!(loader.apply_env_var("AETHER__UNKNOWN__KEY", "x", "AETHER").is_ok());
    }
}
