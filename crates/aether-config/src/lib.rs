//! Typed configuration for aether.
//!
//! A single file describes the listener, logging, metrics, runtime limits
//! and the endpoint table. Layers apply in order: defaults, then a TOML or
//! JSON file, then `AETHER__SECTION__KEY` environment variables.
//!
//! # Example
//!
//! ```no_run
//! use aether_config::ConfigLoader;
//!
//! # fn main() -> Result<(), aether_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_dotenv()?
//!     .with_optional_file("aether.toml")?
//!     .with_env_prefix("AETHER")
//!     .load()?;
//!
//! println!("listening on {}", config.server.bind_addr);
//! # Ok(())
//! # }
//! ```
//!
//! # File format
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:8080"
//! listener = "http"
//! shutdown_grace_secs = 30
//!
//! [logging]
//! level = "info"
//! json_format = true
//!
//! [metrics]
//! enabled = true
//! addr = "0.0.0.0:9090"
//!
//! [registry]
//! cleanup_interval_secs = 60
//! limiter_idle_ttl_secs = 600
//!
//! [[endpoints]]
//! path = "/chat/{room}"
//!
//! [endpoints.flow.heartbeat]
//! enabled = true
//! interval_secs = 30
//! timeout_secs = 60
//!
//! [endpoints.flow.rate_limit]
//! enabled = true
//! limit_for_period = 10
//! refresh_period = 1
//! time_unit = "SECONDS"
//! scope = "USER"
//!
//! [endpoints.flow.backpressure]
//! enabled = true
//! strategy = "BUFFER"
//! buffer_size = 64
//! ```

mod config;
mod error;
mod loader;

pub use config::{AetherConfig, EndpointConfig, ListenerKind, ServerConfig};
pub use error::ConfigError;
pub use loader::ConfigLoader;
