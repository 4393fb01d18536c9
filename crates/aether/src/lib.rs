//! # Aether
//!
//! **Reactive WebSocket sessions with per-endpoint flow control.**
//!
//! Each connection runs as a session with an inbound and an outbound
//! stream. Endpoints choose their own heartbeat, inbound rate limit and
//! outbound backpressure strategy; a registry tracks live sessions so the
//! server can push to them at any time.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use aether::prelude::*;
//!
//! async fn echo(ctx: SessionContext, mut inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
//!     while let Some(msg) = inbound.recv().await {
//!         if let Some(text) = msg.as_text() {
//!             outbound.send(format!("{}: {text}", ctx.path_param("room").unwrap_or("?")))?;
//!         }
//!     }
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), aether::Error> {
//!     let config = ConfigLoader::new().with_optional_file("aether.toml")?.with_env_prefix("AETHER").load()?;
//!     let endpoints = config.build_router(|path| (path == "/chat/{room}").then(|| handler_fn(echo)))?;
//!     aether::serve(&config, endpoints, aether::ctrl_c()).await
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod server;

pub use aether_config as config;
pub use aether_router as router;
pub use aether_telemetry as telemetry;
pub use aether_ws as ws;

pub use server::{ctrl_c, serve, Error};

/// Common imports.
pub mod prelude {
    pub use aether_config::{AetherConfig, ConfigLoader, EndpointConfig, ListenerKind};
    pub use aether_ws::{
        handler_fn, BackpressureConfig, BackpressureStrategy, CloseCode, CloseStatus, EndpointMode,
        EndpointRouter, FlowControlConfig, HandlerError, HeartbeatConfig, Inbound, Message, Outbound,
        Payload, RateLimitConfig, RateLimitScope, ServiceConfig, SessionContext, SessionEvent,
        SessionId, TimeUnit, WebSocketService, WebSocketTemplate, WsError, WsResult,
    };
}
