//! Per-session WebSocket runtime for aether.
//!
//! Every accepted connection becomes a session: a long-lived,
//! bidirectional pipeline with its own stream pair, flow-control policy
//! and user handler. This crate owns that runtime, from the endpoint
//! table that picks a handler to the teardown that releases everything
//! exactly once.
//!
//! # Features
//!
//! - **Endpoint table** mapping path templates to handlers and flow control,
//!   per-session or broadcast (every client frame reaches every handler)
//! - **Inbound rate limiting** per session, user or client IP
//! - **Outbound backpressure** with BUFFER, DROP_OLDEST, DROP_LATEST and ERROR
//! - **Heartbeats** interleaved ahead of application traffic, with a
//!   liveness deadline
//! - **Session registry** and a messaging template for server-side pushes
//! - **Lifecycle events** published once per open and once per close
//! - **Serving** over raw TCP (`tokio-tungstenite`) or hyper upgrades
//!
//! # Example
//!
//! ```ignore
//! use aether_ws::{
//!     EndpointRouter, FlowControlConfig, HandlerError, Inbound, Outbound,
//!     RateLimitConfig, ServiceConfig, SessionContext, TimeUnit, WebSocketService,
//! };
//!
//! async fn echo(_ctx: SessionContext, mut inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
//!     while let Some(msg) = inbound.recv().await {
//!         if let Some(text) = msg.as_text() {
//!             outbound.send(text.to_owned())?;
//!         }
//!     }
//!     Ok(())
//! }
//!
//! let endpoints = EndpointRouter::new().route(
//!     "/echo",
//!     echo,
//!     FlowControlConfig::new().rate_limit(RateLimitConfig::per(10, 1, TimeUnit::Seconds)),
//! )?;
//! let service = WebSocketService::new(endpoints, ServiceConfig::default())?;
//! service.start_maintenance();
//! service.serve_tcp(tokio::net::TcpListener::bind("0.0.0.0:8080").await?).await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       WebSocketService                       │
//! │                                                              │
//! │  EndpointRouter ── SessionRegistry ── RateLimiterService     │
//! │        │                  ▲                   ▲              │
//! │        ▼                  │                   │              │
//! │   run_session ──register──┘      limiter per identifier      │
//! │        │                                                     │
//! │        ├─ receive loop ─► rate limit ─► inbound ─► handler   │
//! │        ├─ send loop ◄─ backpressure queue ◄─ outbound        │
//! │        │      ▲                                              │
//! │        │      └─ heartbeat                                   │
//! │        └─ close listener / shutdown                          │
//! │                                                              │
//! │  teardown: unregister → close streams → Close frame → event  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Close codes
//!
//! | Cause                              | Code |
//! |------------------------------------|------|
//! | handler finished, error response   | 1000 |
//! | server shutdown, heartbeat timeout | 1001 |
//! | unknown path, ERROR backpressure   | 1008 |
//! | handler failure                    | 1011 |

pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod flow;
pub mod handler;
pub mod message;
mod orchestrator;
pub mod rate_limit;
pub mod registry;
pub mod service;
pub mod session;
pub mod streams;
pub mod template;
pub mod transport;
pub mod upgrade;

pub use config::{
    BackpressureConfig, BackpressureStrategy, FlowControlConfig, HeartbeatConfig, RateLimitConfig,
    RateLimitScope, RegistryConfig, ServiceConfig, TimeUnit, TransportConfig,
};
pub use endpoint::{Endpoint, EndpointMode, EndpointRouter};
pub use error::{CloseCode, HandlerError, WsError, WsResult};
pub use events::{SessionCloseInfo, SessionEvent, SessionEventBus};
pub use flow::{BackpressureQueue, Overflow, PushOutcome, QueueItem, QueuePolicy};
pub use handler::{handler_fn, HandlerFuture, MessageHandler, SharedHandler};
pub use message::{CloseFrame, Message, Payload};
pub use rate_limit::{resolve_identifier, LimiterShape, RateLimiter, RateLimiterService};
pub use registry::{RegistryStats, SessionRegistry};
pub use service::WebSocketService;
pub use session::{
    CloseInitiator, CloseStatus, HandshakeInfo, Principal, Session, SessionContext, SessionId,
    SessionState,
};
pub use streams::{Inbound, Outbound, OutboundSignal, SessionStreams};
pub use template::WebSocketTemplate;
pub use transport::{BoxFrameSink, BoxFrameStream, Transport};
pub use upgrade::{
    complete_upgrade, compute_accept_key, is_websocket_request, prepare_upgrade,
    validate_upgrade_request, WebSocketUpgrade,
};
