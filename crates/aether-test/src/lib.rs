//! # Aether Test
//!
//! In-memory sessions for exercising aether endpoints without sockets.
//!
//! [`memory_transport`] builds a [`Transport`](aether_ws::Transport) and a
//! connected [`TestClient`]. Hand the transport to
//! [`WebSocketService::serve_connection`](aether_ws::WebSocketService::serve_connection)
//! or use [`TestClient::connect`] to do both at once.
//!
//! ```ignore
//! use aether_test::TestClient;
//! use aether_ws::{EndpointRouter, FlowControlConfig, ServiceConfig, WebSocketService};
//!
//! let service = WebSocketService::new(
//!     EndpointRouter::new().route("/echo", echo, FlowControlConfig::default())?,
//!     ServiceConfig::default(),
//! )?;
//!
//! let (mut client, _session) = TestClient::connect(&service, "/echo");
//! client.send_text("ping").await?;
//! assert_eq!(client.recv_text().await?, "ping");
//! ```

mod client;
mod error;
mod transport;

pub use client::{SessionHandle, TestClient};
pub use error::TestError;
pub use transport::{memory_transport, memory_transport_with_capacity, DEFAULT_CAPACITY};
