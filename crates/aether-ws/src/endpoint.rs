//! The endpoint table.
//!
//! Each endpoint binds a path template to a handler and its flow-control
//! configuration. The table is built once at startup; configuration is
//! validated on insertion and never changes afterwards.
//!
//! A broadcast-mode endpoint shares one inbound channel between all of its
//! sessions: every client frame on the template reaches every session's
//! handler, while rate limiting, backpressure and heartbeat stay per
//! session.
//!
//! ```ignore
//! let endpoints = EndpointRouter::new()
//!     .route("/chat/{room}", chat_handler, FlowControlConfig::new()
//!         .rate_limit(RateLimitConfig::per(10, 1, TimeUnit::Seconds)))?
//!     .route("/feed", feed_handler, FlowControlConfig::default())?
//!     .route_broadcast("/lobby", lobby_handler, FlowControlConfig::default())?;
//! ```

use std::fmt;
use std::sync::Arc;

use aether_router::{Params, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::FlowControlConfig;
use crate::error::{WsError, WsResult};
use crate::handler::{MessageHandler, SharedHandler};
use crate::message::Message;
use crate::session::Session;
use crate::streams::{SessionStreams, STREAM_CAPACITY};

/// How an endpoint's sessions see inbound traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointMode {
    /// Each handler sees only its own client's frames.
    #[default]
    Session,
    /// Each handler sees the frames of every client on the endpoint.
    Broadcast,
}

/// One routable endpoint.
pub struct Endpoint {
    template: String,
    handler: SharedHandler,
    flow: FlowControlConfig,
    shared_inbound: Option<broadcast::Sender<Message>>,
}

impl Endpoint {
    /// The path template.
    pub fn template(&self) -> &str {
        &self.template
    }

    /// The processing stage.
    pub fn handler(&self) -> &SharedHandler {
        &self.handler
    }

    /// Flow-control settings.
    pub fn flow(&self) -> &FlowControlConfig {
        &self.flow
    }

    /// Inbound mode.
    pub fn mode(&self) -> EndpointMode {
        if self.shared_inbound.is_some() {
            EndpointMode::Broadcast
        } else {
            EndpointMode::Session
        }
    }

    /// Stream pair for a new session on this endpoint.
    pub(crate) fn open_streams(&self, session: Session) -> SessionStreams {
        match &self.shared_inbound {
            Some(inbound) => SessionStreams::with_inbound(session, inbound.clone()),
            None => SessionStreams::new(session),
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("template", &self.template)
            .field("flow", &self.flow)
            .field("mode", &self.mode())
            .finish_non_exhaustive()
    }
}

/// Path template → endpoint table.
#[derive(Debug, Clone, Default)]
pub struct EndpointRouter {
    router: Router<Arc<Endpoint>>,
    endpoints: Vec<Arc<Endpoint>>,
}

impl EndpointRouter {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add`](Self::add).
    pub fn route<H: MessageHandler>(
        mut self,
        template: &str,
        handler: H,
        flow: FlowControlConfig,
    ) -> WsResult<Self> {
        self.add(template, Arc::new(handler), flow)?;
        Ok(self)
    }

    /// Builder form of [`add_with_mode`](Self::add_with_mode) for a
    /// broadcast-mode endpoint.
    pub fn route_broadcast<H: MessageHandler>(
        mut self,
        template: &str,
        handler: H,
        flow: FlowControlConfig,
    ) -> WsResult<Self> {
        self.add_with_mode(template, Arc::new(handler), flow, EndpointMode::Broadcast)?;
        Ok(self)
    }

    /// Register a per-session endpoint.
    pub fn add(&mut self, template: &str, handler: SharedHandler, flow: FlowControlConfig) -> WsResult<()> {
        self.add_with_mode(template, handler, flow, EndpointMode::Session)
    }

    /// Register an endpoint.
    ///
    /// Fails if the configuration is invalid or the template is malformed
    /// or already taken.
    pub fn add_with_mode(
        &mut self,
        template: &str,
        handler: SharedHandler,
        flow: FlowControlConfig,
        mode: EndpointMode,
    ) -> WsResult<()> {
        flow.validate()
            .map_err(|e| WsError::invalid_config(format!("{template}: {e}")))?;
        let shared_inbound = match mode {
            EndpointMode::Session => None,
            EndpointMode::Broadcast => Some(broadcast::channel(STREAM_CAPACITY).0),
        };
        let endpoint = Arc::new(Endpoint {
            template: template.to_owned(),
            handler,
            flow,
            shared_inbound,
        });
        self.router
            .insert(template, Arc::clone(&endpoint))
            .map_err(|e| WsError::invalid_config(e.to_string()))?;
        self.endpoints.push(endpoint);
        Ok(())
    }

    /// The endpoint serving a concrete request path, with its path params.
    pub fn resolve(&self, path: &str) -> Option<(Arc<Endpoint>, Params)> {
        let matched = self.router.match_path(path)?;
        Some((Arc::clone(matched.value), matched.params))
    }

    /// The endpoint registered under exactly `template`.
    pub fn endpoint(&self, template: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.iter().find(|e| e.template() == template).cloned()
    }

    /// All endpoints in registration order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.iter()
    }

    /// Number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// True if no endpoint is registered.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackpressureConfig, HeartbeatConfig};
    use crate::error::HandlerError;
    use crate::session::SessionContext;
    use crate::streams::{Inbound, Outbound};

    async fn noop(_ctx: SessionContext, _inbound: Inbound, _outbound: Outbound) -> Result<(), HandlerError> {
        Ok(())
    }

    #[test]
    fn test_route_and_resolve() {
        let endpoints = EndpointRouter::new()
            .route("/chat/{room}", noop, FlowControlConfig::default())
            .unwrap()
            .route("/feed", noop, FlowControlConfig::default())
            .unwrap();

        let (endpoint, params) = endpoints.resolve("/chat/lobby").unwrap();
        assert_eq!(endpoint.template(), "/chat/{room}");
        assert_eq!(params.get("room"), Some("lobby"));
        assert!(endpoints.resolve("/missing").is_none());
        assert_eq!(endpoints.len(), 2);
        assert!(endpoints.endpoint("/feed").is_some());
    }

    #[test]
    fn test_invalid_flow_config_rejected() {
        let flow = FlowControlConfig::new().heartbeat(HeartbeatConfig::every(30, 10));
        let err = EndpointRouter::new().route("/chat", noop, flow).unwrap_err();
        assert!(err.to_string().contains("/chat"));

        let flow = FlowControlConfig::new().backpressure(BackpressureConfig::buffer(0));
        assert!(EndpointRouter::new().route("/chat", noop, flow).is_err());
    }

    #[test]
    fn test_unknown_strategy_is_accepted() {
        let flow = FlowControlConfig::new().backpressure(BackpressureConfig::strategy("SOMETIMES"));
        assert!(EndpointRouter::new().route("/chat", noop, flow).is_ok());
    }

    #[test]
    fn test_duplicate_template_rejected() {
        let endpoints = EndpointRouter::new()
            .route("/chat", noop, FlowControlConfig::default())
            .unwrap();
        assert!(endpoints.route("/chat", noop, FlowControlConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_broadcast_endpoint_shares_inbound() {
        let endpoints = EndpointRouter::new()
            .route_broadcast("/lobby", noop, FlowControlConfig::default())
            .unwrap()
            .route("/chat", noop, FlowControlConfig::default())
            .unwrap();

        let lobby = endpoints.endpoint("/lobby").unwrap();
        assert_eq!(lobby.mode(), EndpointMode::Broadcast);
        let a = lobby.open_streams(Session::new("/lobby").0);
        let b = lobby.open_streams(Session::new("/lobby").0);
        let mut a_in = a.subscribe_inbound();
        let mut b_in = b.subscribe_inbound();

        assert!(a.push_inbound(Message::text("from a")));
        assert_eq!(a_in.recv().await, Some(Message::text("from a")));
        assert_eq!(b_in.recv().await, Some(Message::text("from a")));

        assert_eq!(a.inbound_subscribers(), 2);

        // A closed session stops receiving; the others keep going.
        a.close();
        assert_eq!(a_in.recv().await, None);
        assert!(!a.push_inbound(Message::text("late")));
        assert!(b.push_inbound(Message::text("from b")));
        assert_eq!(b_in.recv().await, Some(Message::text("from b")));

        let chat = endpoints.endpoint("/chat").unwrap();
        assert_eq!(chat.mode(), EndpointMode::Session);
        let c = chat.open_streams(Session::new("/chat").0);
        let d = chat.open_streams(Session::new("/chat").0);
        let _d_in = d.subscribe_inbound();
        assert_eq!(d.inbound_subscribers(), 1);
        assert!(!c.push_inbound(Message::text("private")));
    }
}
