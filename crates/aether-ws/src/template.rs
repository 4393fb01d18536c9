//! Server-side messaging helpers.
//!
//! The template pushes payloads into live sessions from outside their
//! handlers. Payloads go through each session's outbound pipeline, so
//! backpressure and ordering apply exactly as for handler output.
//!
//! A [`Payload::Reader`] can be read only once; when broadcast, the first
//! session to send it consumes the reader.

use std::sync::Arc;

use tracing::debug;

use crate::error::{WsError, WsResult};
use crate::message::Payload;
use crate::registry::SessionRegistry;
use crate::session::{CloseStatus, SessionId};

/// Send to or close sessions by path and id.
#[derive(Debug, Clone)]
pub struct WebSocketTemplate {
    registry: Arc<SessionRegistry>,
}

impl WebSocketTemplate {
    /// Template over `registry`.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `payload` to every session on `path`. Returns how many
    /// sessions accepted it.
    pub fn send_broadcast(&self, path: &str, payload: impl Into<Payload>) -> usize {
        let payload = payload.into();
        let delivered = self
            .registry
            .sessions(path)
            .iter()
            .filter(|streams| streams.emit(payload.clone()).is_ok())
            .count();
        debug!(path, delivered, "Broadcast sent");
        delivered
    }

    /// Send `payload` to one session.
    pub fn send_to_session(&self, path: &str, id: SessionId, payload: impl Into<Payload>) -> WsResult<()> {
        self.registry
            .get(path, id)
            .ok_or_else(|| WsError::session_not_found(path, id))?
            .emit(payload)
    }

    /// Send `payload` to each listed session, skipping ones that are gone.
    /// Returns how many sessions accepted it.
    pub fn send_to_sessions(&self, path: &str, ids: &[SessionId], payload: impl Into<Payload>) -> usize {
        let payload = payload.into();
        ids.iter()
            .filter_map(|id| self.registry.get(path, *id))
            .filter(|streams| streams.emit(payload.clone()).is_ok())
            .count()
    }

    /// Send a final error payload to one session, which then closes.
    pub fn send_error(&self, path: &str, id: SessionId, payload: impl Into<Payload>) -> WsResult<()> {
        self.registry
            .get(path, id)
            .ok_or_else(|| WsError::session_not_found(path, id))?
            .emit_error(payload)
    }

    /// Send a final error payload to every session on `path`.
    pub fn broadcast_error(&self, path: &str, payload: impl Into<Payload>) -> usize {
        let payload = payload.into();
        self.registry
            .sessions(path)
            .iter()
            .filter(|streams| streams.emit_error(payload.clone()).is_ok())
            .count()
    }

    /// Ask one session to close with `status`. Returns false if the
    /// session was already closing.
    pub fn close_session(&self, path: &str, id: SessionId, status: CloseStatus) -> WsResult<bool> {
        let streams = self
            .registry
            .get(path, id)
            .ok_or_else(|| WsError::session_not_found(path, id))?;
        Ok(streams.session().close(status))
    }

    /// Number of sessions on `path`.
    pub fn session_count(&self, path: &str) -> usize {
        self.registry.sessions(path).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionState};
    use crate::streams::{OutboundSignal, SessionStreams};
    use tokio::sync::{broadcast, oneshot};

    fn registered(
        registry: &SessionRegistry,
        path: &str,
    ) -> (SessionStreams, broadcast::Receiver<OutboundSignal>, oneshot::Receiver<CloseStatus>) {
        let (session, close_rx) = Session::new(path);
        session.transition(SessionState::Connecting, SessionState::Active);
        let streams = SessionStreams::new(session);
        let rx = streams.subscribe_outbound();
        registry.register(streams.clone());
        (streams, rx, close_rx)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_only_path() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a, _ca) = registered(&registry, "/chat");
        let (_b, mut rx_b, _cb) = registered(&registry, "/chat");
        let (_c, mut rx_c, _cc) = registered(&registry, "/feed");
        let template = WebSocketTemplate::new(Arc::clone(&registry));

        assert_eq!(template.send_broadcast("/chat", "hello"), 2);
        assert!(matches!(rx_a.recv().await.unwrap(), OutboundSignal::Next(_)));
        assert!(matches!(rx_b.recv().await.unwrap(), OutboundSignal::Next(_)));
        assert!(rx_c.try_recv().is_err());
        assert_eq!(template.session_count("/chat"), 2);
    }

    #[tokio::test]
    async fn test_send_to_missing_session() {
        let registry = SessionRegistry::new();
        let template = WebSocketTemplate::new(registry);
        let err = template.send_to_session("/chat", SessionId::new(), "x").unwrap_err();
        assert!(matches!(err, WsError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_send_to_sessions_skips_missing() {
        let registry = SessionRegistry::new();
        let (a, mut rx, _ca) = registered(&registry, "/chat");
        let template = WebSocketTemplate::new(Arc::clone(&registry));

        let sent = template.send_to_sessions("/chat", &[a.session_id(), SessionId::new()], "x");
        assert_eq!(sent, 1);
        assert!(matches!(rx.recv().await.unwrap(), OutboundSignal::Next(_)));
    }

    #[tokio::test]
    async fn test_send_error_signals_final_payload() {
        let registry = SessionRegistry::new();
        let (a, mut rx, _ca) = registered(&registry, "/chat");
        let template = WebSocketTemplate::new(Arc::clone(&registry));

        template.send_error("/chat", a.session_id(), "bad request").unwrap();
        assert!(matches!(rx.recv().await.unwrap(), OutboundSignal::ErrorResponse(_)));
        assert_eq!(template.broadcast_error("/chat", "again"), 1);
    }

    #[tokio::test]
    async fn test_close_session_delivers_once() {
        let registry = SessionRegistry::new();
        let (a, _rx, close_rx) = registered(&registry, "/chat");
        let template = WebSocketTemplate::new(Arc::clone(&registry));

        assert!(template
            .close_session("/chat", a.session_id(), CloseStatus::going_away("bye"))
            .unwrap());
        assert!(!template
            .close_session("/chat", a.session_id(), CloseStatus::normal())
            .unwrap());
        assert_eq!(close_rx.await.unwrap().code, 1001);
    }
}
