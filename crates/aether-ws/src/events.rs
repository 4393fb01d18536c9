//! Session lifecycle notifications.
//!
//! The bus publishes [`SessionEvent::Connected`] once a session is
//! registered and [`SessionEvent::Closed`] exactly once when it is torn
//! down, whichever side ended it.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::trace;

use crate::session::{CloseInitiator, CloseStatus, SessionId};

/// Default number of undelivered events kept per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Summary of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCloseInfo {
    /// The session.
    pub session_id: SessionId,
    /// Endpoint path template.
    pub path: String,
    /// Close code and reason.
    pub status: CloseStatus,
    /// Which side ended the session.
    pub initiator: CloseInitiator,
    /// Time between handshake and teardown.
    pub lifetime: Duration,
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A session became active.
    Connected {
        /// The session.
        session_id: SessionId,
        /// Endpoint path template.
        path: String,
    },
    /// A session was torn down.
    Closed(SessionCloseInfo),
}

impl SessionEvent {
    /// The session this event is about.
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Connected { session_id, .. } => *session_id,
            Self::Closed(info) => info.session_id,
        }
    }
}

/// Broadcast bus for [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct SessionEventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEventBus {
    /// Bus keeping `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: SessionEvent) -> usize {
        trace!(session_id = %event.session_id(), "Publishing session event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SessionEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = SessionEventBus::default();
        let event = SessionEvent::Connected {
            session_id: SessionId::new(),
            path: "/chat".into(),
        };
        assert_eq!(bus.publish(event), 0);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = SessionEventBus::new(4);
        let mut rx = bus.subscribe();
        let id = SessionId::new();
        let info = SessionCloseInfo {
            session_id: id,
            path: "/chat".into(),
            status: CloseStatus::normal(),
            initiator: CloseInitiator::Client,
            lifetime: Duration::from_secs(1),
        };
        assert_eq!(bus.publish(SessionEvent::Closed(info.clone())), 1);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), id);
        assert_eq!(event, SessionEvent::Closed(info));
        assert_eq!(bus.subscriber_count(), 1);
    }
}
