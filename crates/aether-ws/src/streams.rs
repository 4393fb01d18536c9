//! The per-session stream pair.
//!
//! Inbound carries frames from the client to the processing stage;
//! outbound carries handler output towards the send loop. Both are
//! multicast, replay-free broadcast channels so several internal
//! consumers can observe the same traffic. Closing the pair ends every
//! subscription, idempotently.

use std::fmt;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{WsError, WsResult};
use crate::message::{Message, Payload};
use crate::session::{Session, SessionId};

/// Buffered messages per direction before slow subscribers start lagging.
pub const STREAM_CAPACITY: usize = 256;

/// A signal on the outbound channel.
#[derive(Debug, Clone)]
pub enum OutboundSignal {
    /// An application payload.
    Next(Payload),
    /// Final payload; the send loop writes it and then finishes.
    ErrorResponse(Payload),
    /// The producer is done; the send loop drains and finishes.
    Complete,
}

struct StreamsInner {
    session: Session,
    inbound: broadcast::Sender<Message>,
    outbound: broadcast::Sender<OutboundSignal>,
    closed: CancellationToken,
}

/// Inbound and outbound channels owned by one session.
#[derive(Clone)]
pub struct SessionStreams {
    inner: Arc<StreamsInner>,
}

impl SessionStreams {
    /// Open a stream pair for `session`.
    pub fn new(session: Session) -> Self {
        Self::with_inbound(session, broadcast::channel(STREAM_CAPACITY).0)
    }

    /// Open a stream pair whose inbound side is `inbound`, possibly shared
    /// with other sessions. Closing this pair ends only its own
    /// subscriptions.
    pub fn with_inbound(session: Session, inbound: broadcast::Sender<Message>) -> Self {
        let (outbound, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            inner: Arc::new(StreamsInner {
                session,
                inbound,
                outbound,
                closed: CancellationToken::new(),
            }),
        }
    }

    /// The owning session.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Shorthand for `session().id()`.
    pub fn session_id(&self) -> SessionId {
        self.inner.session.id()
    }

    /// Subscribe to inbound frames. Only frames pushed after this call are
    /// observed.
    pub fn subscribe_inbound(&self) -> Inbound {
        Inbound {
            rx: self.inner.inbound.subscribe(),
            closed: self.inner.closed.clone(),
            session_id: self.session_id(),
        }
    }

    pub(crate) fn subscribe_outbound(&self) -> broadcast::Receiver<OutboundSignal> {
        self.inner.outbound.subscribe()
    }

    /// Emitter for the outbound side.
    pub fn outbound(&self) -> Outbound {
        Outbound {
            streams: self.clone(),
        }
    }

    /// Deliver a client frame to inbound subscribers. Returns false if
    /// nobody is listening or the pair is closed.
    pub(crate) fn push_inbound(&self, msg: Message) -> bool {
        !self.is_closed() && self.inner.inbound.send(msg).is_ok()
    }

    fn signal(&self, signal: OutboundSignal) -> WsResult<()> {
        if self.is_closed() {
            return Err(WsError::StreamsClosed);
        }
        self.inner
            .outbound
            .send(signal)
            .map(|_| ())
            .map_err(|_| WsError::StreamsClosed)
    }

    /// Queue an outbound payload.
    pub fn emit(&self, payload: impl Into<Payload>) -> WsResult<()> {
        self.signal(OutboundSignal::Next(payload.into()))
    }

    /// Queue a final error payload; the session closes once it is sent.
    pub fn emit_error(&self, payload: impl Into<Payload>) -> WsResult<()> {
        self.signal(OutboundSignal::ErrorResponse(payload.into()))
    }

    /// Signal that no more outbound payloads will follow.
    pub fn complete_outbound(&self) {
        let _ = self.signal(OutboundSignal::Complete);
    }

    /// Close both directions. Safe to call any number of times.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// True once [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves when the pair is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Number of inbound subscribers, across every session sharing the
    /// inbound side.
    pub fn inbound_subscribers(&self) -> usize {
        self.inner.inbound.receiver_count()
    }
}

impl fmt::Debug for SessionStreams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStreams")
            .field("session_id", &self.session_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A subscription to a session's inbound frames, in arrival order.
pub struct Inbound {
    rx: broadcast::Receiver<Message>,
    closed: CancellationToken,
    session_id: SessionId,
}

impl Inbound {
    /// Next frame, or `None` once the stream pair is closed and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            tokio::select! {
                biased;
                result = self.rx.recv() => match result {
                    Ok(msg) => return Some(msg),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(session_id = %self.session_id, skipped, "Inbound subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                },
                () = self.closed.cancelled() => return None,
            }
        }
    }

    /// Adapt into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Message> + Send + 'static {
        futures_util::stream::unfold(self, |mut inbound| async move {
            inbound.recv().await.map(|msg| (msg, inbound))
        })
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("session_id", &self.session_id)
            .finish_non_exhaustive()
    }
}

/// Producer handle for a session's outbound side.
#[derive(Clone, Debug)]
pub struct Outbound {
    streams: SessionStreams,
}

impl Outbound {
    /// Queue a payload.
    pub fn send(&self, payload: impl Into<Payload>) -> WsResult<()> {
        self.streams.emit(payload)
    }

    /// Queue a value as JSON.
    pub fn send_json<T: serde::Serialize>(&self, value: &T) -> WsResult<()> {
        self.streams.emit(Payload::json(value)?)
    }

    /// Queue a final error payload.
    pub fn send_error(&self, payload: impl Into<Payload>) -> WsResult<()> {
        self.streams.emit_error(payload)
    }

    /// True once the session's streams are closed.
    pub fn is_closed(&self) -> bool {
        self.streams.is_closed()
    }

    /// The session id.
    pub fn session_id(&self) -> SessionId {
        self.streams.session_id()
    }
}
