//! The frame-level boundary between a session and its connection.
//!
//! A [`Transport`] is a sink of outgoing frames, a stream of incoming
//! frames and the handshake metadata. Real sockets come in through
//! [`Transport::from_websocket`]; tests can plug in any channel pair.

use std::fmt;
use std::pin::Pin;

use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::WebSocketStream;

use crate::error::{WsError, WsResult};
use crate::message::Message;
use crate::session::HandshakeInfo;

/// Boxed outgoing frame sink.
pub type BoxFrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;

/// Boxed incoming frame stream.
pub type BoxFrameStream = Pin<Box<dyn Stream<Item = WsResult<Message>> + Send>>;

/// One accepted connection, ready to run as a session.
pub struct Transport {
    sink: BoxFrameSink,
    stream: BoxFrameStream,
    handshake: HandshakeInfo,
}

impl Transport {
    /// Build a transport from any frame sink and stream.
    pub fn new<Si, St>(sink: Si, stream: St, handshake: HandshakeInfo) -> Self
    where
        Si: Sink<Message, Error = WsError> + Send + 'static,
        St: Stream<Item = WsResult<Message>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            handshake,
        }
    }

    /// Wrap an upgraded `tokio-tungstenite` connection.
    pub fn from_websocket<S>(ws: WebSocketStream<S>, handshake: HandshakeInfo) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(WsError::from)
            .with(|msg: Message| future::ready(Ok::<_, WsError>(tungstenite::Message::from(msg))));
        let stream = stream.map(|frame| frame.map(Message::from).map_err(WsError::from));
        Self::new(sink, stream, handshake)
    }

    /// Handshake metadata.
    pub fn handshake(&self) -> &HandshakeInfo {
        &self.handshake
    }

    /// Replace the handshake metadata.
    pub fn with_handshake(mut self, handshake: HandshakeInfo) -> Self {
        self.handshake = handshake;
        self
    }

    /// Split into sink, stream and handshake metadata.
    pub fn into_parts(self) -> (BoxFrameSink, BoxFrameStream, HandshakeInfo) {
        (self.sink, self.stream, self.handshake)
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("handshake", &self.handshake)
            .finish_non_exhaustive()
    }
}
