//! Test client.
//!
//! [`TestClient`] is the peer end of a memory transport. It plays the part
//! of a browser: frames it sends surface in the session's receive loop,
//! frames the session writes land in its queue. Pings are answered
//! automatically unless disabled, mirroring what real WebSocket clients do.

use std::time::Duration;

use aether_ws::{
    CloseCode, CloseFrame, HandshakeInfo, Message, SessionCloseInfo, WebSocketService, WsError,
    WsResult,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::TestError;
use crate::transport::{memory_transport_with_capacity, DEFAULT_CAPACITY};

/// Result of a spawned server-side session.
pub type SessionHandle = JoinHandle<WsResult<SessionCloseInfo>>;

/// The client end of an in-memory WebSocket connection.
///
/// # Example
///
/// ```ignore
/// use aether_test::TestClient;
///
/// let (mut client, session) = TestClient::connect(&service, "/echo/lobby");
/// client.send_text("hello").await?;
/// assert_eq!(client.recv_text().await?, "lobby:hello");
/// client.close(CloseCode::Normal, "bye").await?;
/// ```
#[derive(Debug)]
pub struct TestClient {
    tx: mpsc::Sender<WsResult<Message>>,
    rx: mpsc::Receiver<Message>,
    auto_pong: bool,
    pings: Vec<Instant>,
}

impl TestClient {
    pub(crate) fn new(tx: mpsc::Sender<WsResult<Message>>, rx: mpsc::Receiver<Message>) -> Self {
        Self {
            tx,
            rx,
            auto_pong: true,
            pings: Vec::new(),
        }
    }

    /// Open a session on `service` for `uri`.
    pub fn connect(service: &WebSocketService, uri: &str) -> (Self, SessionHandle) {
        Self::connect_with(service, HandshakeInfo::for_path(uri), DEFAULT_CAPACITY)
    }

    /// Open a session with explicit handshake metadata and buffer capacity.
    pub fn connect_with(
        service: &WebSocketService,
        handshake: HandshakeInfo,
        capacity: usize,
    ) -> (Self, SessionHandle) {
        let (transport, client) = memory_transport_with_capacity(handshake, capacity);
        (client, service.spawn_connection(transport))
    }

    /// Stop answering pings, as an unresponsive peer would.
    pub fn without_auto_pong(mut self) -> Self {
        self.auto_pong = false;
        self
    }

    /// When each ping so far was observed.
    pub fn ping_times(&self) -> &[Instant] {
        &self.pings
    }

    /// Send a raw frame.
    pub async fn send(&self, msg: Message) -> Result<(), TestError> {
        self.tx.send(Ok(msg)).await.map_err(|_| TestError::Disconnected)
    }

    /// Send a text frame.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), TestError> {
        self.send(Message::text(text)).await
    }

    /// Send a binary frame.
    pub async fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), TestError> {
        self.send(Message::binary(data)).await
    }

    /// Make the session's next read fail with a transport error.
    pub async fn inject_error(&self, reason: &str) -> Result<(), TestError> {
        self.tx
            .send(Err(WsError::receive_failed(reason)))
            .await
            .map_err(|_| TestError::Disconnected)
    }

    /// Send a close frame.
    pub async fn close(&self, code: CloseCode, reason: &str) -> Result<(), TestError> {
        self.send(Message::close(code, reason)).await
    }

    /// Drop the connection without a close handshake.
    pub fn disconnect(self) {}

    /// Next frame from the server, pings included. `None` once the server
    /// side has closed the transport.
    pub async fn recv(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await?;
        if let Message::Ping(data) = &msg {
            self.pings.push(Instant::now());
            if self.auto_pong {
                // The server may already be gone; nothing to answer then.
                let _ = self.tx.send(Ok(Message::Pong(data.clone()))).await;
            }
        }
        Some(msg)
    }

    /// Next frame, or [`TestError::Timeout`].
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Message>, TestError> {
        tokio::time::timeout(timeout, self.recv())
            .await
            .map_err(|_| TestError::Timeout(timeout))
    }

    /// Next data frame, skipping pings and pongs.
    pub async fn recv_data(&mut self) -> Result<Message, TestError> {
        loop {
            match self.recv().await {
                Some(Message::Ping(_) | Message::Pong(_)) => {}
                Some(Message::Close(frame)) => {
                    return Err(TestError::UnexpectedFrame(format!("close {frame:?}")))
                }
                Some(msg) => return Ok(msg),
                None => return Err(TestError::Disconnected),
            }
        }
    }

    /// Next data frame within `timeout`.
    pub async fn recv_data_timeout(&mut self, timeout: Duration) -> Result<Message, TestError> {
        tokio::time::timeout(timeout, self.recv_data())
            .await
            .map_err(|_| TestError::Timeout(timeout))?
    }

    /// Next data frame as text.
    pub async fn recv_text(&mut self) -> Result<String, TestError> {
        match self.recv_data().await? {
            Message::Text(text) => Ok(text),
            other => Err(TestError::UnexpectedFrame(other.kind().to_string())),
        }
    }

    /// Every text frame that arrives before the line goes quiet for `idle`.
    pub async fn drain_text(&mut self, idle: Duration) -> Vec<String> {
        let mut texts = Vec::new();
        while let Ok(msg) = self.recv_data_timeout(idle).await {
            if let Message::Text(text) = msg {
                texts.push(text);
            }
        }
        texts
    }

    /// Read until the server closes. Returns the close frame, if one was
    /// sent, skipping any data still in flight.
    pub async fn expect_closed(&mut self, timeout: Duration) -> Result<Option<CloseFrame>, TestError> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.recv()).await {
                Err(_) => return Err(TestError::Timeout(timeout)),
                Ok(None) => return Ok(None),
                Ok(Some(Message::Close(frame))) => return Ok(frame),
                Ok(Some(_)) => {}
            }
        }
    }
}
