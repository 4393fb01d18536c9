//! In-memory transport.
//!
//! Two bounded channels stand in for a socket. The capacity of the
//! server → client channel is the amount of "network buffer" a slow
//! client offers before the session's send loop has to wait.

use aether_ws::{HandshakeInfo, Message, Transport, WsError, WsResult};
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;

use crate::client::TestClient;

/// Frames buffered per direction unless stated otherwise.
pub const DEFAULT_CAPACITY: usize = 16;

/// A connected transport / client pair with [`DEFAULT_CAPACITY`].
pub fn memory_transport(handshake: HandshakeInfo) -> (Transport, TestClient) {
    memory_transport_with_capacity(handshake, DEFAULT_CAPACITY)
}

/// A connected transport / client pair buffering `capacity` frames per
/// direction.
pub fn memory_transport_with_capacity(handshake: HandshakeInfo, capacity: usize) -> (Transport, TestClient) {
    let capacity = capacity.max(1);
    let (to_client, from_server) = mpsc::channel::<Message>(capacity);
    let (to_server, from_client) = mpsc::channel::<WsResult<Message>>(capacity);

    let sink = PollSender::new(to_client).sink_map_err(|e| WsError::send_failed(e.to_string()));
    let stream = futures_util::stream::unfold(from_client, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });

    (
        Transport::new(sink, stream, handshake),
        TestClient::new(to_server, from_server),
    )
}
