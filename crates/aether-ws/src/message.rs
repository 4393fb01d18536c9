//! Frames and outbound payloads.
//!
//! [`Message`] is a single WebSocket frame. [`Payload`] is anything a
//! processing stage can hand to the outbound side; the send loop converts
//! it into one or more frames:
//!
//! | Payload | Frames |
//! |---------|--------|
//! | `Message` | sent as-is |
//! | `Text` | one text frame |
//! | `Binary` | one binary frame |
//! | `Reader` | binary frames of up to 4096 bytes until EOF |
//! | `Json` | one text frame with the serialized value |

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Mutex;

use crate::error::{CloseCode, WsError, WsResult};

/// Chunk size used when streaming a [`Payload::Reader`].
pub const READER_CHUNK_SIZE: usize = 4096;

/// A WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message (UTF-8 encoded).
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
    /// A ping frame with optional payload.
    Ping(Vec<u8>),
    /// A pong frame with optional payload.
    Pong(Vec<u8>),
    /// A close frame with optional code and reason.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a new text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create a new binary message.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::Binary(data.into())
    }

    /// Create a new ping message.
    pub fn ping(data: impl Into<Vec<u8>>) -> Self {
        Self::Ping(data.into())
    }

    /// Create a close message with a code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame::new(code, reason)))
    }

    /// Check if this is a text message.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Check if this is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Check if this is a ping message.
    pub fn is_ping(&self) -> bool {
        matches!(self, Self::Ping(_))
    }

    /// Check if this is a close message.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Check if this is a data message (text or binary).
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Binary(_))
    }

    /// Get the message payload as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the message payload as bytes. `None` for close frames.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(s) => Some(s.as_bytes()),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => Some(b),
            Self::Close(_) => None,
        }
    }

    /// Get the close frame if this is a close message.
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        match self {
            Self::Close(frame) => frame.as_ref(),
            _ => None,
        }
    }

    /// Parse a text frame as JSON.
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> WsResult<T> {
        let text = self
            .as_text()
            .ok_or_else(|| WsError::DecodeFailed("not a text message".to_string()))?;
        serde_json::from_str(text).map_err(|e| WsError::DecodeFailed(e.to_string()))
    }

    /// Short name of the frame type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Binary(_) => "binary",
            Self::Ping(_) => "ping",
            Self::Pong(_) => "pong",
            Self::Close(_) => "close",
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b)
    }
}

impl From<tungstenite::Message> for Message {
    fn from(msg: tungstenite::Message) -> Self {
        match msg {
            tungstenite::Message::Text(s) => Self::Text(s.to_string()),
            tungstenite::Message::Binary(b) => Self::Binary(b.to_vec()),
            tungstenite::Message::Ping(b) => Self::Ping(b.to_vec()),
            tungstenite::Message::Pong(b) => Self::Pong(b.to_vec()),
            tungstenite::Message::Close(frame) => Self::Close(frame.map(CloseFrame::from)),
            tungstenite::Message::Frame(frame) => Self::Binary(frame.into_payload().to_vec()),
        }
    }
}

impl From<Message> for tungstenite::Message {
    fn from(msg: Message) -> Self {
        match msg {
            Message::Text(s) => Self::Text(s.into()),
            Message::Binary(b) => Self::Binary(Bytes::from(b)),
            Message::Ping(b) => Self::Ping(Bytes::from(b)),
            Message::Pong(b) => Self::Pong(Bytes::from(b)),
            Message::Close(frame) => Self::Close(frame.map(tungstenite::protocol::CloseFrame::from)),
        }
    }
}

/// A WebSocket close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The close code.
    pub code: u16,
    /// The close reason.
    pub reason: Cow<'static, str>,
}

impl CloseFrame {
    /// Create a new close frame.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: Cow::Owned(reason.into()),
        }
    }

    /// Get the close code enum value if it's a standard code.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_u16(self.code)
    }
}

impl From<tungstenite::protocol::CloseFrame> for CloseFrame {
    fn from(frame: tungstenite::protocol::CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: Cow::Owned(frame.reason.as_str().to_owned()),
        }
    }
}

impl From<CloseFrame> for tungstenite::protocol::CloseFrame {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: frame.code.into(),
            reason: frame.reason.into_owned().into(),
        }
    }
}

/// Boxed async byte source streamed as binary frames.
pub type PayloadReader = Box<dyn AsyncRead + Send + Unpin>;

/// A reader shared between clones of a [`Payload`]; the first consumer
/// takes it, later clones encode to nothing.
#[derive(Clone)]
pub struct SharedReader(Arc<Mutex<Option<PayloadReader>>>);

impl SharedReader {
    /// Wrap a reader.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(reader)))))
    }

    async fn take(&self) -> Option<PayloadReader> {
        self.0.lock().await.take()
    }
}

impl fmt::Debug for SharedReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedReader(..)")
    }
}

/// A value produced for the outbound side of a session.
#[derive(Debug, Clone)]
pub enum Payload {
    /// An already-framed message.
    Message(Message),
    /// Text, sent as one text frame.
    Text(String),
    /// Bytes, sent as one binary frame.
    Binary(Vec<u8>),
    /// A byte stream, sent as consecutive binary frames.
    Reader(SharedReader),
    /// A structured value, serialized to a JSON text frame.
    Json(serde_json::Value),
}

impl Payload {
    /// Serialize any value as a JSON payload.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> WsResult<Self> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| WsError::EncodeFailed(e.to_string()))
    }

    /// Stream `reader` as binary frames.
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(SharedReader::new(reader))
    }

    /// Convert into frames.
    pub async fn into_frames(self) -> WsResult<Vec<Message>> {
        match self {
            Self::Message(msg) => Ok(vec![msg]),
            Self::Text(text) => Ok(vec![Message::Text(text)]),
            Self::Binary(bytes) => Ok(vec![Message::Binary(bytes)]),
            Self::Json(value) => serde_json::to_string(&value)
                .map(|text| vec![Message::Text(text)])
                .map_err(|e| WsError::EncodeFailed(e.to_string())),
            Self::Reader(shared) => {
                let Some(mut reader) = shared.take().await else {
                    return Ok(Vec::new());
                };
                let mut frames = Vec::new();
                loop {
                    let chunk = read_chunk(&mut reader).await?;
                    if chunk.is_empty() {
                        break;
                    }
                    frames.push(Message::Binary(chunk));
                }
                Ok(frames)
            }
        }
    }
}

/// Reads until the chunk is full or the reader is exhausted.
async fn read_chunk(reader: &mut PayloadReader) -> WsResult<Vec<u8>> {
    let mut buf = vec![0u8; READER_CHUNK_SIZE];
    let mut filled = 0;
    while filled < READER_CHUNK_SIZE {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}

impl From<Message> for Payload {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b)
    }
}

impl From<Bytes> for Payload {
    fn from(b: Bytes) -> Self {
        Self::Binary(b.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}
