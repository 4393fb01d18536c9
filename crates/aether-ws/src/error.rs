//! Error types for the session runtime.
//!
//! [`WsError`] covers transport, configuration and flow-control faults.
//! [`HandlerError`] is what a processing stage returns; its `Respond`
//! variant is the error-response convention that turns into one final
//! outbound frame.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::message::Payload;

/// Result type for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors that can occur in the session runtime.
#[derive(Debug, Error)]
pub enum WsError {
    /// The HTTP request was not a valid WebSocket upgrade request.
    #[error("not a WebSocket upgrade request: {reason}")]
    NotWebSocketRequest {
        /// Reason why the request is not a valid upgrade.
        reason: String,
    },

    /// The WebSocket handshake failed.
    #[error("WebSocket handshake failed: {0}")]
    HandshakeFailed(String),

    /// The WebSocket connection was closed.
    #[error("connection closed: {reason}")]
    ConnectionClosed {
        /// Optional close code from the peer.
        code: Option<u16>,
        /// Reason for closing.
        reason: String,
    },

    /// Failed to send a frame.
    #[error("failed to send message: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("failed to receive message: {0}")]
    ReceiveFailed(String),

    /// An outbound value could not be encoded into a frame.
    #[error("failed to encode message: {0}")]
    EncodeFailed(String),

    /// An inbound frame could not be decoded.
    #[error("failed to decode message: {0}")]
    DecodeFailed(String),

    /// The consumer could not keep up under the ERROR backpressure strategy.
    #[error("backpressure overflow: consumer fell behind (capacity {capacity})")]
    BackpressureOverflow {
        /// Pending-message capacity that was exceeded.
        capacity: usize,
    },

    /// No frame was received from the peer within the heartbeat timeout.
    #[error("heartbeat timeout: no frame received for {timeout:?}")]
    HeartbeatTimeout {
        /// Configured timeout.
        timeout: Duration,
    },

    /// Rate limiting is enabled for a path that never registered a quota.
    #[error("rate limiter not registered for path '{path}'")]
    RateLimiterNotRegistered {
        /// Endpoint path template.
        path: String,
    },

    /// No live session with this id on this path.
    #[error("session '{session_id}' not found on path '{path}'")]
    SessionNotFound {
        /// Endpoint path template.
        path: String,
        /// Session id.
        session_id: String,
    },

    /// No endpoint matches the connection path.
    #[error("no endpoint registered for '{path}'")]
    NoRoute {
        /// Requested path.
        path: String,
    },

    /// Endpoint or runtime configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session's stream pair is closed.
    #[error("session streams are closed")]
    StreamsClosed,

    /// The processing stage failed.
    #[error("handler failed: {0}")]
    HandlerFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Tungstenite error.
    #[error("tungstenite error: {0}")]
    Tungstenite(#[from] tungstenite::Error),
}

impl WsError {
    /// Create a new "not a WebSocket request" error.
    pub fn not_websocket(reason: impl Into<String>) -> Self {
        Self::NotWebSocketRequest {
            reason: reason.into(),
        }
    }

    /// Create a new handshake failed error.
    pub fn handshake_failed(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed(reason.into())
    }

    /// Create a new connection closed error.
    pub fn connection_closed(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            code,
            reason: reason.into(),
        }
    }

    /// Create a new send failed error.
    pub fn send_failed(reason: impl Into<String>) -> Self {
        Self::SendFailed(reason.into())
    }

    /// Create a new receive failed error.
    pub fn receive_failed(reason: impl Into<String>) -> Self {
        Self::ReceiveFailed(reason.into())
    }

    /// Create a new invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig(reason.into())
    }

    /// Create a new session not found error.
    pub fn session_not_found(path: impl Into<String>, session_id: impl fmt::Display) -> Self {
        Self::SessionNotFound {
            path: path.into(),
            session_id: session_id.to_string(),
        }
    }

    /// Create a new "rate limiter not registered" error.
    pub fn rate_limiter_not_registered(path: impl Into<String>) -> Self {
        Self::RateLimiterNotRegistered { path: path.into() }
    }

    /// Get the close code if this is a connection closed error.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::ConnectionClosed { code, .. } => *code,
            _ => None,
        }
    }

    /// The close code a session terminated by this error should carry.
    pub fn session_close_code(&self) -> CloseCode {
        match self {
            Self::BackpressureOverflow { .. } | Self::NoRoute { .. } => CloseCode::PolicyViolation,
            Self::HeartbeatTimeout { .. } => CloseCode::GoingAway,
            Self::ConnectionClosed { .. }
            | Self::SendFailed(_)
            | Self::ReceiveFailed(_)
            | Self::Io(_)
            | Self::Tungstenite(_) => CloseCode::Abnormal,
            _ => CloseCode::InternalError,
        }
    }

    /// True for faults of the underlying socket, after which no close
    /// frame can be delivered.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed { .. }
                | Self::SendFailed(_)
                | Self::ReceiveFailed(_)
                | Self::Io(_)
                | Self::Tungstenite(_)
        )
    }
}

/// Outcome of a processing stage that did not complete normally.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Send this payload as the final outbound frame, then close.
    #[error("error response")]
    Respond(Payload),

    /// Any other failure. Logged; the session is torn down with no payload.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl HandlerError {
    /// Error response carrying `payload`.
    pub fn respond(payload: impl Into<Payload>) -> Self {
        Self::Respond(payload.into())
    }

    /// Error response carrying `value` serialized as JSON.
    pub fn respond_json<T: serde::Serialize>(value: &T) -> Self {
        match Payload::json(value) {
            Ok(payload) => Self::Respond(payload),
            Err(e) => Self::Failed(e.into()),
        }
    }
}

impl From<WsError> for HandlerError {
    fn from(e: WsError) -> Self {
        Self::Failed(e.into())
    }
}

/// Close code for WebSocket connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data (1003).
    Unsupported = 1003,
    /// No status received (1005).
    NoStatus = 1005,
    /// Abnormal closure (1006).
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Extension required (1010).
    ExtensionRequired = 1010,
    /// Internal error (1011).
    InternalError = 1011,
    /// Service restart (1012).
    ServiceRestart = 1012,
    /// Try again later (1013).
    TryAgainLater = 1013,
    /// Bad gateway (1014).
    BadGateway = 1014,
    /// TLS handshake failure (1015).
    TlsHandshake = 1015,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1010 => Some(Self::ExtensionRequired),
            1011 => Some(Self::InternalError),
            1012 => Some(Self::ServiceRestart),
            1013 => Some(Self::TryAgainLater),
            1014 => Some(Self::BadGateway),
            1015 => Some(Self::TlsHandshake),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Codes that must never appear in a close frame on the wire.
    pub fn is_reserved(self) -> bool {
        matches!(self, Self::NoStatus | Self::Abnormal | Self::TlsHandshake)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::GoingAway => "GoingAway",
            Self::Protocol => "Protocol",
            Self::Unsupported => "Unsupported",
            Self::NoStatus => "NoStatus",
            Self::Abnormal => "Abnormal",
            Self::InvalidPayload => "InvalidPayload",
            Self::PolicyViolation => "PolicyViolation",
            Self::MessageTooBig => "MessageTooBig",
            Self::ExtensionRequired => "ExtensionRequired",
            Self::InternalError => "InternalError",
            Self::ServiceRestart => "ServiceRestart",
            Self::TryAgainLater => "TryAgainLater",
            Self::BadGateway => "BadGateway",
            Self::TlsHandshake => "TlsHandshake",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}
