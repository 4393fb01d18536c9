//! Test error types.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the test client.
#[derive(Debug, Error)]
pub enum TestError {
    /// The server side of the transport is gone.
    #[error("transport disconnected")]
    Disconnected,

    /// Nothing arrived in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// A frame of an unexpected kind arrived.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
}
