//! The processing stage contract.
//!
//! An endpoint supplies one [`MessageHandler`]. It receives the session
//! context, a subscription to inbound frames and an emitter for outbound
//! payloads, and runs for as long as it wants to keep the session alive.
//!
//! Returning `Ok(())` completes the outbound side: everything already
//! emitted is flushed and the session closes normally. Returning
//! [`HandlerError::Respond`] sends one final payload before closing.
//! Any other error closes the session with 1011.
//!
//! # Example
//!
//! ```ignore
//! use aether_ws::{handler_fn, HandlerError, Inbound, Outbound, SessionContext};
//!
//! async fn echo(ctx: SessionContext, mut inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
//!     while let Some(msg) = inbound.recv().await {
//!         if let Some(text) = msg.as_text() {
//!             outbound.send(format!("{}: {text}", ctx.session_id()))?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::HandlerError;
use crate::session::SessionContext;
use crate::streams::{Inbound, Outbound};

/// Future returned by a handler.
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// The user processing stage for an endpoint.
pub trait MessageHandler: Send + Sync + 'static {
    /// Run the processing stage for one session.
    fn handle(&self, ctx: SessionContext, inbound: Inbound, outbound: Outbound) -> HandlerFuture;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(SessionContext, Inbound, Outbound) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, ctx: SessionContext, inbound: Inbound, outbound: Outbound) -> HandlerFuture {
        Box::pin(self(ctx, inbound, outbound))
    }
}

/// Shared, type-erased handler.
pub type SharedHandler = Arc<dyn MessageHandler>;

/// Erase a handler's type.
pub fn handler_fn<H: MessageHandler>(handler: H) -> SharedHandler {
    Arc::new(handler)
}
