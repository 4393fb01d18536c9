//! Per-connection lifecycle.
//!
//! ```text
//!  Connecting ──► Active ──► Closing ──► Closed
//!                   │
//!                   ├─ receive loop      (client frames, rate limiting)
//!                   ├─ send loop         (demand-driven backpressure, heartbeat)
//!                   ├─ processing stage  (user handler task)
//!                   ├─ close listener    (Session::close requests)
//!                   └─ service shutdown
//! ```
//!
//! The five branches race; the first terminal signal wins and the rest are
//! dropped. Teardown then runs exactly once: abort the handler, unregister,
//! close the stream pair, release the session's limiter, write the Close
//! frame if the transport is still usable, publish the close event.

use std::sync::Arc;

use futures_util::SinkExt;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use aether_router::Params;
use aether_telemetry::metrics as telemetry;

use crate::config::{FlowControlConfig, RateLimitScope, TransportConfig};
use crate::endpoint::Endpoint;
use crate::error::{CloseCode, HandlerError, WsError, WsResult};
use crate::events::{SessionCloseInfo, SessionEvent, SessionEventBus};
use crate::flow::{
    receive_loop, send_loop, BackpressureQueue, Heartbeat, Liveness, QueuePolicy, ReceiveEnd,
    SendEnd,
};
use crate::message::{CloseFrame, Message};
use crate::rate_limit::{resolve_identifier, RateLimiter, RateLimiterService};
use crate::registry::SessionRegistry;
use crate::session::{CloseInitiator, CloseStatus, Session, SessionContext, SessionState};
use crate::streams::{OutboundSignal, SessionStreams};
use crate::transport::{BoxFrameSink, BoxFrameStream, Transport};

/// Longest close reason RFC 6455 allows in a Close frame.
const MAX_CLOSE_REASON: usize = 123;

/// Services shared by every session of one [`WebSocketService`](crate::WebSocketService).
#[derive(Debug, Clone)]
pub(crate) struct Runtime {
    pub(crate) registry: Arc<SessionRegistry>,
    pub(crate) limiters: Arc<RateLimiterService>,
    pub(crate) events: SessionEventBus,
    pub(crate) shutdown: CancellationToken,
    pub(crate) transport: TransportConfig,
}

/// Why a session's active phase ended.
#[derive(Debug)]
enum SessionEnd {
    ClientClosed(CloseStatus),
    Disconnected,
    ReceiveFailed(WsError),
    ServerClosed(CloseStatus),
    Completed,
    Responded,
    Failed(WsError),
}

impl SessionEnd {
    /// Initiator, status, and whether a Close frame should be written.
    fn resolve(self) -> (CloseInitiator, CloseStatus, bool) {
        match self {
            Self::ClientClosed(status) => (CloseInitiator::Client, status, false),
            Self::Disconnected | Self::ReceiveFailed(_) => (
                CloseInitiator::Client,
                CloseStatus::new(CloseCode::Abnormal, ""),
                false,
            ),
            Self::ServerClosed(status) => {
                let sendable = status.is_sendable();
                (CloseInitiator::Server, status, sendable)
            }
            Self::Completed | Self::Responded => (CloseInitiator::Server, CloseStatus::normal(), true),
            Self::Failed(e) => {
                let sendable = !e.is_transport();
                let status = CloseStatus::new(e.session_close_code(), truncate_reason(e.to_string()));
                (CloseInitiator::Server, status, sendable)
            }
        }
    }
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}

/// Handler task that is aborted when the session ends.
struct HandlerTask(JoinHandle<Result<(), HandlerError>>);

impl Drop for HandlerTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run one session on `transport` until it closes.
#[instrument(skip_all, fields(path = %endpoint.template()))]
pub(crate) async fn run_session(
    runtime: &Runtime,
    endpoint: Arc<Endpoint>,
    params: Params,
    transport: Transport,
) -> SessionCloseInfo {
    let (mut sink, mut stream, handshake) = transport.into_parts();
    let path = endpoint.template().to_owned();
    let flow = endpoint.flow();

    let (session, close_rx) = Session::new(path.clone());
    let ctx = SessionContext::new(session.clone(), handshake, params);
    let streams = endpoint.open_streams(session.clone());
    let inbound = streams.subscribe_inbound();
    let outbound_rx = streams.subscribe_outbound();

    let limiter = acquire_limiter(&runtime.limiters, flow, &ctx);

    session.transition(SessionState::Connecting, SessionState::Active);
    runtime.registry.register(streams.clone());
    runtime.events.publish(SessionEvent::Connected {
        session_id: session.id(),
        path: path.clone(),
    });
    telemetry::record_session_opened(&path);
    info!(session_id = %session.id(), principal = %ctx.principal(), "Session opened");

    let mut handler = HandlerTask(tokio::spawn(endpoint.handler().handle(
        ctx.clone(),
        inbound,
        streams.outbound(),
    )));

    let (end, limiter_key) = match limiter {
        Ok(limiter) => {
            let end = drive(
                runtime,
                flow,
                &streams,
                &mut sink,
                &mut stream,
                limiter.as_ref().map(|(limiter, _)| limiter.as_ref()),
                &mut handler,
                outbound_rx,
                close_rx,
            )
            .await;
            let key = limiter
                .filter(|_| flow.rate_limit.scope == RateLimitScope::Session)
                .map(|(_, key)| key);
            (end, key)
        }
        Err(e) => {
            error!(session_id = %session.id(), error = %e, "Rate limiter unavailable");
            (SessionEnd::Failed(e), None)
        }
    };

    drop(handler);
    teardown(runtime, &streams, sink, end, limiter_key).await
}

type SessionLimiter = Option<(Arc<RateLimiter>, String)>;

fn acquire_limiter(
    limiters: &RateLimiterService,
    flow: &FlowControlConfig,
    ctx: &SessionContext,
) -> WsResult<SessionLimiter> {
    if !flow.rate_limit.enabled {
        return Ok(None);
    }
    let key = resolve_identifier(flow.rate_limit.scope, ctx);
    let limiter = limiters
        .get(ctx.path(), &key)
        .ok_or_else(|| WsError::rate_limiter_not_registered(ctx.path()))?;
    debug!(scope = flow.rate_limit.scope.as_str(), identifier = %key, "Rate limiter attached");
    Ok(Some((limiter, key)))
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    runtime: &Runtime,
    flow: &FlowControlConfig,
    streams: &SessionStreams,
    sink: &mut BoxFrameSink,
    stream: &mut BoxFrameStream,
    limiter: Option<&RateLimiter>,
    handler: &mut HandlerTask,
    outbound_rx: broadcast::Receiver<OutboundSignal>,
    close_rx: oneshot::Receiver<CloseStatus>,
) -> SessionEnd {
    let path = streams.session().path();
    let liveness = Liveness::new();
    let queue = BackpressureQueue::new(QueuePolicy::resolve(&flow.backpressure, path));
    let heartbeat = Heartbeat::new(&flow.heartbeat);

    let send = send_loop(sink, outbound_rx, &queue, heartbeat, &liveness, path);

    let processing = async {
        match (&mut handler.0).await {
            Ok(Ok(())) => streams.complete_outbound(),
            Ok(Err(HandlerError::Respond(payload))) => {
                if let Err(e) = streams.emit_error(payload) {
                    return e;
                }
            }
            Ok(Err(HandlerError::Failed(e))) => {
                warn!(session_id = %streams.session_id(), error = %e, "Handler failed");
                return WsError::HandlerFailed(format!("{e:#}"));
            }
            Err(join) => {
                error!(session_id = %streams.session_id(), error = %join, "Handler task aborted");
                return WsError::HandlerFailed(join.to_string());
            }
        }
        std::future::pending().await
    };

    tokio::select! {
        received = receive_loop(stream, streams, limiter, &liveness) => match received {
            ReceiveEnd::ClientClosed(status) => SessionEnd::ClientClosed(status),
            ReceiveEnd::Disconnected => SessionEnd::Disconnected,
            ReceiveEnd::Failed(e) => SessionEnd::ReceiveFailed(e),
        },
        sent = send => match sent {
            Ok(SendEnd::Completed) => SessionEnd::Completed,
            Ok(SendEnd::Responded) => SessionEnd::Responded,
            Err(e) => {
                warn!(session_id = %streams.session_id(), error = %e, "Send loop failed");
                SessionEnd::Failed(e)
            }
        },
        e = processing => SessionEnd::Failed(e),
        requested = close_rx => {
            SessionEnd::ServerClosed(requested.unwrap_or_else(|_| CloseStatus::normal()))
        },
        () = runtime.shutdown.cancelled() => {
            SessionEnd::ServerClosed(CloseStatus::going_away("server shutting down"))
        },
    }
}

async fn teardown(
    runtime: &Runtime,
    streams: &SessionStreams,
    mut sink: BoxFrameSink,
    end: SessionEnd,
    limiter_key: Option<String>,
) -> SessionCloseInfo {
    let session = streams.session();
    let path = session.path();
    if let SessionEnd::ReceiveFailed(e) = &end {
        debug!(session_id = %session.id(), error = %e, "Transport failed");
    }
    let (initiator, status, send_close) = end.resolve();

    session.transition(SessionState::Active, SessionState::Closing);
    runtime.registry.unregister(path, session.id());
    streams.close();
    if let Some(key) = limiter_key {
        runtime.limiters.release(path, &key);
    }

    let close_timeout = runtime.transport.close_timeout();
    let frame = send_close.then(|| Message::Close(Some(CloseFrame::from(status.clone()))));
    let closed = tokio::time::timeout(close_timeout, async {
        if let Some(frame) = frame {
            sink.send(frame).await?;
        }
        sink.close().await
    })
    .await;
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(session_id = %session.id(), error = %e, "Close handshake failed"),
        Err(_) => debug!(session_id = %session.id(), "Close handshake timed out"),
    }

    let lifetime = session.age();
    session.mark_closed();
    let info = SessionCloseInfo {
        session_id: session.id(),
        path: path.to_owned(),
        status,
        initiator,
        lifetime,
    };
    telemetry::record_session_closed(path, initiator.as_str(), lifetime);
    info!(
        session_id = %info.session_id,
        close_code = info.status.code,
        initiator = initiator.as_str(),
        lifetime_ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX),
        "Session closed"
    );
    runtime.events.publish(SessionEvent::Closed(info.clone()));
    info
}
