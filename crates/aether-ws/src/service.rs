//! The WebSocket service: endpoint table, shared runtime state and the
//! accept loops.
//!
//! ```text
//!  TcpListener ──► serve_tcp  ──┐   (tokio-tungstenite handshake)
//!  TcpListener ──► serve_http ──┤   (hyper upgrade)
//!  Transport   ──────────────────┴──► serve_connection ──► run_session
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::SinkExt;
use http::{HeaderMap, Request, Response, StatusCode, Uri};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::config::ServiceConfig;
use crate::endpoint::EndpointRouter;
use crate::error::{CloseCode, WsError, WsResult};
use crate::events::{SessionCloseInfo, SessionEvent, SessionEventBus};
use crate::message::{CloseFrame, Message};
use crate::orchestrator::{run_session, Runtime};
use crate::rate_limit::RateLimiterService;
use crate::registry::SessionRegistry;
use crate::session::{CloseStatus, HandshakeInfo};
use crate::template::WebSocketTemplate;
use crate::transport::Transport;
use crate::upgrade::{complete_upgrade, handshake_info, plain_response, prepare_upgrade};

struct ServiceInner {
    endpoints: EndpointRouter,
    runtime: Runtime,
    config: ServiceConfig,
    tracker: TaskTracker,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Serves WebSocket sessions for a fixed set of endpoints.
///
/// Cloning is cheap; clones share every session, limiter and listener.
#[derive(Clone)]
pub struct WebSocketService {
    inner: Arc<ServiceInner>,
}

impl WebSocketService {
    /// Build a service, registering each endpoint's rate limit shape.
    pub fn new(endpoints: EndpointRouter, config: ServiceConfig) -> WsResult<Self> {
        config.validate()?;
        let limiters = RateLimiterService::new();
        for endpoint in endpoints.endpoints() {
            let rate_limit = &endpoint.flow().rate_limit;
            if rate_limit.enabled {
                limiters.register_config(endpoint.template(), rate_limit)?;
            }
        }

        let runtime = Runtime {
            registry: SessionRegistry::new(),
            limiters,
            events: SessionEventBus::default(),
            shutdown: CancellationToken::new(),
            transport: config.transport.clone(),
        };
        info!(endpoints = endpoints.len(), "WebSocket service ready");

        Ok(Self {
            inner: Arc::new(ServiceInner {
                endpoints,
                runtime,
                config,
                tracker: TaskTracker::new(),
                maintenance: Mutex::new(None),
            }),
        })
    }

    /// The endpoint table.
    pub fn endpoints(&self) -> &EndpointRouter {
        &self.inner.endpoints
    }

    /// The session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.runtime.registry
    }

    /// The rate limiter service.
    pub fn rate_limiters(&self) -> &Arc<RateLimiterService> {
        &self.inner.runtime.limiters
    }

    /// The lifecycle event bus.
    pub fn events(&self) -> &SessionEventBus {
        &self.inner.runtime.events
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.runtime.events.subscribe()
    }

    /// Messaging helpers over this service's sessions.
    pub fn template(&self) -> WebSocketTemplate {
        WebSocketTemplate::new(Arc::clone(&self.inner.runtime.registry))
    }

    /// Service configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// True once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.runtime.shutdown.is_cancelled()
    }

    /// Start the registry maintenance task. Calling it again is a no-op.
    pub fn start_maintenance(&self) {
        let mut slot = self.inner.maintenance.lock();
        if slot.is_none() {
            let runtime = &self.inner.runtime;
            *slot = Some(runtime.registry.spawn_maintenance(
                &self.inner.config.registry,
                Arc::clone(&runtime.limiters),
                runtime.shutdown.child_token(),
            ));
        }
    }

    /// Run one session on `transport` until it closes.
    ///
    /// A path with no endpoint is closed with 1008; during shutdown new
    /// connections are closed with 1001.
    pub async fn serve_connection(&self, transport: Transport) -> WsResult<SessionCloseInfo> {
        let path = transport.handshake().uri.path().to_owned();
        if self.is_shutting_down() {
            self.reject(transport, CloseStatus::going_away("server shutting down")).await;
            return Err(WsError::connection_closed(
                Some(CloseCode::GoingAway.as_u16()),
                "server shutting down",
            ));
        }

        let Some((endpoint, params)) = self.inner.endpoints.resolve(&path) else {
            warn!(path = %path, "No endpoint for path");
            self.reject(
                transport,
                CloseStatus::new(CloseCode::PolicyViolation, "no endpoint for path"),
            )
            .await;
            return Err(WsError::NoRoute { path });
        };

        Ok(run_session(&self.inner.runtime, endpoint, params, transport).await)
    }

    /// Run `transport` on a tracked background task.
    pub fn spawn_connection(&self, transport: Transport) -> JoinHandle<WsResult<SessionCloseInfo>> {
        let service = self.clone();
        self.inner
            .tracker
            .spawn(async move { service.serve_connection(transport).await })
    }

    async fn reject(&self, transport: Transport, status: CloseStatus) {
        let (mut sink, _stream, _handshake) = transport.into_parts();
        let frame = Message::Close(Some(CloseFrame::from(status)));
        let _ = tokio::time::timeout(self.inner.config.transport.close_timeout(), async {
            sink.send(frame).await?;
            sink.close().await
        })
        .await;
    }

    /// Accept raw TCP connections and perform the WebSocket handshake on
    /// each. Returns once the service shuts down.
    #[instrument(skip_all)]
    pub async fn serve_tcp(&self, listener: TcpListener) -> WsResult<()> {
        self.accept_loop(listener, |service, stream, addr| async move {
            service.accept_websocket(stream, addr).await;
        })
        .await
    }

    /// Accept HTTP/1.1 connections and upgrade WebSocket requests through
    /// hyper. Returns once the service shuts down.
    #[instrument(skip_all)]
    pub async fn serve_http(&self, listener: TcpListener) -> WsResult<()> {
        self.accept_loop(listener, |service, stream, addr| async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |request: Request<Incoming>| {
                let handler = service.clone();
                async move { Ok::<_, Infallible>(handler.upgrade(request, Some(addr))) }
            });
            let conn = http1::Builder::new().serve_connection(io, svc).with_upgrades();
            if let Err(e) = conn.await {
                debug!(remote_addr = %addr, error = %e, "HTTP connection ended with error");
            }
        })
        .await
    }

    async fn accept_loop<F, Fut>(&self, listener: TcpListener, on_accept: F) -> WsResult<()>
    where
        F: Fn(Self, TcpStream, SocketAddr) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let local = listener.local_addr()?;
        info!(addr = %local, "Accepting WebSocket connections");
        let shutdown = self.inner.runtime.shutdown.clone();
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!(remote_addr = %addr, "Connection accepted");
                        self.inner.tracker.spawn(on_accept(self.clone(), stream, addr));
                    }
                    Err(e) => warn!(error = %e, "Failed to accept connection"),
                },
            }
        }
        info!(addr = %local, "Stopped accepting connections");
        Ok(())
    }

    async fn accept_websocket(&self, stream: TcpStream, addr: SocketAddr) {
        let mut captured: Option<(Uri, HeaderMap)> = None;
        let callback = |request: &HandshakeRequest, response: HandshakeResponse| {
            captured = Some((request.uri().clone(), request.headers().clone()));
            Ok::<_, ErrorResponse>(response)
        };
        let config = self.inner.config.transport.to_protocol_config();
        let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(config)).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(remote_addr = %addr, error = %e, "WebSocket handshake failed");
                return;
            }
        };

        let (uri, headers) = captured.unwrap_or_default();
        let handshake = HandshakeInfo::new(uri).headers(headers).remote_addr(addr);
        if let Err(e) = self.serve_connection(Transport::from_websocket(ws, handshake)).await {
            debug!(remote_addr = %addr, error = %e, "Connection rejected");
        }
    }

    /// Answer an HTTP upgrade request.
    ///
    /// On success the 101 response is returned and the session starts on a
    /// background task once hyper hands over the connection. Unknown paths
    /// get 404, malformed handshakes 400, and 503 during shutdown.
    pub fn upgrade<B>(&self, mut request: Request<B>, remote_addr: Option<SocketAddr>) -> Response<Full<Bytes>> {
        if self.is_shutting_down() {
            return plain_response(StatusCode::SERVICE_UNAVAILABLE, "server shutting down");
        }
        if self.inner.endpoints.resolve(request.uri().path()).is_none() {
            return plain_response(StatusCode::NOT_FOUND, "no endpoint for path");
        }

        let upgrade = prepare_upgrade(&request, None);
        if !upgrade.success {
            return upgrade.response;
        }

        let mut handshake = handshake_info(&request);
        if let Some(addr) = remote_addr {
            handshake = handshake.remote_addr(addr);
        }
        let on_upgrade = hyper::upgrade::on(&mut request);
        let service = self.clone();
        self.inner.tracker.spawn(async move {
            match on_upgrade.await {
                Ok(upgraded) => {
                    let ws = complete_upgrade(TokioIo::new(upgraded), &service.inner.config.transport).await;
                    if let Err(e) = service.serve_connection(Transport::from_websocket(ws, handshake)).await {
                        debug!(error = %e, "Upgraded connection rejected");
                    }
                }
                Err(e) => warn!(error = %e, "HTTP upgrade failed"),
            }
        });
        upgrade.response
    }

    /// Stop accepting connections, close every session with 1001 and wait
    /// up to `grace` for tracked tasks to finish. Returns true if they all
    /// finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        info!(sessions = self.registry().len(), "Shutting down WebSocket service");
        self.inner.runtime.shutdown.cancel();
        self.registry()
            .shutdown(&CloseStatus::going_away("server shutting down"));
        self.inner.tracker.close();

        let drained = tokio::time::timeout(grace, self.inner.tracker.wait())
            .await
            .is_ok();
        if !drained {
            warn!(remaining = self.registry().len(), "Shutdown grace period elapsed");
        }
        if let Some(handle) = self.inner.maintenance.lock().take() {
            handle.abort();
        }
        drained
    }
}

impl std::fmt::Debug for WebSocketService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketService")
            .field("endpoints", &self.inner.endpoints.len())
            .field("sessions", &self.registry().len())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}
