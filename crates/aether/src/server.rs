//! Running a service from configuration.

use std::future::Future;

use aether_config::{AetherConfig, ConfigError, ListenerKind};
use aether_telemetry::{init_telemetry, TelemetryError};
use aether_ws::{EndpointRouter, WebSocketService, WsError};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Startup or serving failure.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or applied.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The runtime rejected its settings or failed while serving.
    #[error(transparent)]
    Ws(#[from] WsError),

    /// Logging or metrics could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// The accept loop panicked.
    #[error("accept loop failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The listener could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Configured address.
        addr: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Resolves on Ctrl-C. If the handler cannot be installed it never resolves.
pub async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Install telemetry, bind the configured listener and serve `endpoints`
/// until `shutdown` resolves, then close live sessions within the
/// configured grace period.
pub async fn serve<F>(config: &AetherConfig, endpoints: EndpointRouter, shutdown: F) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    init_telemetry(&config.telemetry())?;
    let service = WebSocketService::new(endpoints, config.service_config())?;
    let listener = TcpListener::bind(&config.server.bind_addr)
        .await
        .map_err(|source| Error::Bind {
            addr: config.server.bind_addr.clone(),
            source,
        })?;
    serve_on(config, service, listener, shutdown).await
}

async fn serve_on<F>(
    config: &AetherConfig,
    service: WebSocketService,
    listener: TcpListener,
    shutdown: F,
) -> Result<(), Error>
where
    F: Future<Output = ()>,
{
    info!(
        addr = ?listener.local_addr().ok(),
        listener = ?config.server.listener,
        endpoints = service.endpoints().len(),
        "Serving"
    );
    service.start_maintenance();

    let accept = {
        let service = service.clone();
        let kind = config.server.listener;
        tokio::spawn(async move {
            match kind {
                ListenerKind::Http => service.serve_http(listener).await,
                ListenerKind::Tcp => service.serve_tcp(listener).await,
            }
        })
    };

    shutdown.await;
    info!("Shutdown requested");
    if !service.shutdown(config.shutdown_grace()).await {
        warn!("Sessions still open after the grace period");
    }

    accept.await?.map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_ws::{handler_fn, FlowControlConfig, HandlerError, Inbound, Outbound, SessionContext};
    use std::time::Duration;

    async fn idle(_ctx: SessionContext, mut inbound: Inbound, _outbound: Outbound) -> Result<(), HandlerError> {
        while inbound.recv().await.is_some() {}
        Ok(())
    }

    fn service(config: &AetherConfig) -> WebSocketService {
        let endpoints = config.build_router(|_| Some(handler_fn(idle))).unwrap();
        WebSocketService::new(endpoints, config.service_config()).unwrap()
    }

    #[tokio::test]
    async fn test_serve_on_stops_on_signal() {
        let mut config = AetherConfig::default().endpoint("/idle", FlowControlConfig::default());
        config.server.shutdown_grace_secs = 1;
        for kind in [ListenerKind::Http, ListenerKind::Tcp] {
            config.server.listener = kind;
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let result = tokio::time::timeout(
                Duration::from_secs(5),
                serve_on(&config, service(&config), listener, tokio::time::sleep(Duration::from_millis(20))),
            )
            .await
            .unwrap();
            assert!(result.is_ok(), "{kind:?}: {result:?}");
        }
    }

    #[tokio::test]
    async fn test_serve_reports_bind_failure() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = AetherConfig::default();
        config.server.bind_addr = taken.local_addr().unwrap().to_string();
        config.logging.enabled = false;

        let result = serve(&config, EndpointRouter::new(), async {}).await;
        assert!(matches!(result, Err(Error::Bind { .. })), "{result:?}");
    }
}
