#![allow(dead_code)]

use std::time::Duration;

use aether_ws::{
    EndpointRouter, FlowControlConfig, HandlerError, Inbound, MessageHandler, Outbound,
    ServiceConfig, SessionContext, SessionEvent, SessionId, WebSocketService,
};
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

/// Service with a single endpoint.
pub fn service<H: MessageHandler>(template: &str, handler: H, flow: FlowControlConfig) -> WebSocketService {
    let endpoints = EndpointRouter::new().route(template, handler, flow).unwrap();
    WebSocketService::new(endpoints, ServiceConfig::default()).unwrap()
}

/// Echo every text frame back unchanged.
pub async fn echo(_ctx: SessionContext, mut inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
    while let Some(msg) = inbound.recv().await {
        if let Some(text) = msg.as_text() {
            outbound.send(text.to_owned())?;
        }
    }
    Ok(())
}

/// On each text frame holding a number `n`, emit `msg-1` .. `msg-n` at once.
pub async fn producer(_ctx: SessionContext, mut inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
    while let Some(msg) = inbound.recv().await {
        let count: usize = msg.as_text().and_then(|t| t.parse().ok()).unwrap_or(0);
        for i in 1..=count {
            outbound.send(format!("msg-{i}"))?;
        }
    }
    Ok(())
}

/// Wait for the next `Connected` event.
pub async fn connected(events: &mut broadcast::Receiver<SessionEvent>) -> SessionId {
    loop {
        match tokio::time::timeout(WAIT, events.recv()).await {
            Ok(Ok(SessionEvent::Connected { session_id, .. })) => return session_id,
            Ok(Ok(_)) => continue,
            other => panic!("expected connected event, got {other:?}"),
        }
    }
}

/// Sequence numbers of `msg-N` frames.
pub fn sequence(texts: &[String]) -> Vec<usize> {
    texts
        .iter()
        .map(|t| t.trim_start_matches("msg-").parse().unwrap())
        .collect()
}

pub fn strictly_increasing(seq: &[usize]) -> bool {
    seq.windows(2).all(|w| w[0] < w[1])
}
