//! End-to-end tests over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use aether_ws::{
    EndpointRouter, FlowControlConfig, HandlerError, Inbound, Outbound, ServiceConfig, SessionContext,
    SessionEvent, WebSocketService,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WireMessage;

async fn echo(ctx: SessionContext, mut inbound: Inbound, outbound: Outbound) -> Result<(), HandlerError> {
    let room = ctx.path_param("room").unwrap_or("none").to_owned();
    while let Some(msg) = inbound.recv().await {
        if let Some(text) = msg.as_text() {
            outbound.send(format!("{room}:{text}"))?;
        }
    }
    Ok(())
}

fn service() -> WebSocketService {
    let endpoints = EndpointRouter::new()
        .route("/echo/{room}", echo, FlowControlConfig::default())
        .unwrap();
    WebSocketService::new(endpoints, ServiceConfig::default()).unwrap()
}

async fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn next_text<S>(ws: &mut S) -> String
where
    S: futures_util::Stream<Item = Result<WireMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(WireMessage::Text(text)))) => return text.as_str().to_owned(),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_serve_tcp_echo() {
    let service = service();
    let mut events = service.subscribe();
    let (listener, addr) = listen().await;
    let server = tokio::spawn({
        let service = service.clone();
        async move { service.serve_tcp(listener).await }
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/echo/lobby?x=1")).await.unwrap();
    ws.send(WireMessage::text("hello")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "lobby:hello");

    assert!(matches!(events.recv().await.unwrap(), SessionEvent::Connected { .. }));
    ws.close(None).await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
        Ok(Ok(SessionEvent::Closed(info))) => assert_eq!(info.path, "/echo/{room}"),
        other => panic!("expected close event, got {other:?}"),
    }

    assert!(service.shutdown(Duration::from_secs(5)).await);
    server.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_serve_tcp_unknown_path_closes_with_policy_violation() {
    let service = service();
    let (listener, addr) = listen().await;
    tokio::spawn({
        let service = service.clone();
        async move { service.serve_tcp(listener).await }
    });

    let (mut ws, _) = connect_async(format!("ws://{addr}/nowhere")).await.unwrap();
    let frame = loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(WireMessage::Close(frame)))) => break frame,
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    };
    assert_eq!(frame.unwrap().code, CloseCode::Policy);
    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_serve_http_upgrade_echo() {
    let service = service();
    let (listener, addr) = listen().await;
    tokio::spawn({
        let service = service.clone();
        async move { service.serve_http(listener).await }
    });

    let (mut ws, response) = connect_async(format!("ws://{addr}/echo/http")).await.unwrap();
    assert_eq!(response.status(), http::StatusCode::SWITCHING_PROTOCOLS);
    ws.send(WireMessage::text("hi")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "http:hi");

    service.shutdown(Duration::from_secs(5)).await;
    let closed = loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(WireMessage::Close(frame)))) => break frame,
            Ok(Some(Ok(_))) => continue,
            Ok(None | Some(Err(_))) => break None,
            Err(_) => panic!("session did not close on shutdown"),
        }
    };
    if let Some(frame) = closed {
        assert_eq!(frame.code, CloseCode::Away);
    }
}
