//! HTTP/1.1 → WebSocket upgrade (RFC 6455 §4.2).
//!
//! Validation and response construction are independent of the server so
//! any hyper-based stack can answer the handshake; [`complete_upgrade`]
//! turns the upgraded connection into a frame stream once the 101
//! response has gone out.

use base64::Engine;
use bytes::Bytes;
use http::{header, HeaderValue, Request, Response, StatusCode};
use http_body_util::Full;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, instrument};

use crate::config::TransportConfig;
use crate::error::{WsError, WsResult};
use crate::session::{HandshakeInfo, Principal};

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const SEC_WEBSOCKET_KEY: &str = "sec-websocket-key";
const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";
const SEC_WEBSOCKET_ACCEPT: &str = "sec-websocket-accept";
const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";

fn header_str<'a, B>(request: &'a Request<B>, name: impl header::AsHeaderName) -> Option<&'a str> {
    request.headers().get(name).and_then(|v| v.to_str().ok())
}

/// True if `request` carries every header a WebSocket upgrade needs.
pub fn is_websocket_request<B>(request: &Request<B>) -> bool {
    validate_upgrade_request(request).is_ok()
}

/// Subprotocols the client offered, in order.
pub fn requested_protocols<B>(request: &Request<B>) -> Vec<String> {
    request
        .headers()
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(',').map(str::trim))
        .filter(|p| !p.is_empty())
        .map(String::from)
        .collect()
}

/// `Sec-WebSocket-Accept` for a client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Check the upgrade headers and return the accept key.
#[instrument(skip(request))]
pub fn validate_upgrade_request<B>(request: &Request<B>) -> WsResult<String> {
    let connection_upgrade = header_str(request, header::CONNECTION)
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("upgrade")));
    if !connection_upgrade {
        return Err(WsError::not_websocket("missing Connection: Upgrade header"));
    }

    let upgrade_websocket =
        header_str(request, header::UPGRADE).is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !upgrade_websocket {
        return Err(WsError::not_websocket("missing Upgrade: websocket header"));
    }

    let key = header_str(request, SEC_WEBSOCKET_KEY)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| WsError::not_websocket("missing Sec-WebSocket-Key header"))?;

    if header_str(request, SEC_WEBSOCKET_VERSION) != Some("13") {
        return Err(WsError::not_websocket(
            "missing or invalid Sec-WebSocket-Version header (must be 13)",
        ));
    }

    Ok(compute_accept_key(key))
}

/// Outcome of [`prepare_upgrade`].
#[derive(Debug)]
pub struct WebSocketUpgrade {
    /// Response to send: 101 on success, 400 otherwise.
    pub response: Response<Full<Bytes>>,
    /// The selected subprotocol.
    pub protocol: Option<String>,
    /// Whether the handshake was accepted.
    pub success: bool,
}

/// Validate `request` and build the handshake response.
///
/// When `allowed_protocols` is given, the first client-offered protocol
/// found in it is selected.
pub fn prepare_upgrade<B>(request: &Request<B>, allowed_protocols: Option<&[&str]>) -> WebSocketUpgrade {
    let accept_key = match validate_upgrade_request(request) {
        Ok(key) => key,
        Err(e) => {
            debug!(error = %e, "WebSocket upgrade rejected");
            return WebSocketUpgrade {
                response: plain_response(StatusCode::BAD_REQUEST, e.to_string()),
                protocol: None,
                success: false,
            };
        }
    };

    let protocol = allowed_protocols.and_then(|allowed| {
        requested_protocols(request)
            .into_iter()
            .find(|p| allowed.iter().any(|a| a.eq_ignore_ascii_case(p)))
    });

    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    let headers = response.headers_mut();
    headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept_key) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, value);
    }
    if let Some(value) = protocol.as_deref().and_then(|p| HeaderValue::from_str(p).ok()) {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    WebSocketUpgrade {
        response,
        protocol,
        success: true,
    }
}

/// A plain-text response with `status`.
pub fn plain_response(status: StatusCode, body: impl Into<String>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.into())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

/// Handshake metadata carried by an upgrade request. A [`Principal`]
/// placed in the request extensions by an upstream layer is picked up.
pub fn handshake_info<B>(request: &Request<B>) -> HandshakeInfo {
    let mut info = HandshakeInfo::new(request.uri().clone()).headers(request.headers().clone());
    if let Some(principal) = request.extensions().get::<Principal>() {
        info = info.principal(principal.clone());
    }
    info
}

/// Wrap an upgraded connection as a server-side WebSocket.
pub async fn complete_upgrade<S>(io: S, config: &TransportConfig) -> WebSocketStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    WebSocketStream::from_raw_socket(io, Role::Server, Some(config.to_protocol_config())).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws_request() -> http::request::Builder {
        Request::builder()
            .uri("/chat/lobby?user=ann")
            .header(header::CONNECTION, "keep-alive, Upgrade")
            .header(header::UPGRADE, "websocket")
            .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("Sec-WebSocket-Version", "13")
    }

    #[test]
    fn test_compute_accept_key() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_validate_upgrade_request() {
        let request = ws_request().body(()).unwrap();
        assert!(is_websocket_request(&request));
        assert_eq!(
            validate_upgrade_request(&request).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_validate_rejects_missing_headers() {
        let request = Request::builder()
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        let err = validate_upgrade_request(&request).unwrap_err();
        assert!(err.to_string().contains("Connection"));

        let mut request = ws_request().body(()).unwrap();
        request
            .headers_mut()
            .insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("12"));
        assert!(!is_websocket_request(&request));
    }

    #[test]
    fn test_prepare_upgrade_selects_protocol() {
        let request = ws_request()
            .header("Sec-WebSocket-Protocol", "chat, json")
            .body(())
            .unwrap();
        let upgrade = prepare_upgrade(&request, Some(&["json", "xml"]));
        assert!(upgrade.success);
        assert_eq!(upgrade.response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(upgrade.protocol.as_deref(), Some("json"));
        assert_eq!(
            upgrade.response.headers().get(SEC_WEBSOCKET_ACCEPT).unwrap(),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_prepare_upgrade_rejects_plain_request() {
        let upgrade = prepare_upgrade(&Request::builder().body(()).unwrap(), None);
        assert!(!upgrade.success);
        assert_eq!(upgrade.response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_requested_protocols_across_headers() {
        let request = Request::builder()
            .header("Sec-WebSocket-Protocol", "chat")
            .header("Sec-WebSocket-Protocol", "json, ")
            .body(())
            .unwrap();
        assert_eq!(requested_protocols(&request), vec!["chat", "json"]);
    }

    #[test]
    fn test_handshake_info_from_request() {
        let mut request = ws_request().body(()).unwrap();
        request.extensions_mut().insert(Principal::user("ann"));
        let info = handshake_info(&request);
        assert_eq!(info.uri.path(), "/chat/lobby");
        assert_eq!(info.principal, Some(Principal::user("ann")));
        assert!(info.headers.contains_key(SEC_WEBSOCKET_KEY));
    }
}
