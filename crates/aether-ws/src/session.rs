//! The per-connection session handle and its resolved context.
//!
//! A [`Session`] is a cheap clonable handle: id, open predicate and a
//! close request. The orchestrator owns the lifecycle; everything else
//! (registry, template, handlers) only observes it or asks it to close.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use aether_router::Params;
use http::{HeaderMap, Uri};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::error::CloseCode;
use crate::message::CloseFrame;

/// A unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new time-ordered session ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a session ID from a UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for SessionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// The identity negotiated at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Principal {
    /// No credentials were presented.
    #[default]
    Anonymous,
    /// An authenticated user.
    User(String),
}

impl Principal {
    /// Authenticated user named `name`.
    pub fn user(name: impl Into<String>) -> Self {
        Self::User(name.into())
    }

    /// The user's name, if authenticated.
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Anonymous => None,
            Self::User(name) => Some(name),
        }
    }

    /// True for [`Principal::Anonymous`].
    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("anonymous"),
            Self::User(name) => f.write_str(name),
        }
    }
}

/// Session lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Handshake accepted, context being built.
    Connecting = 0,
    /// Registered and running.
    Active = 1,
    /// Teardown in progress.
    Closing = 2,
    /// Fully released.
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Which side ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseInitiator {
    /// The peer sent a close frame or the connection dropped.
    Client,
    /// The server requested the close or a server-side policy fired.
    Server,
}

impl CloseInitiator {
    /// Lower-case name, used as a metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

/// Close code and reason of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    /// Numeric close code (application codes 4000-4999 allowed).
    pub code: u16,
    /// Human-readable reason.
    pub reason: String,
}

impl CloseStatus {
    /// Status with a standard code.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: reason.into(),
        }
    }

    /// Normal closure (1000).
    pub fn normal() -> Self {
        Self::new(CloseCode::Normal, "")
    }

    /// Going away (1001).
    pub fn going_away(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::GoingAway, reason)
    }

    /// The standard code, if any.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_u16(self.code)
    }

    /// True if this status may be written into a close frame.
    pub fn is_sendable(&self) -> bool {
        self.close_code().map_or(true, |code| !code.is_reserved())
    }
}

impl From<CloseFrame> for CloseStatus {
    fn from(frame: CloseFrame) -> Self {
        Self {
            code: frame.code,
            reason: frame.reason.into_owned(),
        }
    }
}

impl From<CloseStatus> for CloseFrame {
    fn from(status: CloseStatus) -> Self {
        Self {
            code: status.code,
            reason: status.reason.into(),
        }
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} ({})", self.code, self.reason)
        }
    }
}

struct SessionInner {
    id: SessionId,
    path: String,
    opened_at: Instant,
    state: AtomicU8,
    close_request: Mutex<Option<oneshot::Sender<CloseStatus>>>,
}

/// Handle to one live connection.
///
/// Cloning is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// New session in [`SessionState::Connecting`] plus the receiver its
    /// close listener waits on.
    pub(crate) fn new(path: impl Into<String>) -> (Self, oneshot::Receiver<CloseStatus>) {
        let (tx, rx) = oneshot::channel();
        let session = Self {
            inner: Arc::new(SessionInner {
                id: SessionId::new(),
                path: path.into(),
                opened_at: Instant::now(),
                state: AtomicU8::new(SessionState::Connecting as u8),
                close_request: Mutex::new(Some(tx)),
            }),
        };
        (session, rx)
    }

    /// The session id.
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    /// The endpoint path template this session was accepted on.
    pub fn path(&self) -> &str {
        &self.inner.path
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// True while the session is active. Returns false from the moment
    /// teardown starts.
    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Time since the handshake was accepted.
    pub fn age(&self) -> Duration {
        self.inner.opened_at.elapsed()
    }

    /// Ask the session to close with `status`. Only the first request
    /// counts; later ones and requests after teardown are ignored.
    /// Returns true if this call delivered the request.
    pub fn close(&self, status: CloseStatus) -> bool {
        let Some(tx) = self.inner.close_request.lock().take() else {
            return false;
        };
        tx.send(status).is_ok()
    }

    /// Atomically move `from` → `to`. Returns false if the session was not
    /// in `from`.
    pub(crate) fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.state.store(SessionState::Closed as u8, Ordering::Release);
        self.inner.close_request.lock().take();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("path", &self.inner.path)
            .field("state", &self.state())
            .finish()
    }
}

/// Connection metadata captured by the transport during the handshake.
#[derive(Debug, Clone, Default)]
pub struct HandshakeInfo {
    /// Request URI (path and query).
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
    /// Peer address, if known.
    pub remote_addr: Option<SocketAddr>,
    /// Authenticated principal, if the upstream layer resolved one.
    pub principal: Option<Principal>,
}

impl HandshakeInfo {
    /// Handshake for `uri` with no headers, address or principal.
    pub fn new(uri: Uri) -> Self {
        Self {
            uri,
            ..Self::default()
        }
    }

    /// Parse `uri` into a handshake. Falls back to `/` on a malformed URI.
    pub fn for_path(uri: &str) -> Self {
        Self::new(uri.parse().unwrap_or_else(|_| Uri::from_static("/")))
    }

    /// Set the headers.
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the peer address.
    pub fn remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set the principal.
    pub fn principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }
}

/// Everything a processing stage knows about its session: the handle,
/// identity, and parameters parsed from the handshake.
#[derive(Debug, Clone)]
pub struct SessionContext {
    session: Session,
    principal: Principal,
    path_params: Params,
    query: HashMap<String, Vec<String>>,
    headers: HeaderMap,
    remote_addr: Option<SocketAddr>,
    uri: Uri,
}

impl SessionContext {
    pub(crate) fn new(session: Session, handshake: HandshakeInfo, path_params: Params) -> Self {
        let query = handshake.uri.query().map(parse_query).unwrap_or_default();
        Self {
            session,
            principal: handshake.principal.unwrap_or_default(),
            path_params,
            query,
            headers: handshake.headers,
            remote_addr: handshake.remote_addr,
            uri: handshake.uri,
        }
    }

    /// The session handle.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Shorthand for `session().id()`.
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// The endpoint path template.
    pub fn path(&self) -> &str {
        self.session.path()
    }

    /// The request URI.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The principal, [`Principal::Anonymous`] if none was negotiated.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Peer address, if known.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// All captured path parameters.
    pub fn path_params(&self) -> &Params {
        &self.path_params
    }

    /// A path parameter by name.
    pub fn path_param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name)
    }

    /// First value of a query parameter.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).and_then(|v| v.first()).map(String::as_str)
    }

    /// All values of a query parameter.
    pub fn query_params(&self, name: &str) -> &[String] {
        self.query.get(name).map_or(&[], Vec::as_slice)
    }

    /// First value of a header, if it is valid visible ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// All headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Parse a path parameter into `T`. `None` if absent or unparsable.
    pub fn parse_path_param<T: FromStr>(&self, name: &str) -> Option<T> {
        self.path_param(name).and_then(|v| v.parse().ok())
    }

    /// Parse a query parameter into `T`. `None` if absent or unparsable.
    pub fn parse_query_param<T: FromStr>(&self, name: &str) -> Option<T> {
        self.query_param(name).and_then(|v| v.parse().ok())
    }
}

/// `a=1&b=2&a=3` into a multimap, decoded as `application/x-www-form-urlencoded`.
fn parse_query(query: &str) -> HashMap<String, Vec<String>> {
    let pairs: Vec<(String, String)> = match serde_urlencoded::from_str(query) {
        Ok(pairs) => pairs,
        Err(e) => {
            debug!(error = %e, "Ignoring undecodable query string");
            Vec::new()
        }
    };
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (key, value) in pairs {
        out.entry(key).or_default().push(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_unique_and_parseable() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<SessionId>().unwrap(), a);
    }

    #[test]
    fn test_state_transitions_are_one_way() {
        let (session, _rx) = Session::new("/echo");
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(!session.is_open());

        assert!(session.transition(SessionState::Connecting, SessionState::Active));
        assert!(session.is_open());

        assert!(session.transition(SessionState::Active, SessionState::Closing));
        assert!(!session.transition(SessionState::Active, SessionState::Closing));
        assert!(!session.is_open());

        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_request_delivered_once() {
        let (session, rx) = Session::new("/echo");
        assert!(session.close(CloseStatus::going_away("bye")));
        assert!(!session.close(CloseStatus::normal()));
        assert_eq!(rx.await.unwrap(), CloseStatus::going_away("bye"));
    }

    #[test]
    fn test_close_after_teardown_is_ignored() {
        let (session, _rx) = Session::new("/echo");
        session.mark_closed();
        assert!(!session.close(CloseStatus::normal()));
    }

    #[test]
    fn test_principal() {
        assert!(Principal::default().is_anonymous());
        assert_eq!(Principal::user("alice").name(), Some("alice"));
        assert_eq!(Principal::Anonymous.to_string(), "anonymous");
    }

    #[test]
    fn test_close_status_sendable() {
        assert!(CloseStatus::normal().is_sendable());
        assert!(!CloseStatus::new(CloseCode::Abnormal, "").is_sendable());
        let custom = CloseStatus {
            code: 4001,
            reason: "kicked".into(),
        };
        assert!(custom.is_sendable());
        assert_eq!(custom.to_string(), "4001 (kicked)");
    }

    #[test]
    fn test_context_parses_query_and_params() {
        let (session, _rx) = Session::new("/chat/{room}");
        let mut headers = HeaderMap::new();
        headers.insert("x-client", "cli".parse().unwrap());
        let handshake = HandshakeInfo::for_path("/chat/lobby?tag=a&tag=b&name=J%C3%BCrgen+X&page=3")
            .headers(headers)
            .remote_addr("10.0.0.7:5555".parse().unwrap());
        let mut params = Params::new();
        params.push("room", "lobby");

        let ctx = SessionContext::new(session, handshake, params);

        assert_eq!(ctx.path(), "/chat/{room}");
        assert_eq!(ctx.path_param("room"), Some("lobby"));
        assert_eq!(ctx.query_params("tag"), ["a".to_string(), "b".to_string()]);
        assert_eq!(ctx.query_param("name"), Some("Jürgen X"));
        assert_eq!(ctx.parse_query_param::<u32>("page"), Some(3));
        assert_eq!(ctx.parse_query_param::<u32>("name"), None);
        assert_eq!(ctx.header("x-client"), Some("cli"));
        assert!(ctx.principal().is_anonymous());
        assert_eq!(ctx.remote_addr().unwrap().port(), 5555);
    }

    #[test]
    fn test_query_without_values() {
        let q = parse_query("flag&empty=&x=1");
        assert_eq!(q["flag"], vec![String::new()]);
        assert_eq!(q["empty"], vec![String::new()]);
        assert_eq!(q["x"], vec!["1".to_string()]);
    }

    #[test]
    fn test_query_keeps_malformed_escapes_literal() {
        let q = parse_query("a=%ZZ&b=100%25&c=x+y");
        assert_eq!(q["a"], vec!["%ZZ".to_string()]);
        assert_eq!(q["b"], vec!["100%".to_string()]);
        assert_eq!(q["c"], vec!["x y".to_string()]);
    }
}
