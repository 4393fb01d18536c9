//! Process-wide session registry.
//!
//! Sessions are keyed by path template and session id. A secondary index
//! resolves a session id to its path so callers can find a session
//! without knowing where it connected.
//!
//! The registry also runs the periodic maintenance task: it sweeps
//! entries whose session is no longer open and evicts idle rate limiters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::rate_limit::RateLimiterService;
use crate::session::{CloseStatus, SessionId};
use crate::streams::SessionStreams;

/// Counters describing registry activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Currently registered sessions.
    pub active_sessions: usize,
    /// Paths with at least one session.
    pub paths: usize,
    /// Sessions ever registered.
    pub total_registered: usize,
    /// Sessions ever removed.
    pub total_unregistered: usize,
}

/// Concurrent map of `(path, session id)` to the session's streams.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, HashMap<SessionId, SessionStreams>>,
    index: DashMap<SessionId, String>,
    active: AtomicUsize,
    total_registered: AtomicUsize,
    total_unregistered: AtomicUsize,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `streams` under its session's path. A duplicate key is
    /// overwritten.
    pub fn register(&self, streams: SessionStreams) {
        let id = streams.session_id();
        let path = streams.session().path().to_owned();

        let replaced = self
            .sessions
            .entry(path.clone())
            .or_default()
            .insert(id, streams)
            .is_some();
        self.index.insert(id, path.clone());

        if !replaced {
            self.active.fetch_add(1, Ordering::Relaxed);
            self.total_registered.fetch_add(1, Ordering::Relaxed);
        }
        debug!(session_id = %id, path = %path, "Session registered");
    }

    /// Remove the entry for `(path, id)`. No-op if absent.
    pub fn unregister(&self, path: &str, id: SessionId) -> Option<SessionStreams> {
        let removed = self
            .sessions
            .get_mut(path)
            .and_then(|mut by_id| by_id.remove(&id));
        self.sessions.remove_if(path, |_, by_id| by_id.is_empty());

        if removed.is_some() {
            self.index.remove_if(&id, |_, p| p == path);
            self.active.fetch_sub(1, Ordering::Relaxed);
            self.total_unregistered.fetch_add(1, Ordering::Relaxed);
            debug!(session_id = %id, path, "Session unregistered");
        }
        removed
    }

    /// The streams for `(path, id)`.
    pub fn get(&self, path: &str, id: SessionId) -> Option<SessionStreams> {
        self.sessions.get(path)?.get(&id).cloned()
    }

    /// The streams for `id` on whatever path it connected to.
    pub fn lookup(&self, id: SessionId) -> Option<SessionStreams> {
        let path = self.index.get(&id)?.value().clone();
        self.get(&path, id)
    }

    /// True if `(path, id)` is registered.
    pub fn contains(&self, path: &str, id: SessionId) -> bool {
        self.sessions
            .get(path)
            .is_some_and(|by_id| by_id.contains_key(&id))
    }

    /// Snapshot of every session on `path`.
    pub fn sessions(&self, path: &str) -> Vec<SessionStreams> {
        self.sessions
            .get(path)
            .map(|by_id| by_id.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every registered session.
    pub fn all_sessions(&self) -> Vec<SessionStreams> {
        self.sessions
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    /// Paths with at least one session.
    pub fn paths(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().clone()).collect()
    }

    /// Number of registered sessions.
    pub fn len(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current counters.
    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            active_sessions: self.len(),
            paths: self.sessions.len(),
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_unregistered: self.total_unregistered.load(Ordering::Relaxed),
        }
    }

    /// Remove entries whose session is no longer open and close their
    /// streams. Returns the number removed.
    pub fn cleanup_orphaned(&self) -> usize {
        let orphaned: Vec<(String, SessionId)> = self
            .sessions
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .values()
                    .filter(|streams| !streams.session().is_open())
                    .map(|streams| (entry.key().clone(), streams.session_id()))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut removed = 0;
        for (path, id) in orphaned {
            if let Some(streams) = self.unregister(&path, id) {
                streams.close();
                removed += 1;
            }
        }

        if removed > 0 {
            info!(count = removed, "Cleaned up orphaned sessions");
        }
        removed
    }

    /// Ask every registered session to close with `status`. Sessions that
    /// can no longer take a close request have their streams closed
    /// directly. Returns the number of sessions notified.
    pub fn shutdown(&self, status: &CloseStatus) -> usize {
        let sessions = self.all_sessions();
        info!(sessions = sessions.len(), "Closing all sessions");
        for streams in &sessions {
            if !streams.session().close(status.clone()) {
                streams.close();
            }
        }
        sessions.len()
    }

    /// Spawn the periodic sweep. Stops when `cancel` fires.
    pub fn spawn_maintenance(
        self: &Arc<Self>,
        config: &RegistryConfig,
        limiters: Arc<RateLimiterService>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let start = tokio::time::Instant::now() + config.cleanup_initial_delay();
        let period = config.cleanup_interval();
        let idle_ttl = config.limiter_idle_ttl();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let sessions = registry.cleanup_orphaned();
                        let evicted = limiters.evict_idle(idle_ttl);
                        debug!(sessions, evicted, "Registry maintenance pass");
                    }
                }
            }
            debug!("Registry maintenance stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionState};
    use std::time::Duration;

    fn open_streams(path: &str) -> SessionStreams {
        let (session, _rx) = Session::new(path);
        session.transition(SessionState::Connecting, SessionState::Active);
        SessionStreams::new(session)
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        let streams = open_streams("/chat");
        let id = streams.session_id();
        registry.register(streams);

        assert!(registry.contains("/chat", id));
        assert!(registry.get("/chat", id).is_some());
        assert!(registry.get("/other", id).is_none());
        assert_eq!(registry.lookup(id).unwrap().session_id(), id);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.paths(), vec!["/chat".to_string()]);
    }

    #[test]
    fn test_register_last_write_wins() {
        let registry = SessionRegistry::new();
        let streams = open_streams("/chat");
        let id = streams.session_id();
        registry.register(streams.clone());
        registry.register(streams);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.stats().total_registered, 1);
        assert!(registry.unregister("/chat", id).is_some());
    }

    #[test]
    fn test_unregister_absent_is_noop() {
        let registry = SessionRegistry::new();
        assert!(registry.unregister("/chat", SessionId::new()).is_none());

        let streams = open_streams("/chat");
        let id = streams.session_id();
        registry.register(streams);
        assert!(registry.unregister("/chat", id).is_some());
        assert!(registry.unregister("/chat", id).is_none());
        assert!(registry.lookup(id).is_none());
        assert!(registry.is_empty());
        assert!(registry.paths().is_empty());
        assert_eq!(registry.stats().total_unregistered, 1);
    }

    #[test]
    fn test_sessions_snapshot_per_path() {
        let registry = SessionRegistry::new();
        registry.register(open_streams("/a"));
        registry.register(open_streams("/a"));
        registry.register(open_streams("/b"));

        assert_eq!(registry.sessions("/a").len(), 2);
        assert_eq!(registry.sessions("/b").len(), 1);
        assert!(registry.sessions("/c").is_empty());
        assert_eq!(registry.all_sessions().len(), 3);
        assert_eq!(registry.stats().paths, 2);
    }

    #[test]
    fn test_cleanup_orphaned() {
        let registry = SessionRegistry::new();
        let live = open_streams("/chat");
        let (dead_session, _rx) = Session::new("/chat");
        let dead = SessionStreams::new(dead_session);
        registry.register(live.clone());
        registry.register(dead.clone());

        assert_eq!(registry.cleanup_orphaned(), 1);
        assert!(dead.is_closed());
        assert!(!live.is_closed());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_requests_close() {
        let registry = SessionRegistry::new();
        let (session, rx) = Session::new("/chat");
        session.transition(SessionState::Connecting, SessionState::Active);
        let streams = SessionStreams::new(session);
        registry.register(streams.clone());

        assert_eq!(registry.shutdown(&CloseStatus::going_away("shutdown")), 1);
        let status = rx.await.unwrap();
        assert_eq!(status.code, 1001);
        assert!(!streams.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_unreachable_sessions() {
        let registry = SessionRegistry::new();
        let streams = open_streams("/chat");
        registry.register(streams.clone());

        registry.shutdown(&CloseStatus::going_away("shutdown"));
        assert!(streams.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_registration() {
        let registry = SessionRegistry::new();
        let mut tasks = Vec::new();
        for i in 0..32 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move {
                let path = if i % 2 == 0 { "/even" } else { "/odd" };
                let streams = open_streams(path);
                let id = streams.session_id();
                registry.register(streams);
                tokio::task::yield_now().await;
                if i % 4 == 0 {
                    registry.unregister(path, id);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(registry.len(), 24);
        assert_eq!(registry.all_sessions().len(), 24);
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_sweeps_and_stops() {
        let registry = SessionRegistry::new();
        let limiters = RateLimiterService::new();
        let (dead_session, _rx) = Session::new("/chat");
        registry.register(SessionStreams::new(dead_session));

        let config = RegistryConfig {
            cleanup_interval_secs: 1,
            cleanup_initial_delay_secs: 1,
            limiter_idle_ttl_secs: 1,
        };
        let cancel = CancellationToken::new();
        let handle = registry.spawn_maintenance(&config, limiters, cancel.clone());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(registry.is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
