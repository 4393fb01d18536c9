//! Per-path, per-identifier rate limiting.
//!
//! A path registers its quota shape once. Limiters are then created lazily
//! for every distinct identifier (session id, user name or client IP) the
//! first time a message from that identifier arrives.
//!
//! The limiter uses a cycle-based token bucket: time is split into cycles
//! of `refresh_period`, each cycle restores up to `limit_for_period`
//! permits, and a caller may reserve a future permit if it would become
//! available within the acquire timeout.
//!
//! ```text
//!  cycle 0           cycle 1           cycle 2
//!  |-----------------|-----------------|------
//!  ^ L permits       ^ refill to L     ^ refill to L
//!       acquire → permits - 1, or wait until next refill ≤ timeout
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{RateLimitConfig, RateLimitScope, TimeUnit};
use crate::error::{WsError, WsResult};
use crate::session::SessionContext;

/// Quota registered for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterShape {
    /// Permits restored every refresh period.
    pub limit_for_period: u32,
    /// Length of one cycle.
    pub refresh_period: Duration,
    /// Longest an acquire call may wait for a permit.
    pub timeout: Duration,
}

impl LimiterShape {
    /// Build a shape, rejecting a zero limit or a zero refresh period.
    pub fn new(limit_for_period: u32, refresh_period: Duration, timeout: Duration) -> WsResult<Self> {
        if limit_for_period == 0 {
            return Err(WsError::invalid_config("limit_for_period must be greater than zero"));
        }
        if refresh_period.is_zero() {
            return Err(WsError::invalid_config("refresh period must be greater than zero"));
        }
        Ok(Self {
            limit_for_period,
            refresh_period,
            timeout,
        })
    }
}

#[derive(Debug)]
struct LimiterState {
    active_cycle: u64,
    active_permissions: i64,
    last_used: Instant,
}

/// A token-bucket limiter for one identifier.
#[derive(Debug)]
pub struct RateLimiter {
    shape: LimiterShape,
    started: Instant,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a limiter with a full first cycle.
    pub fn new(shape: LimiterShape) -> Self {
        let now = Instant::now();
        Self {
            shape,
            started: now,
            state: Mutex::new(LimiterState {
                active_cycle: 0,
                active_permissions: i64::from(shape.limit_for_period),
                last_used: now,
            }),
        }
    }

    /// The quota this limiter enforces.
    pub fn shape(&self) -> LimiterShape {
        self.shape
    }

    /// Try to obtain one permit, waiting at most the configured timeout.
    ///
    /// Returns `false` when no permit can be had in time. A denied call
    /// reserves nothing and returns immediately.
    pub async fn acquire(&self) -> bool {
        match self.reserve() {
            Some(wait) if wait.is_zero() => true,
            Some(wait) => {
                tokio::time::sleep(wait).await;
                true
            }
            None => false,
        }
    }

    /// Permits currently available, after refilling elapsed cycles.
    /// Negative when future permits have been reserved.
    pub fn available_permissions(&self) -> i64 {
        let now = Instant::now();
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.active_permissions
    }

    fn reserve(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.last_used = now;
        let elapsed = self.elapsed_nanos(now);
        let current_cycle = self.refill(&mut state, now);

        let wait = self.nanos_to_wait(state.active_permissions, elapsed, current_cycle);
        if wait > duration_nanos(self.shape.timeout) {
            return None;
        }
        state.active_permissions -= 1;
        Some(Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX)))
    }

    fn refill(&self, state: &mut LimiterState, now: Instant) -> u64 {
        let period = self.period_nanos();
        let current_cycle = u64::try_from(self.elapsed_nanos(now) / period).unwrap_or(u64::MAX);
        if current_cycle != state.active_cycle {
            let limit = i64::from(self.shape.limit_for_period);
            let elapsed_cycles = i64::try_from(current_cycle - state.active_cycle).unwrap_or(i64::MAX);
            let accumulated = elapsed_cycles.saturating_mul(limit);
            state.active_permissions = state.active_permissions.saturating_add(accumulated).min(limit);
            state.active_cycle = current_cycle;
        }
        current_cycle
    }

    fn nanos_to_wait(&self, available: i64, elapsed: i64, current_cycle: u64) -> i64 {
        if available >= 1 {
            return 0;
        }
        let period = self.period_nanos();
        let limit = i64::from(self.shape.limit_for_period).max(1);
        let next_cycle_at = i64::try_from(current_cycle + 1)
            .unwrap_or(i64::MAX)
            .saturating_mul(period);
        let to_next_cycle = next_cycle_at - elapsed;
        let at_next_cycle = available + limit;
        let full_cycles = div_ceil(-(at_next_cycle - 1), limit);
        full_cycles.saturating_mul(period).saturating_add(to_next_cycle)
    }

    fn period_nanos(&self) -> i64 {
        duration_nanos(self.shape.refresh_period).max(1)
    }

    fn elapsed_nanos(&self, now: Instant) -> i64 {
        duration_nanos(now.saturating_duration_since(self.started))
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.state.lock().last_used)
    }
}

fn duration_nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

// Truncating division, so a negative numerator yields zero full cycles.
fn div_ceil(x: i64, y: i64) -> i64 {
    (x + y - 1) / y
}

/// Registry of quota shapes and lazily created limiters.
#[derive(Debug, Default)]
pub struct RateLimiterService {
    shapes: DashMap<String, LimiterShape>,
    limiters: DashMap<(String, String), Arc<RateLimiter>>,
}

impl RateLimiterService {
    /// Create an empty service.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Declare the quota for `path`.
    ///
    /// Registering the same shape again is a no-op. A different shape
    /// replaces the old one and drops the path's existing limiters.
    pub fn register(
        &self,
        path: &str,
        limit_for_period: u32,
        refresh_period: u64,
        time_unit: TimeUnit,
        timeout_ms: u64,
    ) -> WsResult<()> {
        let shape = LimiterShape::new(
            limit_for_period,
            time_unit.duration(refresh_period),
            Duration::from_millis(timeout_ms),
        )?;

        let previous = self.shapes.insert(path.to_owned(), shape);
        match previous {
            Some(old) if old == shape => {}
            Some(old) => {
                warn!(path, ?old, new = ?shape, "Rate limit shape changed, dropping existing limiters");
                self.limiters.retain(|(p, _), _| p != path);
            }
            None => debug!(path, limit = limit_for_period, "Rate limit registered"),
        }
        Ok(())
    }

    /// Register from an endpoint's rate limit section.
    pub fn register_config(&self, path: &str, config: &RateLimitConfig) -> WsResult<()> {
        self.register(
            path,
            config.limit_for_period,
            config.refresh_period,
            config.time_unit,
            config.timeout_ms,
        )
    }

    /// True if `path` has a registered shape.
    pub fn is_registered(&self, path: &str) -> bool {
        self.shapes.contains_key(path)
    }

    /// The limiter for `(path, identifier)`, created on first access.
    /// `None` if the path was never registered.
    pub fn get(&self, path: &str, identifier: &str) -> Option<Arc<RateLimiter>> {
        let shape = *self.shapes.get(path)?;
        let limiter = self
            .limiters
            .entry((path.to_owned(), identifier.to_owned()))
            .or_insert_with(|| Arc::new(RateLimiter::new(shape)));
        Some(Arc::clone(limiter.value()))
    }

    /// Forget the limiter for `(path, identifier)`.
    pub fn release(&self, path: &str, identifier: &str) -> bool {
        self.limiters
            .remove(&(path.to_owned(), identifier.to_owned()))
            .is_some()
    }

    /// Drop limiters unused for longer than `max_idle` that no session
    /// currently holds. Returns how many were evicted.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let before = self.limiters.len();
        self.limiters
            .retain(|_, limiter| Arc::strong_count(limiter) > 1 || limiter.idle_for(now) <= max_idle);
        let evicted = before.saturating_sub(self.limiters.len());
        if evicted > 0 {
            debug!(evicted, "Evicted idle rate limiters");
        }
        evicted
    }

    /// Number of live limiters.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// True if no limiters exist.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

/// The limiter key for a session under `scope`.
///
/// USER and IP fall back to the session id when the principal is
/// anonymous or the remote address is unknown.
pub fn resolve_identifier(scope: RateLimitScope, ctx: &SessionContext) -> String {
    match scope {
        RateLimitScope::Session => ctx.session_id().to_string(),
        RateLimitScope::User => ctx
            .principal()
            .name()
            .map_or_else(|| ctx.session_id().to_string(), str::to_owned),
        RateLimitScope::Ip => ctx
            .remote_addr()
            .map_or_else(|| ctx.session_id().to_string(), |addr| addr.ip().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{HandshakeInfo, Principal, Session};
    use aether_router::Params;

    fn shape(limit: u32, period_ms: u64, timeout_ms: u64) -> LimiterShape {
        LimiterShape::new(
            limit,
            Duration::from_millis(period_ms),
            Duration::from_millis(timeout_ms),
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_per_cycle() {
        let limiter = RateLimiter::new(shape(3, 1000, 0));
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert_eq!(limiter.available_permissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_after_period() {
        let limiter = RateLimiter::new(shape(2, 1000, 0));
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_limit() {
        let limiter = RateLimiter::new(shape(2, 100, 0));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.available_permissions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_within_timeout() {
        let limiter = RateLimiter::new(shape(1, 100, 150));
        assert!(limiter.acquire().await);

        let start = Instant::now();
        assert!(limiter.acquire().await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denial_reserves_nothing() {
        let limiter = RateLimiter::new(shape(1, 1000, 10));
        assert!(limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert!(!limiter.acquire().await);
        assert_eq!(limiter.available_permissions(), 0);
    }

    #[test]
    fn test_rejects_zero_shape() {
        assert!(LimiterShape::new(0, Duration::from_secs(1), Duration::ZERO).is_err());
        assert!(LimiterShape::new(1, Duration::ZERO, Duration::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_service_requires_registration() {
        let service = RateLimiterService::new();
        assert!(service.get("/chat", "a").is_none());

        service.register("/chat", 10, 1, TimeUnit::Seconds, 25).unwrap();
        let first = service.get("/chat", "a").unwrap();
        let again = service.get("/chat", "a").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(!Arc::ptr_eq(&first, &service.get("/chat", "b").unwrap()));
        assert_eq!(service.len(), 2);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let service = RateLimiterService::new();
        service.register("/chat", 10, 1, TimeUnit::Seconds, 25).unwrap();
        let limiter = service.get("/chat", "a").unwrap();
        service.register("/chat", 10, 1, TimeUnit::Seconds, 25).unwrap();
        assert!(Arc::ptr_eq(&limiter, &service.get("/chat", "a").unwrap()));

        service.register("/chat", 5, 1, TimeUnit::Seconds, 25).unwrap();
        let replaced = service.get("/chat", "a").unwrap();
        assert_eq!(replaced.shape().limit_for_period, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_skips_held_limiters() {
        let service = RateLimiterService::new();
        service.register("/chat", 10, 1, TimeUnit::Seconds, 25).unwrap();
        let held = service.get("/chat", "held").unwrap();
        drop(service.get("/chat", "idle").unwrap());

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(service.evict_idle(Duration::from_secs(60)), 1);
        assert_eq!(service.len(), 1);
        drop(held);
        assert!(service.release("/chat", "held"));
        assert!(service.is_empty());
    }

    #[test]
    fn test_resolve_identifier_fallbacks() {
        let (session, _rx) = Session::new("/chat");
        let id = session.id().to_string();
        let anonymous = SessionContext::new(session.clone(), HandshakeInfo::for_path("/chat"), Params::new());
        assert_eq!(resolve_identifier(RateLimitScope::Session, &anonymous), id);
        assert_eq!(resolve_identifier(RateLimitScope::User, &anonymous), id);
        assert_eq!(resolve_identifier(RateLimitScope::Ip, &anonymous), id);

        let known = SessionContext::new(
            session,
            HandshakeInfo::for_path("/chat")
                .principal(Principal::user("alice"))
                .remote_addr("10.0.0.7:5000".parse().unwrap()),
            Params::new(),
        );
        assert_eq!(resolve_identifier(RateLimitScope::User, &known), "alice");
        assert_eq!(resolve_identifier(RateLimitScope::Ip, &known), "10.0.0.7");
    }
}
