//! The flow-control pipeline.
//!
//! ```text
//!                    ┌──────────────┐
//!  transport ──────► │ receive loop │──rate limit──► inbound ──► handler
//!                    └──────────────┘                              │
//!                                                                  ▼
//!                    ┌──────────────┐                           outbound
//!  transport ◄────── │  send loop   │◄── backpressure queue ◄────┘
//!                    └──────┬───────┘   (fills only while the
//!                           ▲            transport is not ready)
//!                    heartbeat ticks (bypass the queue)
//! ```
//!
//! The receive loop gates every data frame through the session's rate
//! limiter and drops denied frames. The send loop hands handler output to
//! the transport whenever it has demand; output produced while it has none
//! waits in a bounded queue governed by the endpoint's backpressure
//! strategy. Heartbeat pings go ahead of application traffic.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, trace, warn};

use aether_telemetry::metrics as telemetry;

use crate::config::{BackpressureConfig, BackpressureStrategy, HeartbeatConfig};
use crate::error::{CloseCode, WsError, WsResult};
use crate::message::{Message, Payload};
use crate::rate_limit::RateLimiter;
use crate::session::CloseStatus;
use crate::streams::{OutboundSignal, SessionStreams, STREAM_CAPACITY};
use crate::transport::{BoxFrameSink, BoxFrameStream};

/// What a full queue does with the next item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Evict the oldest queued item and enqueue the new one.
    DropOldest,
    /// Discard the new item.
    DropLatest,
    /// Fail the queue.
    Fail,
}

/// Capacity and overflow behaviour resolved from a backpressure section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// Maximum queued items.
    pub capacity: usize,
    /// Behaviour once `capacity` is reached.
    pub overflow: Overflow,
    /// Strategy label for logs and metrics.
    pub label: &'static str,
}

impl QueuePolicy {
    /// Pass-through used when backpressure is off or unrecognized.
    ///
    /// Its bound is the stream pair's own buffer ([`STREAM_CAPACITY`]), not
    /// a strategy: a producer that gets that far ahead of a stalled client
    /// loses its newest messages, and the drops are counted under the
    /// `passthrough` label.
    pub const PASSTHROUGH: Self = Self {
        capacity: STREAM_CAPACITY,
        overflow: Overflow::DropLatest,
        label: "passthrough",
    };

    /// Resolve the policy for an endpoint.
    ///
    /// BUFFER keeps `buffer_size` items and drops the oldest when full.
    /// DROP_OLDEST and DROP_LATEST keep a single item. ERROR fails on the
    /// first item that cannot be queued. Capacities count messages held
    /// while the transport is not ready. A disabled section and an
    /// unrecognized strategy (which also logs a warning) resolve to
    /// [`PASSTHROUGH`](Self::PASSTHROUGH), bounded only by the stream-pair
    /// buffer.
    pub fn resolve(config: &BackpressureConfig, path: &str) -> Self {
        if !config.enabled {
            return Self::PASSTHROUGH;
        }
        match &config.strategy {
            BackpressureStrategy::Buffer => Self {
                capacity: config.buffer_size.max(1),
                overflow: Overflow::DropOldest,
                label: "buffer",
            },
            BackpressureStrategy::DropOldest => Self {
                capacity: 1,
                overflow: Overflow::DropOldest,
                label: "drop_oldest",
            },
            BackpressureStrategy::DropLatest => Self {
                capacity: 1,
                overflow: Overflow::DropLatest,
                label: "drop_latest",
            },
            BackpressureStrategy::Error => Self {
                capacity: 1,
                overflow: Overflow::Fail,
                label: "error",
            },
            BackpressureStrategy::Unrecognized(name) => {
                warn!(path, strategy = %name, "Unknown backpressure strategy, passing outbound stream through");
                Self::PASSTHROUGH
            }
        }
    }
}

/// Result of [`BackpressureQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The item was queued.
    Queued,
    /// The item was queued after evicting the oldest one.
    DroppedOldest,
    /// The item was discarded.
    DroppedNew,
    /// The queue failed; nothing more will be delivered.
    Overflowed,
    /// The queue already finished.
    Rejected,
}

impl PushOutcome {
    /// True if an item was lost.
    pub fn dropped(self) -> bool {
        matches!(self, Self::DroppedOldest | Self::DroppedNew)
    }
}

/// Item returned by [`BackpressureQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum QueueItem<T> {
    /// A regular item.
    Item(T),
    /// The final error response. Nothing follows it.
    Final(T),
    /// The producer completed and the queue is drained.
    Done,
    /// The queue overflowed under [`Overflow::Fail`].
    Overflowed,
}

#[derive(Debug)]
enum Terminal<T> {
    Complete,
    ErrorResponse(T),
    Overflow,
    Finished,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    terminal: Option<Terminal<T>>,
}

/// Bounded queue holding handler output while the transport is not ready.
#[derive(Debug)]
pub struct BackpressureQueue<T> {
    policy: QueuePolicy,
    state: Mutex<QueueState<T>>,
    notify: Notify,
}

impl<T> BackpressureQueue<T> {
    /// Empty queue with `policy`.
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(policy.capacity.min(STREAM_CAPACITY)),
                terminal: None,
            }),
            notify: Notify::new(),
        }
    }

    /// The policy in force.
    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    /// Offer an item.
    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return PushOutcome::Rejected;
            }
            if state.items.len() < self.policy.capacity {
                state.items.push_back(item);
                PushOutcome::Queued
            } else {
                match self.policy.overflow {
                    Overflow::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(item);
                        PushOutcome::DroppedOldest
                    }
                    Overflow::DropLatest => PushOutcome::DroppedNew,
                    Overflow::Fail => {
                        state.terminal = Some(Terminal::Overflow);
                        PushOutcome::Overflowed
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Mark the producer finished. Queued items are still delivered.
    pub fn complete(&self) {
        self.finish(Terminal::Complete);
    }

    /// Deliver `item` after everything already queued, then finish.
    pub fn finish_with(&self, item: T) {
        self.finish(Terminal::ErrorResponse(item));
    }

    fn finish(&self, terminal: Terminal<T>) {
        let mut state = self.state.lock();
        if state.terminal.is_none() {
            state.terminal = Some(terminal);
        }
        drop(state);
        self.notify.notify_one();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once nothing is queued and the queue has reached its end.
    pub fn is_settled(&self) -> bool {
        let state = self.state.lock();
        state.items.is_empty() && state.terminal.is_some()
    }

    /// Take the next item without waiting.
    pub fn try_pop(&self) -> Option<QueueItem<T>> {
        let mut state = self.state.lock();
        match state.terminal {
            Some(Terminal::Overflow) => return Some(QueueItem::Overflowed),
            Some(Terminal::Finished) => return Some(QueueItem::Done),
            _ => {}
        }
        if let Some(item) = state.items.pop_front() {
            return Some(QueueItem::Item(item));
        }
        match state.terminal.take() {
            Some(Terminal::ErrorResponse(item)) => {
                state.terminal = Some(Terminal::Finished);
                Some(QueueItem::Final(item))
            }
            Some(Terminal::Complete | Terminal::Finished) => {
                state.terminal = Some(Terminal::Finished);
                Some(QueueItem::Done)
            }
            Some(Terminal::Overflow) => {
                state.terminal = Some(Terminal::Overflow);
                Some(QueueItem::Overflowed)
            }
            None => None,
        }
    }

    /// Wait for the next item.
    pub async fn pop(&self) -> QueueItem<T> {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }
}

/// Last time any frame arrived from the client.
#[derive(Debug)]
pub(crate) struct Liveness {
    origin: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_seen_ms.store(ms, Ordering::Relaxed);
    }

    pub(crate) fn idle(&self) -> Duration {
        let last = self.origin + Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }
}

/// Periodic ping emission plus the liveness deadline.
pub(crate) struct Heartbeat {
    ticker: Interval,
    timeout: Duration,
}

impl Heartbeat {
    pub(crate) fn new(config: &HeartbeatConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let interval = config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(Self {
            ticker,
            timeout: config.timeout(),
        })
    }
}

async fn next_tick(heartbeat: &mut Option<Heartbeat>) -> Duration {
    match heartbeat {
        Some(hb) => {
            hb.ticker.tick().await;
            hb.timeout
        }
        None => std::future::pending().await,
    }
}

/// How the receive loop ended.
#[derive(Debug)]
pub(crate) enum ReceiveEnd {
    /// The client sent a Close frame.
    ClientClosed(CloseStatus),
    /// The stream ended without a Close frame.
    Disconnected,
    /// Reading failed.
    Failed(WsError),
}

/// Read frames until the client goes away, feeding data frames through
/// the limiter into the inbound channel.
pub(crate) async fn receive_loop(
    stream: &mut BoxFrameStream,
    streams: &SessionStreams,
    limiter: Option<&RateLimiter>,
    liveness: &Liveness,
) -> ReceiveEnd {
    let session_id = streams.session_id();
    let path = streams.session().path().to_owned();
    loop {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                warn!(session_id = %session_id, path = %path, error = %e, "Receive failed");
                return ReceiveEnd::Failed(e);
            }
            None => return ReceiveEnd::Disconnected,
        };
        liveness.touch();

        match msg {
            Message::Close(frame) => {
                let status = frame.map_or_else(
                    || CloseStatus::new(CloseCode::NoStatus, ""),
                    CloseStatus::from,
                );
                debug!(session_id = %session_id, code = status.code, "Client sent close");
                return ReceiveEnd::ClientClosed(status);
            }
            Message::Ping(_) | Message::Pong(_) => {
                trace!(session_id = %session_id, kind = msg.kind(), "Control frame");
            }
            Message::Text(_) | Message::Binary(_) => {
                if let Some(limiter) = limiter {
                    if !limiter.acquire().await {
                        warn!(
                            session_id = %session_id,
                            path = %path,
                            "Rate limit exceeded, dropping inbound message"
                        );
                        telemetry::record_rate_limited(&path);
                        continue;
                    }
                }
                telemetry::record_message_received(&path);
                if !streams.push_inbound(msg) {
                    trace!(session_id = %session_id, "Inbound frame had no subscriber");
                }
            }
        }
    }
}

/// How the send loop finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendEnd {
    /// The producer completed and everything queued was sent.
    Completed,
    /// The final error response was sent.
    Responded,
}

/// Move handler output to the transport and interleave heartbeat pings.
///
/// A payload is handed to the sink as soon as the sink reports demand
/// through `poll_ready`. Only output produced while the sink is not ready
/// waits in `queue`, so the backpressure strategy never fires against a
/// client that keeps up.
pub(crate) async fn send_loop(
    sink: &mut BoxFrameSink,
    mut rx: broadcast::Receiver<OutboundSignal>,
    queue: &BackpressureQueue<Payload>,
    mut heartbeat: Option<Heartbeat>,
    liveness: &Liveness,
    path: &str,
) -> WsResult<SendEnd> {
    let label = queue.policy().label;
    let mut producing = true;
    loop {
        if queue.is_settled() {
            return match queue.try_pop() {
                Some(QueueItem::Final(payload)) => {
                    send_payload(sink, payload, path).await?;
                    Ok(SendEnd::Responded)
                }
                Some(QueueItem::Overflowed) => Err(overflowed(queue)),
                _ => Ok(SendEnd::Completed),
            };
        }

        tokio::select! {
            biased;
            timeout = next_tick(&mut heartbeat) => {
                if liveness.idle() > timeout {
                    return Err(WsError::HeartbeatTimeout { timeout });
                }
                sink.send(Message::ping(Vec::new())).await?;
                telemetry::record_heartbeat_ping(path);
            }
            ready = poll_fn(|cx| sink.poll_ready_unpin(cx)), if !queue.is_empty() => {
                ready?;
                match queue.try_pop() {
                    Some(QueueItem::Item(payload)) => send_payload(sink, payload, path).await?,
                    Some(QueueItem::Overflowed) => return Err(overflowed(queue)),
                    _ => {}
                }
            }
            signal = rx.recv(), if producing => match signal {
                Ok(OutboundSignal::Next(payload)) => match queue.push(payload) {
                    PushOutcome::Queued => {}
                    PushOutcome::DroppedOldest | PushOutcome::DroppedNew => {
                        trace!(path, strategy = label, "Client not ready, dropped outbound message");
                        telemetry::record_backpressure_drop(path, label);
                    }
                    PushOutcome::Overflowed => return Err(overflowed(queue)),
                    PushOutcome::Rejected => producing = false,
                },
                Ok(OutboundSignal::ErrorResponse(payload)) => {
                    queue.finish_with(payload);
                    producing = false;
                }
                Ok(OutboundSignal::Complete) | Err(RecvError::Closed) => {
                    queue.complete();
                    producing = false;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(path, skipped, strategy = label, "Outbound producer outran the stream pair");
                    for _ in 0..skipped {
                        telemetry::record_backpressure_drop(path, label);
                    }
                }
            },
        }
    }
}

fn overflowed(queue: &BackpressureQueue<Payload>) -> WsError {
    WsError::BackpressureOverflow {
        capacity: queue.policy().capacity,
    }
}

async fn send_payload(sink: &mut BoxFrameSink, payload: Payload, path: &str) -> WsResult<()> {
    for frame in payload.into_frames().await? {
        sink.send(frame).await?;
        telemetry::record_message_sent(path);
    }
    Ok(())
}
