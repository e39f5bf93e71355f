//! Event store contract, an in-memory reference store, and a retrying adapter.
//!
//! The storage engine itself is an external collaborator. Everything in this
//! crate talks to it through [`EventStore`]: optimistic-concurrency appends to
//! per-stream logs, ordered stream reads, and restartable subscriptions over
//! the global log.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};

use crate::error::StoreError;
use crate::event::{ProposedEvent, RecordedEvent};

/// Expected stream version supplied with an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Append regardless of the stream's version.
    Any,
    /// The stream must not exist yet (version 0).
    NoStream,
    /// The stream's current version must equal this value.
    Exact(u64),
}

impl ExpectedVersion {
    /// Returns `true` if a stream at `current` satisfies this expectation.
    pub fn matches(self, current: u64) -> bool {
        match self {
            ExpectedVersion::Any => true,
            ExpectedVersion::NoStream => current == 0,
            ExpectedVersion::Exact(v) => current == v,
        }
    }
}

/// Which events a subscription delivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Every event in the global log.
    All,
    /// Events whose stream id starts with the prefix (e.g. `"account/"`).
    StreamPrefix(String),
    /// Events whose type is one of the listed types.
    EventTypes(Vec<String>),
}

impl Selector {
    /// Returns `true` if `event` is delivered by this selector.
    pub fn matches(&self, event: &RecordedEvent) -> bool {
        match self {
            Selector::All => true,
            Selector::StreamPrefix(prefix) => event.stream_id.starts_with(prefix.as_str()),
            Selector::EventTypes(types) => types.iter().any(|t| *t == event.event_type),
        }
    }
}

/// An item delivered by a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    /// An event, in global-position order.
    Event(RecordedEvent),
    /// Every historical event up to subscription time has been delivered.
    /// Events after this marker are live.
    CaughtUp,
}

/// A lazy, restartable stream of events.
///
/// Delivery is at-least-once: consumers checkpoint the last processed
/// global position and resubscribe from it after an error.
pub type Subscription =
    Pin<Box<dyn Stream<Item = Result<SubscriptionMessage, StoreError>> + Send + 'static>>;

/// Outcome of a successful append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendResult {
    /// The stream's version after the append.
    pub new_version: u64,
    /// The appended events with their assigned versions and positions.
    pub events: Vec<RecordedEvent>,
}

/// Append/read/subscribe contract over an append-only event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append `events` to `stream_id` if its version satisfies `expected`.
    ///
    /// An empty `events` list is a no-op that still checks `expected`.
    ///
    /// # Errors
    ///
    /// * [`StoreError::VersionConflict`] -- the stream moved on; nothing was written.
    /// * [`StoreError::Unavailable`] -- transient failure.
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendResult, StoreError>;

    /// Read a stream in version order starting at `from_version` (inclusive,
    /// one-based). A missing stream reads as empty.
    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Subscribe to events with a global position greater than `after_position`.
    ///
    /// Historical events are delivered first, followed by
    /// [`SubscriptionMessage::CaughtUp`], followed by live events.
    async fn subscribe(
        &self,
        selector: Selector,
        after_position: u64,
    ) -> Result<Subscription, StoreError>;
}

#[async_trait]
impl<S: EventStore + ?Sized> EventStore for Arc<S> {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendResult, StoreError> {
        (**self).append(stream_id, expected, events).await
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        (**self).read_stream(stream_id, from_version).await
    }

    async fn subscribe(
        &self,
        selector: Selector,
        after_position: u64,
    ) -> Result<Subscription, StoreError> {
        (**self).subscribe(selector, after_position).await
    }
}

// --- In-memory reference store ---

/// Default capacity of the live broadcast buffer.
const DEFAULT_LIVE_BUFFER: usize = 1024;

#[derive(Default)]
struct Log {
    events: Vec<RecordedEvent>,
    /// Indices into `events` per stream, in version order.
    streams: HashMap<String, Vec<usize>>,
}

/// An in-process [`EventStore`] backed by a vector.
///
/// `Clone` is cheap and clones share the same log. Live subscribers that
/// fall more than the buffer capacity behind receive
/// [`StoreError::Unavailable`] and must resubscribe from their checkpoint.
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
    live: broadcast::Sender<RecordedEvent>,
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("live_subscribers", &self.live.receiver_count())
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_live_buffer(DEFAULT_LIVE_BUFFER)
    }

    /// Create an empty store whose live subscribers may lag at most
    /// `capacity` events behind.
    pub fn with_live_buffer(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            log: Arc::new(RwLock::new(Log::default())),
            live,
        }
    }

    /// Snapshot of the whole global log.
    pub async fn all_events(&self) -> Vec<RecordedEvent> {
        self.log.read().await.events.clone()
    }

    /// Global position of the last event, 0 when empty.
    pub async fn last_position(&self) -> u64 {
        self.log.read().await.events.len() as u64
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendResult, StoreError> {
        let mut guard = self.log.write().await;
        let log = &mut *guard;

        let current = log.streams.get(stream_id).map_or(0, |v| v.len() as u64);
        if !expected.matches(current) {
            return Err(StoreError::VersionConflict {
                stream_id: stream_id.to_string(),
                expected,
                actual: current,
            });
        }

        let mut recorded = Vec::with_capacity(events.len());
        for (i, proposed) in events.into_iter().enumerate() {
            let index = log.events.len();
            let event = RecordedEvent::record(
                proposed,
                stream_id,
                current + i as u64 + 1,
                index as u64 + 1,
            );
            log.streams
                .entry(stream_id.to_string())
                .or_default()
                .push(index);
            log.events.push(event.clone());
            recorded.push(event);
        }

        // Broadcast while still holding the write lock so a concurrent
        // subscribe sees each event either in its history or live, never both
        // and never neither.
        for event in &recorded {
            // No receivers is fine.
            let _ = self.live.send(event.clone());
        }
        drop(guard);

        Ok(AppendResult {
            new_version: current + recorded.len() as u64,
            events: recorded,
        })
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let log = self.log.read().await;
        let Some(indices) = log.streams.get(stream_id) else {
            return Ok(Vec::new());
        };
        let skip = from_version.saturating_sub(1) as usize;
        Ok(indices
            .iter()
            .skip(skip)
            .map(|&i| log.events[i].clone())
            .collect())
    }

    async fn subscribe(
        &self,
        selector: Selector,
        after_position: u64,
    ) -> Result<Subscription, StoreError> {
        let log = self.log.read().await;
        let rx = self.live.subscribe();
        let history: Vec<RecordedEvent> = log
            .events
            .iter()
            .skip(after_position as usize)
            .filter(|e| selector.matches(e))
            .cloned()
            .collect();
        let floor = (log.events.len() as u64).max(after_position);
        drop(log);

        let catch_up = tokio_stream::iter(
            history
                .into_iter()
                .map(|e| Ok::<_, StoreError>(SubscriptionMessage::Event(e)))
                .chain(std::iter::once(Ok(SubscriptionMessage::CaughtUp))),
        );
        let live = BroadcastStream::new(rx).filter_map(move |item| match item {
            Ok(event) if event.global_position > floor && selector.matches(&event) => {
                Some(Ok(SubscriptionMessage::Event(event)))
            }
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(skipped)) => Some(Err(StoreError::Unavailable(
                format!("live subscriber lagged behind by {skipped} events"),
            ))),
        });

        Ok(Box::pin(catch_up.chain(live)))
    }
}

// --- Retrying adapter ---

/// Exponential backoff for [`RetryingEventStore`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_dispatch::BackoffConfig;
///
/// let config = BackoffConfig {
///     max_attempts: 10,
///     ..BackoffConfig::default()
/// };
/// assert_eq!(config.base_delay, Duration::from_millis(50));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Total attempts per operation, including the first.
    ///
    /// Default: 5.
    pub max_attempts: u32,
    /// Delay before the first retry; doubled after each further failure.
    ///
    /// Default: 50 milliseconds.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    ///
    /// Default: 2 seconds.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Wraps an [`EventStore`] and retries [`StoreError::Unavailable`] failures
/// with exponential backoff. Version conflicts pass straight through.
#[derive(Debug, Clone)]
pub struct RetryingEventStore<S> {
    inner: S,
    backoff: BackoffConfig,
}

impl<S: EventStore> RetryingEventStore<S> {
    /// Wrap `inner` with the default backoff.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            backoff: BackoffConfig::default(),
        }
    }

    /// Replace the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

async fn with_retry<T, F, Fut>(
    backoff: &BackoffConfig,
    op: &'static str,
    mut attempt_fn: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<T, StoreError>> + Send,
    T: Send,
{
    let mut delay = backoff.base_delay;
    let mut attempt = 1;
    loop {
        match attempt_fn().await {
            Err(StoreError::Unavailable(msg)) if attempt < backoff.max_attempts => {
                tracing::warn!(op, attempt, error = %msg, "event store unavailable, retrying");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(backoff.max_delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[async_trait]
impl<S: EventStore> EventStore for RetryingEventStore<S> {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<AppendResult, StoreError> {
        // Event IDs are fixed at proposal time, so every attempt carries the
        // same events.
        with_retry(&self.backoff, "append", || {
            self.inner.append(stream_id, expected, events.clone())
        })
        .await
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: u64,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        with_retry(&self.backoff, "read_stream", || {
            self.inner.read_stream(stream_id, from_version)
        })
        .await
    }

    async fn subscribe(
        &self,
        selector: Selector,
        after_position: u64,
    ) -> Result<Subscription, StoreError> {
        with_retry(&self.backoff, "subscribe", || {
            self.inner.subscribe(selector.clone(), after_position)
        })
        .await
    }
}
