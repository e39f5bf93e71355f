//! Process manager runtime: subscription loops, cursors and failure isolation.
//!
//! Each registered process manager reads its own subscription, starting
//! after its saved cursor. An event that fails blocks only the instance it
//! belongs to: later events for that instance are held back, other
//! instances carry on, and the cursor never moves past the lowest
//! unacknowledged position. Redelivery after a restart or retry is absorbed
//! by per-instance dedup.
//!
//! Two ways to drive it:
//!
//! - [`run_once`](ProcessManagerRuntime::run_once) reads every process
//!   manager up to the end of the log and returns a report. Good for tests
//!   and batch jobs.
//! - [`start`](ProcessManagerRuntime::start) spawns one live task per
//!   process manager and returns a [`RuntimeHandle`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::Instrument;

use crate::checkpoint::CheckpointStore;
use crate::dispatcher::Dispatcher;
use crate::error::ProcessError;
use crate::event::RecordedEvent;
use crate::observer::Observer;
use crate::process_manager::{
    EventOutcome, EventReactor, ProcessManager, ProcessManagerReport, ProcessManagerRunner,
    ReactorEnv,
};
use crate::store::{EventStore, SubscriptionMessage};

/// Configuration for the process manager runtime.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_dispatch::RuntimeConfig;
///
/// let config = RuntimeConfig {
///     checkpoint_interval: Duration::from_secs(10),
///     ..RuntimeConfig::default()
/// };
/// assert_eq!(config.checkpoint_interval, Duration::from_secs(10));
/// assert_eq!(config.reconnect_base_delay, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How often live tasks flush their cursor.
    ///
    /// Cursors are also saved on shutdown, on reconnect and at the end of
    /// every [`run_once`](ProcessManagerRuntime::run_once) pass.
    ///
    /// Default: 5 seconds.
    pub checkpoint_interval: Duration,

    /// Base delay for exponential backoff when a subscription fails or ends.
    ///
    /// Doubles after each consecutive failure up to
    /// [`reconnect_max_delay`](RuntimeConfig::reconnect_max_delay). A
    /// `CaughtUp` marker resets it.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Maximum delay between reconnection attempts.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,

    /// How long a live task waits after an instance failure before
    /// re-reading from its cursor.
    ///
    /// Default: 5 seconds.
    pub retry_delay: Duration,

    /// Directory for dead-letter logs. Terminal command failures are only
    /// logged when unset.
    ///
    /// Default: `None`.
    pub dead_letter_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(5),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            dead_letter_dir: None,
        }
    }
}

/// Per-process-manager reports from one [`run_once`](ProcessManagerRuntime::run_once) pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeReport {
    /// Reports keyed by process manager name.
    pub process_managers: BTreeMap<&'static str, ProcessManagerReport>,
}

impl RuntimeReport {
    /// The report for one process manager.
    pub fn get(&self, name: &str) -> Option<&ProcessManagerReport> {
        self.process_managers.get(name)
    }

    /// Counts summed over every process manager.
    pub fn total(&self) -> ProcessManagerReport {
        let mut total = ProcessManagerReport::default();
        for report in self.process_managers.values() {
            total.merge(report);
        }
        total
    }
}

struct Shared {
    dispatcher: Dispatcher,
    checkpoints: Arc<dyn CheckpointStore>,
    observer: Arc<dyn Observer>,
    config: RuntimeConfig,
}

impl Shared {
    fn env(&self) -> ReactorEnv<'_> {
        ReactorEnv {
            dispatcher: &self.dispatcher,
            checkpoints: self.checkpoints.as_ref(),
            dead_letter_dir: self.config.dead_letter_dir.as_deref(),
        }
    }
}

/// Progress through one subscription.
struct Pass {
    /// Position of the last event delivered.
    last_seen: u64,
    /// Blocked instances and the position of their first failed event.
    blocked: HashMap<String, u64>,
}

impl Pass {
    fn new(cursor: u64) -> Self {
        Self {
            last_seen: cursor,
            blocked: HashMap::new(),
        }
    }

    /// Everything at or below this position is acknowledged.
    fn ack_position(&self) -> u64 {
        match self.blocked.values().min() {
            Some(&first_failed) => first_failed - 1,
            None => self.last_seen,
        }
    }

    /// Process one delivered event and fold the result into `report`.
    async fn process(
        &mut self,
        reactor: &dyn EventReactor,
        shared: &Shared,
        event: RecordedEvent,
        report: &mut ProcessManagerReport,
    ) {
        self.last_seen = event.global_position;
        report.delivered += 1;

        let outcome = match reactor.instance_key(&event) {
            None => Ok(EventOutcome::Skipped),
            Some(key) if self.blocked.contains_key(&key) => {
                tracing::debug!(
                    pm_name = reactor.name(),
                    key = %key,
                    position = event.global_position,
                    "instance blocked, deferring event"
                );
                report.deferred += 1;
                return;
            }
            Some(key) => {
                let span = tracing::debug_span!(
                    "pm_event",
                    pm_name = reactor.name(),
                    key = %key,
                    global_position = event.global_position,
                    event_id = %event.event_id,
                );
                match reactor
                    .handle_event(&shared.env(), &key, &event)
                    .instrument(span)
                    .await
                {
                    Ok(outcome) => Ok(outcome),
                    Err(e) => Err((key, e)),
                }
            }
        };

        match outcome {
            Ok(outcome) => {
                shared.observer.before_acknowledge(reactor.name(), &event);
                report.record(outcome);
            }
            Err((key, e)) => {
                tracing::error!(
                    pm_name = reactor.name(),
                    key = %key,
                    event_id = %event.event_id,
                    position = event.global_position,
                    error = %e,
                    "event processing failed, blocking instance"
                );
                report.failed += 1;
                self.blocked.insert(key, event.global_position);
            }
        }
    }
}

/// Save `position` as the cursor if it moved past `saved`.
async fn flush_cursor(shared: &Shared, name: &str, saved: &mut u64, position: u64) {
    if position <= *saved {
        return;
    }
    match shared.checkpoints.save_cursor(name, position).await {
        Ok(()) => *saved = position,
        Err(e) => tracing::error!(pm_name = name, error = %e, "failed to save cursor"),
    }
}

/// Runs registered process managers against the dispatcher's event store.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use eventfold_dispatch::{
///     Dispatcher, InMemoryCheckpointStore, InMemoryEventStore, ProcessManagerRuntime,
///     RuntimeConfig,
/// };
///
/// # async fn demo() -> Result<(), eventfold_dispatch::ProcessError> {
/// let dispatcher = Dispatcher::builder(Arc::new(InMemoryEventStore::new())).build();
/// let runtime = ProcessManagerRuntime::builder(dispatcher, Arc::new(InMemoryCheckpointStore::new()))
///     // .process_manager::<TransferProcess>()
///     .config(RuntimeConfig::default())
///     .build();
///
/// let handle = runtime.start();
/// // ...
/// handle.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct ProcessManagerRuntime {
    shared: Arc<Shared>,
    reactors: Vec<Arc<dyn EventReactor>>,
}

impl std::fmt::Debug for ProcessManagerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.reactors.iter().map(|r| r.name()).collect();
        f.debug_struct("ProcessManagerRuntime")
            .field("process_managers", &names)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ProcessManagerRuntime {
    /// Start building a runtime that dispatches reaction commands through
    /// `dispatcher` and subscribes to its event store.
    pub fn builder(
        dispatcher: Dispatcher,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> ProcessManagerRuntimeBuilder {
        ProcessManagerRuntimeBuilder {
            observer: dispatcher.observer().clone(),
            dispatcher,
            checkpoints,
            reactors: Vec::new(),
            config: RuntimeConfig::default(),
        }
    }

    /// Read every process manager from its cursor up to the end of the log.
    ///
    /// Reaction commands are dispatched inline; the events they produce are
    /// picked up by the next pass. Each process manager's cursor is saved at
    /// the end of its pass.
    ///
    /// # Errors
    ///
    /// [`ProcessError::Store`] or [`ProcessError::Checkpoint`] if a
    /// subscription or cursor fails. Instance failures are not errors: they
    /// are counted in the report and retried on the next pass.
    pub async fn run_once(&self) -> Result<RuntimeReport, ProcessError> {
        let mut report = RuntimeReport::default();
        for reactor in &self.reactors {
            let span = tracing::info_span!("pm_pass", pm_name = reactor.name());
            let pm_report = run_pass(reactor.as_ref(), &self.shared)
                .instrument(span)
                .await?;
            report.process_managers.insert(reactor.name(), pm_report);
        }
        Ok(report)
    }

    /// Spawn one live task per process manager.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> RuntimeHandle {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let mut caught_up = Vec::with_capacity(self.reactors.len());
        let mut tasks = Vec::with_capacity(self.reactors.len());
        for reactor in &self.reactors {
            let flag = Arc::new(AtomicBool::new(false));
            caught_up.push(flag.clone());
            let span = tracing::info_span!("pm_live", pm_name = reactor.name());
            tasks.push(tokio::spawn(
                run_live_loop(reactor.clone(), self.shared.clone(), flag, shutdown_rx.clone())
                    .instrument(span),
            ));
        }
        tracing::info!(process_managers = self.reactors.len(), "process manager runtime started");
        RuntimeHandle {
            shutdown_tx,
            caught_up: Arc::new(caught_up),
            tasks: Arc::new(tokio::sync::Mutex::new(tasks)),
        }
    }
}

/// Builder for configuring and constructing a [`ProcessManagerRuntime`].
pub struct ProcessManagerRuntimeBuilder {
    dispatcher: Dispatcher,
    checkpoints: Arc<dyn CheckpointStore>,
    observer: Arc<dyn Observer>,
    reactors: Vec<Arc<dyn EventReactor>>,
    config: RuntimeConfig,
}

impl ProcessManagerRuntimeBuilder {
    /// Register process manager `PM`.
    ///
    /// Registering the same name twice keeps the last registration.
    pub fn process_manager<PM: ProcessManager>(mut self) -> Self {
        self.reactors.retain(|r| r.name() != PM::NAME);
        self.reactors
            .push(Arc::new(ProcessManagerRunner::<PM>::new()));
        self
    }

    /// Replace the runtime configuration.
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Install lifecycle hooks. Defaults to the dispatcher's observer.
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Finish configuration.
    pub fn build(self) -> ProcessManagerRuntime {
        tracing::debug!(
            process_managers = self.reactors.len(),
            "process manager runtime built"
        );
        ProcessManagerRuntime {
            shared: Arc::new(Shared {
                dispatcher: self.dispatcher,
                checkpoints: self.checkpoints,
                observer: self.observer,
                config: self.config,
            }),
            reactors: self.reactors,
        }
    }
}

/// One pull-based pass: read from the cursor until caught up.
async fn run_pass(
    reactor: &dyn EventReactor,
    shared: &Shared,
) -> Result<ProcessManagerReport, ProcessError> {
    let name = reactor.name();
    let cursor = shared.checkpoints.load_cursor(name).await?;
    let mut stream = shared
        .dispatcher
        .store()
        .subscribe(reactor.selector(), cursor)
        .await?;

    let mut pass = Pass::new(cursor);
    let mut report = ProcessManagerReport::default();
    let mut stream_error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(SubscriptionMessage::Event(event)) => {
                pass.process(reactor, shared, event, &mut report).await;
            }
            Ok(SubscriptionMessage::CaughtUp) => break,
            Err(e) => {
                stream_error = Some(e);
                break;
            }
        }
    }

    // Keep whatever progress was made, even if the stream failed.
    let position = pass.ack_position();
    if position > cursor {
        shared.checkpoints.save_cursor(name, position).await?;
    }
    if let Some(e) = stream_error {
        return Err(e.into());
    }
    tracing::debug!(
        pm_name = name,
        cursor = position,
        delivered = report.delivered,
        failed = report.failed,
        "process manager pass complete"
    );
    Ok(report)
}

/// Why a live subscription was left.
enum StreamOutcome {
    /// The stream ended without error.
    Ended,
    /// A blocked instance is due for another attempt.
    Retry,
    /// The subscription failed and should be reopened after a backoff.
    Error(ProcessError),
}

/// Run the live subscription loop for one process manager.
///
/// Holds a subscription open, processes events as they arrive, flushes the
/// cursor periodically, re-reads from the cursor when a blocked instance is
/// due for retry, reconnects with exponential backoff on errors, and saves
/// the cursor when signaled to stop.
async fn run_live_loop(
    reactor: Arc<dyn EventReactor>,
    shared: Arc<Shared>,
    caught_up: Arc<AtomicBool>,
    mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<(), ProcessError> {
    let name = reactor.name();
    let config = &shared.config;
    let mut backoff_delay = config.reconnect_base_delay;
    let mut checkpoint_interval = tokio::time::interval(config.checkpoint_interval);
    // The first tick completes immediately; consume it.
    checkpoint_interval.tick().await;

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }

        let subscribed = match shared.checkpoints.load_cursor(name).await {
            Ok(cursor) => shared
                .dispatcher
                .store()
                .subscribe(reactor.selector(), cursor)
                .await
                .map(|stream| (cursor, stream))
                .map_err(ProcessError::from),
            Err(e) => Err(e.into()),
        };
        let (cursor, mut stream) = match subscribed {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(pm_name = name, error = %e, "subscribe failed, will retry");
                tokio::select! {
                    _ = tokio::time::sleep(backoff_delay) => {}
                    _ = shutdown_rx.changed() => return Ok(()),
                }
                backoff_delay = (backoff_delay * 2).min(config.reconnect_max_delay);
                continue;
            }
        };
        tracing::info!(pm_name = name, from_position = cursor, "subscribed");

        let mut pass = Pass::new(cursor);
        let mut report = ProcessManagerReport::default();
        let mut saved = cursor;
        let mut retry_at: Option<Instant> = None;

        let outcome = loop {
            let retry_due = async move {
                match retry_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(SubscriptionMessage::Event(event))) => {
                        pass.process(reactor.as_ref(), &shared, event, &mut report).await;
                        if retry_at.is_none() && !pass.blocked.is_empty() {
                            retry_at = Some(Instant::now() + config.retry_delay);
                        }
                    }
                    Some(Ok(SubscriptionMessage::CaughtUp)) => {
                        if !caught_up.swap(true, Ordering::AcqRel) {
                            tracing::info!(pm_name = name, delivered = report.delivered, "caught up, now live");
                        }
                        backoff_delay = config.reconnect_base_delay;
                    }
                    Some(Err(e)) => break StreamOutcome::Error(e.into()),
                    None => break StreamOutcome::Ended,
                },
                _ = checkpoint_interval.tick() => {
                    flush_cursor(&shared, name, &mut saved, pass.ack_position()).await;
                }
                _ = retry_due => break StreamOutcome::Retry,
                _ = shutdown_rx.changed() => {
                    flush_cursor(&shared, name, &mut saved, pass.ack_position()).await;
                    tracing::info!(pm_name = name, cursor = saved, "live loop stopped");
                    return Ok(());
                }
            }
        };

        flush_cursor(&shared, name, &mut saved, pass.ack_position()).await;
        match outcome {
            StreamOutcome::Retry => {
                tracing::info!(
                    pm_name = name,
                    blocked = pass.blocked.len(),
                    from_position = saved,
                    "retrying blocked instances"
                );
                continue;
            }
            StreamOutcome::Ended => {
                tracing::warn!(pm_name = name, "subscription ended, will reconnect");
            }
            StreamOutcome::Error(e) => {
                tracing::error!(pm_name = name, error = %e, "subscription error, will reconnect");
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff_delay) => {}
            _ = shutdown_rx.changed() => return Ok(()),
        }
        backoff_delay = (backoff_delay * 2).min(config.reconnect_max_delay);
    }
}

/// Handle for controlling running process manager tasks.
///
/// Dropping every clone of the handle stops the tasks at their next event
/// boundary. Call [`shutdown`](RuntimeHandle::shutdown) to also wait for the
/// final cursor saves.
///
/// `Clone` is cheap: all fields are shared.
#[derive(Clone)]
pub struct RuntimeHandle {
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    caught_up: Arc<Vec<Arc<AtomicBool>>>,
    tasks: Arc<tokio::sync::Mutex<Vec<JoinHandle<Result<(), ProcessError>>>>>,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("caught_up", &self.is_caught_up())
            .finish_non_exhaustive()
    }
}

impl RuntimeHandle {
    /// Returns `true` once every process manager task has delivered all
    /// historical events at least once.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.iter().all(|flag| flag.load(Ordering::Acquire))
    }

    /// Signal every task to stop and wait for their final cursor saves.
    ///
    /// Calling `shutdown` more than once is safe: later calls return
    /// `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// The first task failure, or [`ProcessError::Stopped`] if a task
    /// panicked.
    pub async fn shutdown(&self) -> Result<(), ProcessError> {
        // Receivers may already be gone if every task has exited.
        let _ = self.shutdown_tx.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut first_error = None;
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(ProcessError::Stopped(e.to_string())),
            };
            if let Err(e) = result
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;

    use super::*;
    use crate::aggregate::test_fixtures::{Account, open};
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::command::CommandContext;
    use crate::process_manager::test_fixtures::{BONUS, WelcomeBonus};
    use crate::error::StoreError;
    use crate::event::ProposedEvent;
    use crate::store::{
        AppendResult, ExpectedVersion, InMemoryEventStore, Selector, Subscription,
    };

    struct Fixture {
        dispatcher: Dispatcher,
        checkpoints: Arc<InMemoryCheckpointStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dispatcher: Dispatcher::builder(Arc::new(InMemoryEventStore::new()))
                    .aggregate::<Account>()
                    .build(),
                checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            }
        }

        fn runtime(&self) -> ProcessManagerRuntimeBuilder {
            ProcessManagerRuntime::builder(self.dispatcher.clone(), self.checkpoints.clone())
                .process_manager::<WelcomeBonus>()
        }

        /// Open an account and return the global position of `AccountOpened`.
        async fn open(&self, id: &str) -> u64 {
            let receipt = self
                .dispatcher
                .dispatch::<Account>(open(id, 100), CommandContext::default())
                .await
                .unwrap();
            receipt.events[0].global_position
        }
    }

    #[derive(Default)]
    struct Acks(Mutex<Vec<(String, u64)>>);

    impl Observer for Acks {
        fn before_acknowledge(&self, process_manager: &str, event: &RecordedEvent) {
            self.0
                .lock()
                .unwrap()
                .push((process_manager.to_string(), event.global_position));
        }
    }

    #[test]
    fn pass_ack_position_stops_below_first_failure() {
        let mut pass = Pass::new(3);
        assert_eq!(pass.ack_position(), 3);
        pass.last_seen = 10;
        assert_eq!(pass.ack_position(), 10);
        pass.blocked.insert("a".into(), 7);
        pass.blocked.insert("b".into(), 5);
        assert_eq!(pass.ack_position(), 4);
    }

    #[tokio::test]
    async fn run_once_applies_and_saves_cursor() {
        let f = Fixture::new();
        f.open("a-1").await;
        f.open("a-2").await;
        let runtime = f.runtime().build();

        let report = runtime.run_once().await.unwrap();
        let bonus = report.get(WelcomeBonus::NAME).unwrap();
        assert_eq!(bonus.delivered, 2);
        assert_eq!(bonus.applied, 2);
        assert_eq!(bonus.dispatched, 2);
        assert_eq!(bonus.completed, 2);
        assert_eq!(f.checkpoints.load_cursor(WelcomeBonus::NAME).await.unwrap(), 2);

        let loaded = f.dispatcher.load::<Account>("a-1").await.unwrap();
        assert_eq!(loaded.state.balance, 100 + BONUS);

        // Bonus deposits are not subscribed to; nothing new to deliver.
        let again = runtime.run_once().await.unwrap();
        assert_eq!(again.total().delivered, 0);
    }

    #[tokio::test]
    async fn rewound_cursor_is_absorbed_by_dedup() {
        let f = Fixture::new();
        f.open("a-1").await;
        let runtime = f.runtime().build();
        runtime.run_once().await.unwrap();

        f.checkpoints.save_cursor(WelcomeBonus::NAME, 0).await.unwrap();
        let report = runtime.run_once().await.unwrap().total();

        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.dispatched, 0);
        let loaded = f.dispatcher.load::<Account>("a-1").await.unwrap();
        assert_eq!(loaded.state.balance, 100 + BONUS);
    }

    #[tokio::test]
    async fn observer_sees_every_acknowledged_event() {
        let f = Fixture::new();
        f.open("a-1").await;
        let acks = Arc::new(Acks::default());
        let runtime = f.runtime().observer(acks.clone()).build();

        runtime.run_once().await.unwrap();

        assert_eq!(
            *acks.0.lock().unwrap(),
            vec![(WelcomeBonus::NAME.to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn live_loop_reacts_and_saves_cursor_on_shutdown() {
        let f = Fixture::new();
        f.open("a-1").await;
        let runtime = f
            .runtime()
            .config(RuntimeConfig {
                checkpoint_interval: Duration::from_secs(3600),
                ..RuntimeConfig::default()
            })
            .build();

        let handle = runtime.start();
        let a2_opened = f.open("a-2").await;

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let a2 = f.dispatcher.load::<Account>("a-2").await.unwrap();
            if handle.is_caught_up() && a2.state.balance == 100 + BONUS {
                break;
            }
            assert!(Instant::now() < deadline, "live loop did not react in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(
            f.checkpoints.load_cursor(WelcomeBonus::NAME).await.unwrap(),
            a2_opened
        );
    }

    /// Every subscription ends immediately without an error.
    #[derive(Default)]
    struct EndingStore {
        inner: InMemoryEventStore,
        subscribes: AtomicU32,
    }

    #[async_trait]
    impl EventStore for EndingStore {
        async fn append(
            &self,
            stream_id: &str,
            expected: ExpectedVersion,
            events: Vec<ProposedEvent>,
        ) -> Result<AppendResult, StoreError> {
            self.inner.append(stream_id, expected, events).await
        }

        async fn read_stream(
            &self,
            stream_id: &str,
            from_version: u64,
        ) -> Result<Vec<RecordedEvent>, StoreError> {
            self.inner.read_stream(stream_id, from_version).await
        }

        async fn subscribe(
            &self,
            _selector: Selector,
            _after_position: u64,
        ) -> Result<Subscription, StoreError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(Box::pin(tokio_stream::empty()))
        }
    }

    #[tokio::test]
    async fn ended_subscription_reconnects_with_backoff() {
        let store = Arc::new(EndingStore::default());
        let dispatcher = Dispatcher::builder(store.clone()).aggregate::<Account>().build();
        let runtime = ProcessManagerRuntime::builder(dispatcher, Arc::new(InMemoryCheckpointStore::new()))
            .process_manager::<WelcomeBonus>()
            .config(RuntimeConfig {
                reconnect_base_delay: Duration::from_millis(50),
                reconnect_max_delay: Duration::from_millis(200),
                ..RuntimeConfig::default()
            })
            .build();

        let handle = runtime.start();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await.unwrap();

        // 50 + 100 + 200 ms of backoff fit at most four subscriptions.
        let subscribes = store.subscribes.load(Ordering::SeqCst);
        assert!(subscribes >= 1);
        assert!(subscribes <= 5, "resubscribed {subscribes} times");
    }

    #[test]
    fn duplicate_registration_keeps_one_runner() {
        let f = Fixture::new();
        let runtime = f.runtime().process_manager::<WelcomeBonus>().build();
        assert_eq!(runtime.reactors.len(), 1);
    }
}
