//! Process managers: cross-aggregate workflow coordination.
//!
//! A process manager reacts to events from one or more aggregate streams and
//! produces [`CommandEnvelope`]s that are dispatched to (potentially
//! different) aggregates. Each workflow is a separate *instance*, keyed by
//! [`identify`](ProcessManager::identify), with its own persisted state,
//! dedup set and lifecycle:
//!
//! ```text
//! Uninitialized --first matching event--> Active --is_complete--> Completed
//! ```
//!
//! Delivery is at-least-once. Redelivered events are absorbed by the
//! instance's high-water mark and recent applied-event IDs, and an event whose reaction commands were
//! only partly dispatched resumes after the last one sent.

use std::io;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, InstanceRecord, InstanceStatus, PendingReaction};
use crate::command::CommandEnvelope;
use crate::dispatcher::Dispatcher;
use crate::error::{CheckpointError, ProcessError};
use crate::event::RecordedEvent;
use crate::execution::panic_message;
use crate::store::Selector;

/// A cross-aggregate workflow coordinator that reacts to events by producing
/// commands.
///
/// The implementing type is the state of one instance.
///
/// # Contract
///
/// - [`identify`](ProcessManager::identify) is pure routing: it picks the
///   instance an event belongs to, or `None` to ignore the event. An event
///   whose `identify` panics is skipped.
/// - [`evolve`](ProcessManager::evolve) and [`react`](ProcessManager::react)
///   must be deterministic. After a crash, an event may be evolved and
///   reacted to again from the same persisted state, and commands already
///   dispatched for it are skipped by position.
/// - A panic in `evolve`, `react` or `is_complete` is reported as
///   [`ProcessError::Handler`] and blocks only that instance.
/// - Unknown event types should be ignored for forward compatibility.
pub trait ProcessManager: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable name. Keys the checkpoint records and the dead-letter log.
    const NAME: &'static str;

    /// Event types this process manager subscribes to.
    const EVENT_TYPES: &'static [&'static str];

    /// Error returned by `evolve` and `react`.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Which events the subscription delivers. Defaults to
    /// [`EVENT_TYPES`](ProcessManager::EVENT_TYPES).
    fn selector() -> Selector {
        Selector::EventTypes(Self::EVENT_TYPES.iter().map(|t| t.to_string()).collect())
    }

    /// The instance `event` belongs to, `None` if it is not relevant.
    fn identify(event: &RecordedEvent) -> Option<String>;

    /// Fold `event` into the instance state.
    ///
    /// # Errors
    ///
    /// An error leaves the event unacknowledged and the instance blocked
    /// until it is redelivered.
    fn evolve(self, event: &RecordedEvent) -> Result<Self, Self::Error>;

    /// Commands to dispatch in reaction to `event`, given the evolved state.
    ///
    /// Envelope contexts may carry an actor and metadata; their causal IDs
    /// are replaced with ones derived from `event`.
    fn react(&self, event: &RecordedEvent) -> Result<Vec<CommandEnvelope>, Self::Error>;

    /// Whether the workflow has finished. Completed instances acknowledge
    /// further events without applying them.
    fn is_complete(&self) -> bool {
        false
    }
}

/// What happened to one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    /// No instance claimed the event.
    Skipped,
    /// The owning instance had already completed.
    Ignored,
    /// The owning instance had already applied the event.
    Duplicate,
    /// The event was applied and its commands handled.
    Applied {
        /// Commands dispatched successfully.
        dispatched: usize,
        /// Commands that failed terminally and were dead-lettered.
        dead_lettered: usize,
        /// Whether the instance completed with this event.
        completed: bool,
    },
}

/// Counts from processing a batch of events for one process manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessManagerReport {
    /// Events received from the subscription.
    pub delivered: usize,
    /// Events applied to an instance.
    pub applied: usize,
    /// Events no instance claimed, or claimed by a completed instance.
    pub skipped: usize,
    /// Redelivered events an instance had already applied.
    pub duplicates: usize,
    /// Reaction commands dispatched successfully.
    pub dispatched: usize,
    /// Reaction commands written off as terminal failures.
    pub dead_lettered: usize,
    /// Instances that completed.
    pub completed: usize,
    /// Events left unacknowledged because processing failed.
    pub failed: usize,
    /// Events held back behind an earlier failure of the same instance.
    pub deferred: usize,
}

impl ProcessManagerReport {
    pub(crate) fn record(&mut self, outcome: EventOutcome) {
        match outcome {
            EventOutcome::Skipped | EventOutcome::Ignored => self.skipped += 1,
            EventOutcome::Duplicate => self.duplicates += 1,
            EventOutcome::Applied {
                dispatched,
                dead_lettered,
                completed,
            } => {
                self.applied += 1;
                self.dispatched += dispatched;
                self.dead_lettered += dead_lettered;
                self.completed += usize::from(completed);
            }
        }
    }

    /// Add `other`'s counts to this report.
    pub fn merge(&mut self, other: &ProcessManagerReport) {
        self.delivered += other.delivered;
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.duplicates += other.duplicates;
        self.dispatched += other.dispatched;
        self.dead_lettered += other.dead_lettered;
        self.completed += other.completed;
        self.failed += other.failed;
        self.deferred += other.deferred;
    }
}

// --- Dead-letter log ---

/// An entry in the dead-letter log, recording a reaction command that failed
/// terminally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// The process manager that emitted the command.
    pub process_manager: String,
    /// The event being reacted to.
    pub event_id: Uuid,
    /// Global position of that event.
    pub global_position: u64,
    /// The command envelope, with its causal IDs stamped.
    pub envelope: CommandEnvelope,
    /// Human-readable error message.
    pub error: String,
    /// Unix timestamp (seconds since epoch) of the failure.
    pub ts: u64,
}

/// Path of a process manager's dead-letter log under `dir`.
///
/// # Returns
///
/// `<dir>/<process_manager>/dead_letters.jsonl`
pub fn dead_letter_path(dir: &Path, process_manager: &str) -> PathBuf {
    dir.join(process_manager).join("dead_letters.jsonl")
}

/// Append a single dead-letter entry to the JSONL log at `path`.
///
/// Creates the file and its directory if they do not exist.
///
/// # Errors
///
/// Returns `io::Error` if file I/O fails.
pub(crate) fn append_dead_letter(path: &Path, entry: &DeadLetter) -> io::Result<()> {
    use std::io::Write;
    let json = serde_json::to_string(entry).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

/// Read every entry of a dead-letter log. A missing file reads as empty.
///
/// # Errors
///
/// Returns `io::Error` if the file cannot be read or a line is not a valid
/// entry.
pub fn read_dead_letters(path: &Path) -> io::Result<Vec<DeadLetter>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(io::Error::other))
        .collect()
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::UNIX_EPOCH
        .elapsed()
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// --- Runner ---

/// What a reactor needs from the runtime to process one event.
pub(crate) struct ReactorEnv<'a> {
    pub dispatcher: &'a Dispatcher,
    pub checkpoints: &'a dyn CheckpointStore,
    pub dead_letter_dir: Option<&'a Path>,
}

/// Trait object interface for process manager runners.
///
/// Lets the runtime drive heterogeneous process managers without knowing
/// each concrete `PM` type.
#[async_trait]
pub(crate) trait EventReactor: Send + Sync {
    fn name(&self) -> &'static str;

    fn selector(&self) -> Selector;

    /// The instance `event` belongs to, `None` to skip it.
    fn instance_key(&self, event: &RecordedEvent) -> Option<String>;

    /// Apply `event` to instance `key` and dispatch its reaction commands.
    ///
    /// # Errors
    ///
    /// Any error means `event` is not acknowledged.
    async fn handle_event(
        &self,
        env: &ReactorEnv<'_>,
        key: &str,
        event: &RecordedEvent,
    ) -> Result<EventOutcome, ProcessError>;
}

/// Drives process manager `PM` one event at a time.
pub(crate) struct ProcessManagerRunner<PM> {
    // PhantomData to carry the process manager type without storing a value.
    _marker: PhantomData<PM>,
}

impl<PM: ProcessManager> ProcessManagerRunner<PM> {
    pub(crate) fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }

    fn handler_error(source: PM::Error) -> ProcessError {
        ProcessError::Handler {
            process_manager: PM::NAME,
            source: Box::new(source),
        }
    }

    /// Run user code, turning a panic into a handler error so only the
    /// instance at fault is blocked.
    fn guarded<T>(f: impl FnOnce() -> Result<T, PM::Error>) -> Result<T, ProcessError> {
        match std::panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => result.map_err(Self::handler_error),
            Err(panic) => Err(ProcessError::Handler {
                process_manager: PM::NAME,
                source: format!("handler panicked: {}", panic_message(panic.as_ref())).into(),
            }),
        }
    }
}

#[async_trait]
impl<PM: ProcessManager> EventReactor for ProcessManagerRunner<PM> {
    fn name(&self) -> &'static str {
        PM::NAME
    }

    fn selector(&self) -> Selector {
        PM::selector()
    }

    fn instance_key(&self, event: &RecordedEvent) -> Option<String> {
        match std::panic::catch_unwind(AssertUnwindSafe(|| PM::identify(event))) {
            Ok(key) => key,
            Err(panic) => {
                tracing::error!(
                    pm_name = PM::NAME,
                    event_id = %event.event_id,
                    panic = panic_message(panic.as_ref()),
                    "identify panicked, skipping event"
                );
                None
            }
        }
    }

    async fn handle_event(
        &self,
        env: &ReactorEnv<'_>,
        key: &str,
        event: &RecordedEvent,
    ) -> Result<EventOutcome, ProcessError> {
        let mut record = match env.checkpoints.load_instance(PM::NAME, key).await? {
            Some(record) => record,
            None => InstanceRecord::new(
                serde_json::to_value(PM::default()).map_err(CheckpointError::from)?,
            ),
        };

        if record.status == InstanceStatus::Completed {
            tracing::debug!(pm_name = PM::NAME, key, event_id = %event.event_id, "instance completed, ignoring event");
            return Ok(EventOutcome::Ignored);
        }
        if record.is_duplicate(&event.event_id, event.global_position) {
            tracing::debug!(pm_name = PM::NAME, key, event_id = %event.event_id, "duplicate delivery");
            return Ok(EventOutcome::Duplicate);
        }

        let state: PM = serde_json::from_value(record.state.clone()).map_err(CheckpointError::from)?;
        let state = Self::guarded(|| state.evolve(event))?;
        let commands = Self::guarded(|| state.react(event))?;
        let completed = Self::guarded(|| Ok(state.is_complete()))?;

        // Resume after the commands a previous attempt already handled.
        let resume_at = match &record.pending {
            Some(pending) if pending.event_id == event.event_id => pending.completed,
            _ => 0,
        };

        let mut dispatched = 0;
        let mut dead_lettered = 0;
        for (index, envelope) in commands.into_iter().enumerate().skip(resume_at) {
            let envelope = CommandEnvelope {
                context: envelope.context.with_cause(event),
                ..envelope
            };
            match env.dispatcher.dispatch_envelope(envelope.clone()).await {
                Ok(receipt) => {
                    tracing::info!(
                        pm_name = PM::NAME,
                        key,
                        target_type = %receipt.aggregate_type,
                        target_id = %receipt.instance_id,
                        command_id = %receipt.command_id,
                        "dispatched reaction command"
                    );
                    record.record_emitted(receipt.command_id);
                    dispatched += 1;
                }
                Err(e) if e.is_terminal() => {
                    tracing::error!(
                        pm_name = PM::NAME,
                        key,
                        aggregate_type = %envelope.aggregate_type,
                        event_id = %event.event_id,
                        error = %e,
                        "reaction command failed terminally"
                    );
                    if let Some(dir) = env.dead_letter_dir {
                        let entry = DeadLetter {
                            process_manager: PM::NAME.to_string(),
                            event_id: event.event_id,
                            global_position: event.global_position,
                            envelope,
                            error: e.to_string(),
                            ts: unix_seconds(),
                        };
                        if let Err(dl_err) =
                            append_dead_letter(&dead_letter_path(dir, PM::NAME), &entry)
                        {
                            tracing::error!(pm_name = PM::NAME, error = %dl_err, "failed to write dead-letter entry");
                        }
                    }
                    dead_lettered += 1;
                }
                Err(e) => {
                    if index > resume_at {
                        // Remember the progress so a redelivery does not
                        // dispatch the same commands twice.
                        record.pending = Some(PendingReaction {
                            event_id: event.event_id,
                            completed: index,
                        });
                        if let Err(save_err) = env.checkpoints.save_instance(PM::NAME, key, &record).await {
                            tracing::error!(pm_name = PM::NAME, key, error = %save_err, "failed to save partial progress");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        record.state = serde_json::to_value(&state).map_err(CheckpointError::from)?;
        record.status = if completed {
            InstanceStatus::Completed
        } else {
            InstanceStatus::Active
        };
        record.record_applied(event.event_id, event.global_position);
        record.pending = None;
        env.checkpoints.save_instance(PM::NAME, key, &record).await?;

        if completed {
            tracing::info!(pm_name = PM::NAME, key, "process manager instance completed");
        }
        Ok(EventOutcome::Applied {
            dispatched,
            dead_lettered,
            completed,
        })
    }
}
