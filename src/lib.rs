//! Command dispatch and process manager runtime for event-sourced aggregates.
//!
//! Commands enter through a [`Dispatcher`], pass a [`Middleware`] chain, and
//! are decided against aggregate state rebuilt from an [`EventStore`].
//! Appends use optimistic concurrency and are retried on conflict. Every
//! command and event carries a correlation ID naming its workflow and a
//! causation ID naming its direct cause.
//!
//! A [`ProcessManagerRuntime`] subscribes to the store and drives
//! [`ProcessManager`]s, which turn events into further commands with
//! at-least-once delivery, per-instance dedup and compare-and-swap
//! checkpoints.

mod aggregate;
pub use aggregate::{Aggregate, fold};
mod checkpoint;
mod command;
pub mod correlation;
mod dispatcher;
mod error;
mod event;
mod execution;
mod middleware;
mod observer;
mod process_manager;
mod runtime;
mod snapshot;
mod store;

pub use checkpoint::{
    CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, InstanceRecord, InstanceStatus,
    MAX_TRACKED_IDS, PendingReaction,
};
pub use command::{CommandContext, CommandEnvelope, CommandMessage};
pub use dispatcher::{DispatchReceipt, Dispatcher, DispatcherBuilder};
pub use error::{BoxError, CheckpointError, DispatchError, ProcessError, StoreError};
pub use event::{EventMetadata, ProposedEvent, RecordedEvent, encode_domain_event, stream_name};
pub use execution::{DEFAULT_MAX_RETRIES, LoadedAggregate, load_aggregate};
pub use middleware::{DispatchResult, Middleware, Next, TracingMiddleware};
pub use observer::{NoopObserver, Observer};
pub use process_manager::{
    DeadLetter, EventOutcome, ProcessManager, ProcessManagerReport, dead_letter_path,
    read_dead_letters,
};
pub use runtime::{
    ProcessManagerRuntime, ProcessManagerRuntimeBuilder, RuntimeConfig, RuntimeHandle,
    RuntimeReport,
};
pub use snapshot::{Snapshot, SnapshotPolicy, load_snapshot, save_snapshot, snapshot_path};
pub use store::{
    AppendResult, BackoffConfig, EventStore, ExpectedVersion, InMemoryEventStore,
    RetryingEventStore, Selector, Subscription, SubscriptionMessage,
};
