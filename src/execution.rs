//! Aggregate execution context.
//!
//! One dispatch owns one in-memory aggregate instance for its duration:
//! state is rebuilt by folding the stream (optionally from a snapshot), the
//! command is decided against it, and the resulting events are appended with
//! the loaded version as the expected version. A version conflict discards
//! the attempt and starts over from a fresh load.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use crate::aggregate::{Aggregate, fold};
use crate::command::CommandMessage;
use crate::correlation::{Trigger, assign};
use crate::dispatcher::DispatchReceipt;
use crate::error::{DispatchError, StoreError};
use crate::event::{EventMetadata, ProposedEvent, RecordedEvent, encode_domain_event, stream_name};
use crate::snapshot::{Snapshot, SnapshotPolicy, load_snapshot, save_snapshot};
use crate::store::{EventStore, ExpectedVersion};

/// Additional attempts after a version conflict before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub(crate) struct ExecutionConfig {
    pub max_retries: u32,
    pub snapshots: Option<SnapshotPolicy>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            snapshots: None,
        }
    }
}

/// Aggregate state rebuilt from its stream.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedAggregate<A> {
    /// Folded state.
    pub state: A,
    /// Version of the last event folded, 0 for a new stream.
    pub version: u64,
}

/// Rebuild an aggregate instance from its stream.
///
/// With a snapshot policy, folding starts from the latest snapshot. A
/// snapshot is only trusted if the stream still has an event at the
/// snapshot's version; otherwise the stream is replayed from the start.
///
/// # Errors
///
/// - [`DispatchError::StoreUnavailable`] if reading the stream fails.
/// - [`DispatchError::HandlerFault`] if `apply` panics on a stored event.
pub async fn load_aggregate<A: Aggregate>(
    store: &dyn EventStore,
    instance_id: &str,
    snapshots: Option<&SnapshotPolicy>,
) -> Result<LoadedAggregate<A>, DispatchError> {
    let stream_id = stream_name(A::AGGREGATE_TYPE, instance_id);

    if let Some(policy) = snapshots
        && let Some(snap) = read_snapshot::<A>(policy, instance_id)
        && snap.stream_version > 0
    {
        let events = store
            .read_stream(&stream_id, snap.stream_version)
            .await
            .map_err(DispatchError::from_store)?;
        if let Some((first, rest)) = events.split_first()
            && first.stream_version == snap.stream_version
        {
            let (state, version) = replay(snap.state, snap.stream_version, rest)?;
            return Ok(LoadedAggregate { state, version });
        }
        tracing::warn!(
            stream_id = %stream_id,
            snapshot_version = snap.stream_version,
            "snapshot is ahead of the stream; replaying from the start"
        );
    }

    let events = store
        .read_stream(&stream_id, 1)
        .await
        .map_err(DispatchError::from_store)?;
    let (state, version) = replay(A::default(), 0, &events)?;
    Ok(LoadedAggregate { state, version })
}

/// [`fold`] with a panicking `apply` reported as a handler fault.
fn replay<A: Aggregate>(
    state: A,
    version: u64,
    events: &[RecordedEvent],
) -> Result<(A, u64), DispatchError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| fold(state, version, events))).map_err(|panic| {
        DispatchError::HandlerFault(format!(
            "{} apply panicked: {}",
            A::AGGREGATE_TYPE,
            panic_message(panic.as_ref())
        ))
    })
}

/// Decide and append one command against aggregate `A`, retrying on conflict.
///
/// The command is decoded from `msg.payload` on every attempt, so `handle`
/// always sees a fresh value and a freshly loaded state.
pub(crate) async fn execute<A: Aggregate>(
    store: &dyn EventStore,
    config: &ExecutionConfig,
    msg: &CommandMessage,
) -> Result<DispatchReceipt, DispatchError> {
    let mut attempts = 0u32;
    loop {
        attempts += 1;

        let cmd: A::Command = serde_json::from_value(msg.payload.clone()).map_err(|e| {
            DispatchError::HandlerFault(format!(
                "command does not decode for aggregate {}: {e}",
                A::AGGREGATE_TYPE
            ))
        })?;
        let instance_id = A::instance_id(&cmd);
        let stream_id = stream_name(A::AGGREGATE_TYPE, &instance_id);

        let loaded = load_aggregate::<A>(store, &instance_id, config.snapshots.as_ref()).await?;

        let domain_events = decide(&loaded.state, cmd)?;
        if domain_events.is_empty() {
            tracing::debug!(stream_id = %stream_id, "command produced no events");
            return Ok(DispatchReceipt::from_message(
                msg,
                &instance_id,
                stream_id,
                loaded.version,
                Vec::new(),
            ));
        }

        let proposed = stamp::<A>(&domain_events, msg, &instance_id)?;
        match store
            .append(&stream_id, ExpectedVersion::Exact(loaded.version), proposed)
            .await
        {
            Ok(appended) => {
                tracing::info!(
                    count = appended.events.len(),
                    new_version = appended.new_version,
                    "events appended"
                );
                if let Some(policy) = &config.snapshots
                    && policy.is_due(loaded.version, appended.new_version)
                {
                    let folded = std::panic::catch_unwind(AssertUnwindSafe(|| {
                        domain_events
                            .iter()
                            .fold(loaded.state, |state, event| state.apply(event))
                    }));
                    match folded {
                        Ok(state) => {
                            write_snapshot::<A>(policy, &instance_id, state, appended.new_version)
                        }
                        Err(panic) => tracing::warn!(
                            panic = panic_message(panic.as_ref()),
                            "apply panicked, snapshot skipped"
                        ),
                    }
                }
                return Ok(DispatchReceipt::from_message(
                    msg,
                    &instance_id,
                    stream_id,
                    appended.new_version,
                    appended.events,
                ));
            }
            Err(StoreError::VersionConflict { actual, .. }) if attempts <= config.max_retries => {
                tracing::warn!(
                    stream_id = %stream_id,
                    attempt = attempts,
                    expected = loaded.version,
                    actual,
                    "version conflict, retrying"
                );
            }
            Err(StoreError::VersionConflict { .. }) => {
                return Err(DispatchError::Conflict {
                    stream_id,
                    attempts,
                });
            }
            Err(StoreError::Unavailable(reason)) => {
                return Err(DispatchError::StoreUnavailable(reason));
            }
        }
    }
}

/// Run the pure decision function, turning a panic into a handler fault.
fn decide<A: Aggregate>(state: &A, cmd: A::Command) -> Result<Vec<A::DomainEvent>, DispatchError> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| state.handle(cmd))) {
        Ok(Ok(events)) => Ok(events),
        Ok(Err(e)) => Err(DispatchError::Validation(Box::new(e))),
        Err(panic) => Err(DispatchError::HandlerFault(format!(
            "{} handler panicked: {}",
            A::AGGREGATE_TYPE,
            panic_message(panic.as_ref())
        ))),
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Encode decided events, stamping the command's causal IDs on each.
fn stamp<A: Aggregate>(
    events: &[A::DomainEvent],
    msg: &CommandMessage,
    instance_id: &str,
) -> Result<Vec<ProposedEvent>, DispatchError> {
    let ids = assign(Trigger::FromCommand(msg));
    events
        .iter()
        .map(|event| {
            let metadata = EventMetadata {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                instance_id: instance_id.to_string(),
                correlation_id: ids.correlation_id,
                causation_id: ids.causation_id,
                actor: msg.actor.clone(),
                extensions: msg.extensions.clone(),
            };
            encode_domain_event::<A>(event, metadata)
                .map_err(|e| DispatchError::HandlerFault(format!("event encoding failed: {e}")))
        })
        .collect()
}

fn read_snapshot<A: Aggregate>(policy: &SnapshotPolicy, instance_id: &str) -> Option<Snapshot<A>> {
    match load_snapshot::<A>(&policy.dir, instance_id) {
        Ok(snap) => snap,
        Err(e) => {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                instance_id,
                error = %e,
                "failed to read snapshot; replaying stream"
            );
            None
        }
    }
}

fn write_snapshot<A: Aggregate>(policy: &SnapshotPolicy, instance_id: &str, state: A, version: u64) {
    let snapshot = Snapshot {
        state,
        stream_version: version,
    };
    if let Err(e) = save_snapshot::<A>(&policy.dir, instance_id, &snapshot) {
        tracing::warn!(
            aggregate_type = A::AGGREGATE_TYPE,
            instance_id,
            error = %e,
            "failed to save snapshot"
        );
    }
}
