//! Aggregate trait and event-folding reducer.

use serde::{Serialize, de::DeserializeOwned};

use crate::event::RecordedEvent;

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself serves as the aggregate's state.
/// State is built by folding domain events through the [`apply`](Aggregate::apply) method.
///
/// # Associated Types
///
/// - `Command`: the set of commands this aggregate can handle.
/// - `DomainEvent`: the set of events this aggregate can produce and apply.
/// - `Error`: command rejection / validation error.
///
/// # Contract
///
/// - [`instance_id`](Aggregate::instance_id) extracts the target instance
///   from a command. Every command names exactly one instance.
/// - [`handle`](Aggregate::handle) must be a pure decision function: no I/O, no side effects.
///   It validates a command against the current state and returns zero or more events.
///   It may run more than once for one dispatch when the stream is contended.
/// - [`apply`](Aggregate::apply) must be a pure, total function. It takes ownership of
///   the current state and a reference to a domain event, returning the next state.
pub trait Aggregate:
    Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Identifies this aggregate type (e.g. "account"). Used as the stream
    /// prefix and as the routing key for type-erased commands.
    const AGGREGATE_TYPE: &'static str;

    /// The set of commands this aggregate can handle.
    ///
    /// Commands cross the middleware chain as JSON, so they must round-trip
    /// through serde. Adjacently tagged enums expose their tag as the
    /// command type seen by middleware.
    type Command: Serialize + DeserializeOwned + Send + 'static;

    /// The set of events this aggregate can produce and apply.
    type DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone + 'static;

    /// Command rejection / validation error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// The instance a command targets.
    fn instance_id(cmd: &Self::Command) -> String;

    /// Validate a command against the current state and produce events.
    ///
    /// Returns `Ok(vec![])` if the command is a no-op.
    /// Returns `Err` to reject the command.
    fn handle(&self, cmd: Self::Command) -> Result<Vec<Self::DomainEvent>, Self::Error>;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::DomainEvent) -> Self;
}

/// Fold recorded events into aggregate state.
///
/// Events whose type the aggregate does not recognise are skipped for
/// forward compatibility, but still advance the version.
///
/// # Arguments
///
/// * `state` - The state to fold onto (default or snapshot).
/// * `version` - The stream version `state` reflects.
/// * `events` - Events in stream order, starting after `version`.
///
/// # Returns
///
/// The folded state and the version of the last event folded.
pub fn fold<A: Aggregate>(state: A, version: u64, events: &[RecordedEvent]) -> (A, u64) {
    events
        .iter()
        .fold((state, version), |(state, _), event| {
            let next = match event.decode::<A::DomainEvent>() {
                Ok(domain_event) => state.apply(&domain_event),
                Err(e) => {
                    tracing::debug!(
                        aggregate_type = A::AGGREGATE_TYPE,
                        event_type = %event.event_type,
                        error = %e,
                        "skipping unrecognised event"
                    );
                    state
                }
            };
            (next, event.stream_version)
        })
}
