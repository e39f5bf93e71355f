//! Command context, envelope and in-flight message types.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::correlation::{Trigger, assign};
use crate::event::RecordedEvent;

/// Cross-cutting metadata passed alongside a command.
///
/// Carries audit trail and causal IDs without polluting the `Command` or
/// `DomainEvent` types. Leaving both IDs unset starts a new workflow.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::CommandContext;
/// use serde_json::json;
/// use uuid::Uuid;
///
/// let correlation = Uuid::new_v4();
/// let ctx = CommandContext::default()
///     .with_actor("user-42")
///     .with_correlation_id(correlation)
///     .with_metadata("source", json!("api"));
///
/// assert_eq!(ctx.actor.as_deref(), Some("user-42"));
/// assert_eq!(ctx.correlation_id, Some(correlation));
/// assert_eq!(ctx.metadata["source"], "api");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandContext {
    /// Identity of the actor issuing the command (e.g. a user ID).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID of the workflow to join.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// ID of the message that caused this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    /// Initial extensions handed to the middleware chain and stamped on the
    /// resulting events.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl CommandContext {
    /// A context for a command issued in reaction to `event`.
    ///
    /// The command joins the event's workflow and names the event as its cause.
    pub fn caused_by(event: &RecordedEvent) -> Self {
        Self::default().with_cause(event)
    }

    /// Replace the causal IDs with those derived from `event`, keeping the
    /// actor and metadata.
    pub fn with_cause(mut self, event: &RecordedEvent) -> Self {
        let ids = assign(Trigger::FromEvent(event));
        self.correlation_id = Some(ids.correlation_id);
        self.causation_id = ids.causation_id;
        self
    }

    /// Set the actor identity.
    ///
    /// # Arguments
    ///
    /// * `actor` - Any value convertible to `String` identifying who issued
    ///   the command (e.g. a user ID or service name).
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Join an existing workflow.
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Record the message that caused this command.
    pub fn with_causation_id(mut self, id: Uuid) -> Self {
        self.causation_id = Some(id);
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The correlation trigger for a command dispatched with this context.
    pub(crate) fn trigger(&self) -> Trigger<'_> {
        if self.correlation_id.is_none() && self.causation_id.is_none() {
            Trigger::None
        } else {
            Trigger::Explicit {
                correlation_id: self.correlation_id,
                causation_id: self.causation_id,
            }
        }
    }
}

/// A type-erased command addressed to an aggregate type.
///
/// Produced by process managers when reacting to events. The `command` field
/// is a `serde_json::Value` because the process manager does not know the
/// concrete command type of the target aggregate at compile time. The
/// dispatcher deserializes it into the registered `A::Command` at runtime
/// and derives the target instance from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Target aggregate type name (must match `Aggregate::AGGREGATE_TYPE`).
    pub aggregate_type: String,
    /// JSON-serialized command payload.
    pub command: Value,
    /// Cross-cutting metadata forwarded to the dispatcher.
    #[serde(default)]
    pub context: CommandContext,
}

impl CommandEnvelope {
    /// Wrap a typed command for aggregate `A`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized.
    pub fn new<A: Aggregate>(cmd: &A::Command, context: CommandContext) -> serde_json::Result<Self> {
        Ok(Self {
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            command: serde_json::to_value(cmd)?,
            context,
        })
    }

    /// Wrap a typed command for aggregate `A` with a default context.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the command cannot be serialized.
    pub fn to<A: Aggregate>(cmd: &A::Command) -> serde_json::Result<Self> {
        Self::new::<A>(cmd, CommandContext::default())
    }
}

/// A command in flight through the middleware chain.
///
/// Built by the dispatcher once IDs are assigned and the target instance is
/// known. Owned by exactly one dispatch; middleware may rewrite the payload
/// and add `extensions`, which are stamped on the resulting events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    /// Fresh UUID v4 for this dispatch.
    pub command_id: Uuid,
    /// Workflow this command belongs to.
    pub correlation_id: Uuid,
    /// Direct cause of this command, `None` for top-level commands.
    pub causation_id: Option<Uuid>,
    /// Target aggregate type.
    pub aggregate_type: String,
    /// Target aggregate instance.
    pub instance_id: String,
    /// The command's `"type"` tag, empty for untagged commands.
    pub command_type: String,
    /// JSON-serialized command.
    pub payload: Value,
    /// Actor identity, if provided.
    pub actor: Option<String>,
    /// Per-dispatch key/value bag shared by the middleware links.
    pub extensions: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Account, deposit};
    use serde_json::json;

    #[test]
    fn default_context_has_no_fields_set() {
        let ctx = CommandContext::default();
        assert_eq!(ctx.actor, None);
        assert_eq!(ctx.correlation_id, None);
        assert_eq!(ctx.causation_id, None);
        assert!(ctx.metadata.is_empty());
    }

    #[test]
    fn default_context_triggers_new_workflow() {
        assert!(matches!(CommandContext::default().trigger(), Trigger::None));
    }

    #[test]
    fn context_with_either_id_is_explicit() {
        let id = Uuid::new_v4();
        let ctx = CommandContext::default().with_causation_id(id);
        assert!(matches!(
            ctx.trigger(),
            Trigger::Explicit {
                correlation_id: None,
                causation_id: Some(c)
            } if c == id
        ));
    }

    #[test]
    fn builder_chaining() {
        let corr = Uuid::new_v4();
        let ctx = CommandContext::default()
            .with_actor("admin")
            .with_correlation_id(corr)
            .with_metadata("key", json!("value"));

        assert_eq!(ctx.actor.as_deref(), Some("admin"));
        assert_eq!(ctx.correlation_id, Some(corr));
        assert_eq!(ctx.metadata["key"], "value");
    }

    #[test]
    fn envelope_wraps_typed_command() {
        let envelope = CommandEnvelope::to::<Account>(&deposit("a-1", 5)).unwrap();
        assert_eq!(envelope.aggregate_type, "account");
        assert_eq!(envelope.command["type"], "DepositMoney");
        assert_eq!(envelope.command["data"]["amount"], 5);
    }

    #[test]
    fn envelope_serde_roundtrip_defaults_context() {
        let json = json!({
            "aggregate_type": "account",
            "command": {"type": "DepositMoney"},
        });
        let envelope: CommandEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.context, CommandContext::default());
    }
}
