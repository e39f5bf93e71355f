//! Correlation/causation assignment.
//!
//! Every command and event carries a `correlation_id` naming the workflow it
//! belongs to and a `causation_id` naming the message that directly caused it.
//! [`assign`] is the single place those IDs are derived.

use uuid::Uuid;

use crate::command::CommandMessage;
use crate::event::RecordedEvent;

/// The correlation and causation IDs for an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CausalIds {
    /// Workflow identifier, never null.
    pub correlation_id: Uuid,
    /// ID of the direct cause, `None` for top-level commands.
    pub causation_id: Option<Uuid>,
}

/// What caused the outgoing message.
#[derive(Debug, Clone, Copy)]
pub enum Trigger<'a> {
    /// A top-level command with no caller-supplied IDs.
    None,
    /// A top-level command with caller-supplied IDs.
    Explicit {
        /// Correlation ID to join; a fresh one is generated when absent.
        correlation_id: Option<Uuid>,
        /// Causation ID to record as-is.
        causation_id: Option<Uuid>,
    },
    /// Events produced by handling this command.
    FromCommand(&'a CommandMessage),
    /// A command issued in reaction to this event.
    FromEvent(&'a RecordedEvent),
}

/// Derive the causal IDs for a message caused by `trigger`.
///
/// Explicit inputs are returned unchanged; the only side effect is
/// generating a fresh UUID v4 when no correlation exists yet.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::correlation::{Trigger, assign};
/// use uuid::Uuid;
///
/// let top = assign(Trigger::None);
/// assert!(top.causation_id.is_none());
///
/// let joined = assign(Trigger::Explicit {
///     correlation_id: Some(top.correlation_id),
///     causation_id: None,
/// });
/// assert_eq!(joined.correlation_id, top.correlation_id);
/// ```
pub fn assign(trigger: Trigger<'_>) -> CausalIds {
    match trigger {
        Trigger::None => CausalIds {
            correlation_id: Uuid::new_v4(),
            causation_id: None,
        },
        Trigger::Explicit {
            correlation_id,
            causation_id,
        } => CausalIds {
            correlation_id: correlation_id.unwrap_or_else(Uuid::new_v4),
            causation_id,
        },
        Trigger::FromCommand(cmd) => CausalIds {
            correlation_id: cmd.correlation_id,
            causation_id: Some(cmd.command_id),
        },
        Trigger::FromEvent(event) => CausalIds {
            correlation_id: event.correlation_id(),
            causation_id: Some(event.event_id),
        },
    }
}
