//! Event encoding, decoding, and the proposed/recorded event types.
//!
//! Domain events use adjacently tagged serde (`#[serde(tag = "type", content = "data")]`).
//! The `"type"` tag becomes the stored `event_type` and `"data"` becomes the
//! payload; decoding reassembles the tagged object.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::aggregate::Aggregate;

/// Build the stream identifier for an aggregate instance.
///
/// # Examples
///
/// ```
/// use eventfold_dispatch::stream_name;
/// assert_eq!(stream_name("account", "a-1"), "account/a-1");
/// ```
pub fn stream_name(aggregate_type: &str, instance_id: &str) -> String {
    format!("{aggregate_type}/{instance_id}")
}

/// Infrastructure metadata stamped on every event written by the dispatcher.
///
/// `aggregate_type` and `instance_id` make each event self-describing so
/// process managers can recover the aggregate identity without parsing the
/// stream id. `correlation_id` and `causation_id` carry the causal chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g., "account").
    pub aggregate_type: String,
    /// Aggregate instance identifier (e.g., "a-1").
    pub instance_id: String,
    /// Correlation ID shared by every message in one workflow.
    pub correlation_id: Uuid,
    /// ID of the command that produced this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Extensions collected by middleware while the command was in flight.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

/// An event that has been decided but not yet appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedEvent {
    /// Client-assigned UUID v4, stable across retries of the append.
    pub event_id: Uuid,
    /// Event type tag extracted from the adjacently tagged domain event.
    pub event_type: String,
    /// JSON payload (the `"data"` portion of the adjacently tagged enum).
    pub payload: Value,
    /// Infrastructure metadata to stamp on the event.
    pub metadata: EventMetadata,
}

/// An event as stored and delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Stream identifier, `"{aggregate_type}/{instance_id}"` for aggregates.
    pub stream_id: String,
    /// One-based version within the stream.
    pub stream_version: u64,
    /// One-based position in the global log.
    pub global_position: u64,
    /// Event type tag (e.g., "MoneyDeposited").
    pub event_type: String,
    /// Decoded JSON payload (the domain event data).
    pub payload: Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
    /// Store-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

impl RecordedEvent {
    /// Stamp a proposed event with its store-assigned positions.
    pub(crate) fn record(
        proposed: ProposedEvent,
        stream_id: &str,
        stream_version: u64,
        global_position: u64,
    ) -> Self {
        Self {
            event_id: proposed.event_id,
            stream_id: stream_id.to_string(),
            stream_version,
            global_position,
            event_type: proposed.event_type,
            payload: proposed.payload,
            metadata: proposed.metadata,
            recorded_at: now_millis(),
        }
    }

    /// Correlation ID of the workflow this event belongs to.
    pub fn correlation_id(&self) -> Uuid {
        self.metadata.correlation_id
    }

    /// ID of the command that produced this event, if any.
    pub fn causation_id(&self) -> Option<Uuid> {
        self.metadata.causation_id
    }

    /// Decode this event into an adjacently tagged domain event type.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event type is not a variant of `E`
    /// or the payload does not match the variant's fields.
    pub fn decode<E: DeserializeOwned>(&self) -> serde_json::Result<E> {
        let tagged = if self.payload.is_null() {
            // Fieldless variant: just `{"type": "VariantName"}`
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({
                "type": self.event_type,
                "data": self.payload,
            })
        };
        serde_json::from_value(tagged)
    }
}

/// Split an adjacently tagged value into its `"type"` tag and `"data"` payload.
///
/// # Errors
///
/// Returns `serde_json::Error` if the value is not an object with a string
/// `"type"` field.
pub(crate) fn split_tagged(value: Value) -> serde_json::Result<(String, Value)> {
    let Value::Object(mut obj) = value else {
        return Err(serde::ser::Error::custom(
            "adjacently tagged enum must serialize to a JSON object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(Value::String(tag)) => tag,
        _ => {
            return Err(serde::ser::Error::custom(
                "adjacently tagged enum must have a string 'type' field",
            ));
        }
    };
    // Data may be absent for fieldless variants.
    let payload = obj.remove("data").unwrap_or(Value::Null);
    Ok((event_type, payload))
}

/// Encode a domain event into a [`ProposedEvent`] with a fresh event ID.
///
/// # Arguments
///
/// * `event` - Reference to the domain event to encode.
/// * `metadata` - Metadata stamped on the event, already carrying the
///   correlation and causation IDs.
///
/// # Errors
///
/// Returns `serde_json::Error` if the domain event cannot be serialized or
/// is not an adjacently tagged enum.
pub fn encode_domain_event<A: Aggregate>(
    event: &A::DomainEvent,
    metadata: EventMetadata,
) -> serde_json::Result<ProposedEvent> {
    let (event_type, payload) = split_tagged(serde_json::to_value(event)?)?;
    Ok(ProposedEvent {
        event_id: Uuid::new_v4(),
        event_type,
        payload,
        metadata,
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
