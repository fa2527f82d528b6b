//! The `Event`: an immutable record of something that happened within a run.

use crate::event_type::EventType;
use chrono::{DateTime, Utc};
use mentatlab_core::{EventId, RunId};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What a caller supplies to `AppendEvent`; the store assigns `id` and
/// normalizes `timestamp` for monotonicity, turning this into an [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    /// The node this event concerns, if any (scheduler- and
    /// run-level events, like `stream_end`, have none).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// What kind of thing happened.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Opaque, JSON-serializable payload. Its shape is determined by
    /// `event_type`.
    pub data: JsonValue,
}

impl EventInput {
    /// Creates an input with no node association.
    #[must_use]
    pub fn new(event_type: EventType, data: JsonValue) -> Self {
        Self {
            node_id: None,
            event_type,
            data,
        }
    }

    /// Creates an input scoped to a single node.
    #[must_use]
    pub fn for_node(node_id: impl Into<String>, event_type: EventType, data: JsonValue) -> Self {
        Self {
            node_id: Some(node_id.into()),
            event_type,
            data,
        }
    }
}

/// An immutable, persisted record of something that happened within a run.
///
/// Append-only: never mutated after construction. `id` is monotonically
/// increasing per run and never reused (see [`mentatlab_core::EventId`]);
/// total order within a run, no cross-run ordering guarantee. `timestamp`
/// is advisory for consumers — the authoritative order is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotonic, lexicographically-sortable identifier, unique within the
    /// run.
    pub id: EventId,
    /// The run this event belongs to.
    pub run_id: RunId,
    /// The node this event concerns, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// What kind of thing happened.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Wall-clock time of append, UTC. Monotonic per run by construction.
    pub timestamp: DateTime<Utc>,
    /// Opaque, JSON-serializable payload.
    pub data: JsonValue,
}

impl Event {
    /// Constructs an event. Callers outside a run store adapter should not
    /// call this directly for events destined for persistence — the store
    /// is responsible for assigning `id` and normalizing `timestamp`; this
    /// constructor exists for adapters and for synthetic (never-persisted)
    /// events like `hello`.
    #[must_use]
    pub fn new(
        id: EventId,
        run_id: RunId,
        node_id: Option<String>,
        event_type: EventType,
        timestamp: DateTime<Utc>,
        data: JsonValue,
    ) -> Self {
        Self {
            id,
            run_id,
            node_id,
            event_type,
            timestamp,
            data,
        }
    }

    /// The synthetic `hello` event emitted as the first byte of every SSE
    /// stream. Per the SSE contract, its id is the literal string `"0"` and
    /// its data is empty; it is never stored.
    #[must_use]
    pub fn hello(run_id: RunId, now: DateTime<Utc>) -> Self {
        Self {
            id: EventId::zero(),
            run_id,
            node_id: None,
            event_type: EventType::Hello,
            timestamp: now,
            data: JsonValue::Null,
        }
    }

    /// Renders this event in SSE wire framing:
    /// `id: <id>\nevent: <type>\ndata: <json>\n\n`.
    ///
    /// # Panics
    ///
    /// Panics if `data` cannot be serialized to JSON, which cannot happen
    /// for a `serde_json::Value`.
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        let data = serde_json::to_string(&self.data).expect("JsonValue always serializes");
        format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.id,
            self.event_type.as_str(),
            data
        )
    }

    /// Serializes this event to JSON bytes for persistence.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes a persisted event from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if deserialization fails.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Renders the SSE heartbeat comment line sent every `heartbeatInterval`.
#[must_use]
pub fn heartbeat_frame() -> &'static str {
    ": heartbeat\n\n"
}
