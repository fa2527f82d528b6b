//! The admissible kinds of [`crate::Event`].

use serde::{Deserialize, Serialize};

/// What kind of thing happened.
///
/// Each variant determines the admissible shape of the event's `data`
/// payload; that shape is validated at emission sites (the scheduler, the
/// workload executor adapters, the SSE layer), not at the transport or
/// storage boundary — the store and the SSE fan-out treat `data` as opaque
/// JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A free-form log line emitted by a node or the scheduler itself.
    Log,
    /// A node-reported checkpoint, for resumable long-running work.
    Checkpoint,
    /// A node-reported numeric measurement.
    Metric,
    /// A scheduler-emitted node lifecycle transition (`started`,
    /// `succeeded`, `failed`, `cancelled`, `skipped`).
    NodeStatus,
    /// A node's final result payload.
    Result,
    /// Marks the start of a streamed sub-sequence of `stream_data` events.
    StreamStart,
    /// One chunk of streamed output.
    StreamData,
    /// Synthetic terminal event: the last event ever appended to a run,
    /// carrying the run's terminal status.
    StreamEnd,
    /// Synthetic event emitted once per SSE connection, before any
    /// backfill or live events; never persisted to the store.
    Hello,
}

impl EventType {
    /// Returns the wire name used in the SSE `event:` field and in JSON.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Checkpoint => "checkpoint",
            Self::Metric => "metric",
            Self::NodeStatus => "node_status",
            Self::Result => "result",
            Self::StreamStart => "stream_start",
            Self::StreamData => "stream_data",
            Self::StreamEnd => "stream_end",
            Self::Hello => "hello",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_match_spec() {
        assert_eq!(EventType::NodeStatus.as_str(), "node_status");
        assert_eq!(EventType::StreamEnd.as_str(), "stream_end");
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&EventType::NodeStatus).unwrap();
        assert_eq!(json, "\"node_status\"");
    }
}
