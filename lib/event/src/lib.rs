//! The `Event` value type: an immutable record of something that happened
//! within a run, plus its SSE-framing and JSON-persistence serializations.

pub mod event;
pub mod event_type;

pub use event::{Event, EventInput, heartbeat_frame};
pub use event_type::EventType;
