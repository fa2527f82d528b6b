//! SSE fan-out: turns a run's Run Store subscription into the exact wire
//! stream the HTTP layer writes to clients.

pub mod headers;
pub mod stream;

pub use headers::sse_headers;
pub use stream::{build_stream, Frame, RunNotFound, DEFAULT_HEARTBEAT_INTERVAL};
