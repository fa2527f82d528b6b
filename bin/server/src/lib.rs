//! The HTTP/SSE gateway for MentatLab's core run orchestrator: the
//! minimum-viable surface from the external-interfaces contract, wired to
//! the `lib/runstore`, `lib/executor`, `lib/scheduler`, and `lib/sse`
//! crates.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
