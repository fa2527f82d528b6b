//! The per-run driving task of MentatLab's core orchestrator.
//!
//! This crate provides:
//!
//! - **`Scheduler`**: level-by-level DAG dispatch, bounded parallelism,
//!   retry with backoff, cancellation propagation, failure propagation to
//!   descendants.
//! - **`SchedulerConfig`**: concurrency and retry defaults.
//! - **`descendants_of`**: downstream-of-failure reachability, used both by
//!   the scheduler and available for callers that need to preview blast
//!   radius before cancelling a node.

pub mod config;
pub mod descendants;
pub mod error;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use descendants::descendants_of;
pub use error::SchedulerError;
pub use scheduler::Scheduler;
