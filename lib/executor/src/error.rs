//! Errors returned by [`crate::WorkloadExecutor`] operations.

use std::fmt;

/// Errors a Workload Executor adapter can return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// The workload could not be launched.
    StartFailed(String),
    /// Waiting for the workload failed for a reason other than the
    /// workload's own terminal status (e.g. the log follower died).
    WaitFailed(String),
}

impl fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartFailed(msg) => write!(f, "failed to start node: {msg}"),
            Self::WaitFailed(msg) => write!(f, "failed while waiting on node: {msg}"),
        }
    }
}

impl std::error::Error for ExecutorError {}
