//! Errors surfaced by the [`crate::Scheduler`].

use std::fmt;

/// Plain enum, manual `Display`/`Error` impls — matches the error-type
/// style used throughout this workspace. These are `rootcause::Report`
/// contexts at call sites, not `thiserror`-derived types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The run's plan failed validation or levelization.
    Plan(String),
    /// The Run/Event Store returned an error.
    RunStore(String),
    /// The Workload Executor returned an error.
    Executor(String),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan(msg) => write!(f, "plan error: {msg}"),
            Self::RunStore(msg) => write!(f, "run store error: {msg}"),
            Self::Executor(msg) => write!(f, "executor error: {msg}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<mentatlab_plan::PlanError> for SchedulerError {
    fn from(err: mentatlab_plan::PlanError) -> Self {
        Self::Plan(err.to_string())
    }
}

impl From<mentatlab_runstore::RunStoreError> for SchedulerError {
    fn from(err: mentatlab_runstore::RunStoreError) -> Self {
        Self::RunStore(err.to_string())
    }
}

impl From<mentatlab_executor::ExecutorError> for SchedulerError {
    fn from(err: mentatlab_executor::ExecutorError) -> Self {
        Self::Executor(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_error_display() {
        let err = SchedulerError::Plan("cycle".to_string());
        assert!(err.to_string().contains("cycle"));
    }
}
