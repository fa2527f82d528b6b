//! The Workload Executor: launches, awaits, and cancels node workloads on
//! behalf of the scheduler, behind a single trait with an in-process
//! adapter (development/testing) and a container-job (Kubernetes) adapter.

pub mod container_job;
pub mod error;
pub mod executor;
pub mod in_process;
pub mod log_follow;

pub use container_job::{ContainerJobConfig, ContainerJobExecutor};
pub use error::ExecutorError;
pub use executor::{NodeHandle, NodeOutcome, TerminalNodeStatus, WorkloadExecutor};
pub use in_process::{InProcessExecutor, InProcessRegistry, NodeEventSink, NodeFn};
