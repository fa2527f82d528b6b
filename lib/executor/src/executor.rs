//! The `WorkloadExecutor` trait: interface shared by the in-process and
//! container-job adapters.

use crate::error::ExecutorError;
use async_trait::async_trait;
use mentatlab_core::RunId;
use mentatlab_plan::NodeSpec;
use std::any::Any;
use std::collections::HashMap;

/// A node's terminal outcome, as observed by `WaitNode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalNodeStatus {
    /// The node ran to completion without error.
    Succeeded,
    /// The node reported or was detected to have failed.
    Failed,
    /// The node was torn down in response to `CancelNode`.
    Cancelled,
}

/// What `WaitNode` returns once the workload reaches a terminal status.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    /// The node's terminal status.
    pub status: TerminalNodeStatus,
    /// Present when `status == Failed`.
    pub error: Option<String>,
    /// The node's final result payload, if any. Also appended to the run's
    /// event log as a `result` event by the adapter before `WaitNode`
    /// returns.
    pub result: Option<serde_json::Value>,
}

/// An opaque reference to a launched workload, returned by `StartNode` and
/// passed back into `WaitNode`/`CancelNode`.
///
/// The adapter-specific payload is boxed as `dyn Any` rather than carried
/// as an associated type so that a single `Arc<dyn WorkloadExecutor>` can
/// be shared by the scheduler regardless of which adapter is configured;
/// each adapter downcasts back to its own concrete handle type internally.
/// Both the payload and the cancellation sender live behind their own
/// `Mutex<Option<_>>`, so `WaitNode` and `CancelNode` both take `&NodeHandle`
/// and the scheduler can race them against each other without ever moving
/// the handle — taking it by value for `WaitNode` would drop the
/// still-armed cancel sender on the first poll, an outright different
/// workload, reporting every node `Cancelled` regardless of how it actually
/// ran.
pub struct NodeHandle {
    payload: std::sync::Mutex<Option<Box<dyn Any + Send + Sync>>>,
    cancel: std::sync::Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
}

impl NodeHandle {
    /// Wraps an adapter-specific handle value along with the cancellation
    /// sender the adapter's background task is selecting on.
    pub fn new<T: Send + Sync + 'static>(
        value: T,
        cancel: tokio::sync::oneshot::Sender<()>,
    ) -> Self {
        Self {
            payload: std::sync::Mutex::new(Some(Box::new(value))),
            cancel: std::sync::Mutex::new(Some(cancel)),
        }
    }

    /// Sends the best-effort cancellation signal, if it hasn't already
    /// been sent or the receiver hasn't already gone away.
    pub fn signal_cancel(&self) {
        if let Some(tx) = self.cancel.lock().expect("cancel lock poisoned").take() {
            let _ = tx.send(());
        }
    }

    /// Takes and downcasts the adapter-specific payload back to its
    /// concrete handle type. Returns `None` if it was already taken (a
    /// handle is only ever waited on once) or was produced by a different
    /// adapter — the scheduler never mixes adapters, so the latter should
    /// not occur in practice.
    pub fn take_payload<T: Send + Sync + 'static>(&self) -> Option<T> {
        let mut guard = self.payload.lock().expect("payload lock poisoned");
        let boxed = guard.take()?;
        match boxed.downcast::<T>() {
            Ok(value) => Some(*value),
            Err(boxed) => {
                *guard = Some(boxed);
                None
            }
        }
    }
}

/// Launches, awaits, and cancels node workloads on behalf of the
/// scheduler, streaming the workload's structured output into the run's
/// event log as it executes.
#[async_trait]
pub trait WorkloadExecutor: Send + Sync {
    /// Launches the workload for `node` and returns immediately after
    /// acceptance; the workload continues running asynchronously.
    async fn start_node(
        &self,
        run_id: RunId,
        node: &NodeSpec,
        env: HashMap<String, String>,
    ) -> Result<NodeHandle, ExecutorError>;

    /// Blocks until the workload referenced by `handle` terminates.
    async fn wait_node(&self, handle: &NodeHandle) -> Result<NodeOutcome, ExecutorError>;

    /// Sends a best-effort cancellation signal to the workload. Does not
    /// block on the workload actually stopping; the corresponding
    /// `WaitNode` call observes the eventual `Cancelled` outcome.
    async fn cancel_node(&self, handle: &NodeHandle);
}
