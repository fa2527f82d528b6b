//! In-process Workload Executor adapter.
//!
//! Runs a registered async function directly inside the scheduler's
//! process instead of dispatching to an external workload runner.
//! Primarily for development and testing — grounded on the workflow
//! engine's `EchoExecutor`/`MockExecutor` test doubles, generalized into a
//! registry of named functions keyed by [`NodeSpec::command`] so a whole
//! plan can be exercised without Kubernetes.

use crate::error::ExecutorError;
use crate::executor::{NodeHandle, NodeOutcome, TerminalNodeStatus, WorkloadExecutor};
use async_trait::async_trait;
use mentatlab_core::RunId;
use mentatlab_event::{EventInput, EventType};
use mentatlab_plan::NodeSpec;
use mentatlab_runstore::RunStore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Lets a running node function append events to the Run Store while it is
/// still live, the in-process equivalent of the container-job adapter
/// following a workload's stdout line by line (see `log_follow`).
#[derive(Clone)]
pub struct NodeEventSink {
    run_store: Arc<dyn RunStore>,
    run_id: RunId,
    node_id: String,
}

impl NodeEventSink {
    /// Appends one event for this node. Failures are logged and swallowed,
    /// matching `log_follow::follow_stdout`'s append-failure handling — a
    /// broken event log must not take down the workload's own lifecycle.
    pub async fn emit(&self, event_type: EventType, data: serde_json::Value) {
        if let Err(err) = self
            .run_store
            .append_event(&self.run_id, EventInput::for_node(self.node_id.clone(), event_type, data))
            .await
        {
            tracing::warn!(node_id = %self.node_id, error = %err, "failed to append node event");
        }
    }
}

/// A node function: receives its node id, env, and an event sink it may use
/// to emit `log`/`metric`/`stream_*` events while it runs, and resolves to
/// the node's final result payload or an error message.
pub type NodeFn = Arc<
    dyn Fn(
            String,
            HashMap<String, String>,
            NodeEventSink,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<serde_json::Value, String>> + Send>,
        > + Send
        + Sync,
>;

/// Registry of node functions, keyed by [`NodeSpec::command`].
#[derive(Clone, Default)]
pub struct InProcessRegistry {
    functions: HashMap<String, NodeFn>,
}

impl InProcessRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function under `command`.
    #[must_use]
    pub fn with(mut self, command: impl Into<String>, f: NodeFn) -> Self {
        self.functions.insert(command.into(), f);
        self
    }
}

struct Handle {
    join: JoinHandle<()>,
    done: oneshot::Receiver<NodeOutcome>,
}

/// The in-process [`WorkloadExecutor`] adapter.
pub struct InProcessExecutor {
    registry: InProcessRegistry,
    run_store: Arc<dyn RunStore>,
}

impl InProcessExecutor {
    /// Creates an adapter backed by `registry`, appending workload events
    /// to `run_store`.
    #[must_use]
    pub fn new(registry: InProcessRegistry, run_store: Arc<dyn RunStore>) -> Self {
        Self {
            registry,
            run_store,
        }
    }
}

#[async_trait]
impl WorkloadExecutor for InProcessExecutor {
    async fn start_node(
        &self,
        run_id: RunId,
        node: &NodeSpec,
        env: HashMap<String, String>,
    ) -> Result<NodeHandle, ExecutorError> {
        let command = node
            .command
            .as_ref()
            .and_then(|argv| argv.first())
            .cloned()
            .ok_or_else(|| {
                ExecutorError::StartFailed(format!(
                    "node {} has no command for the in-process adapter",
                    node.id
                ))
            })?;
        let Some(func) = self.registry.functions.get(&command).cloned() else {
            return Err(ExecutorError::StartFailed(format!(
                "no in-process function registered for command {command:?}"
            )));
        };

        let (cancel_tx, mut cancel_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let node_id = node.id.to_string();
        let run_store = Arc::clone(&self.run_store);
        let sink = NodeEventSink {
            run_store: Arc::clone(&run_store),
            run_id,
            node_id: node_id.clone(),
        };

        let join = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = &mut cancel_rx => NodeOutcome {
                    status: TerminalNodeStatus::Cancelled,
                    error: None,
                    result: None,
                },
                result = func(node_id.clone(), env, sink) => match result {
                    Ok(value) => {
                        let _ = run_store
                            .append_event(
                                &run_id,
                                EventInput::for_node(
                                    node_id.clone(),
                                    mentatlab_event::EventType::Result,
                                    value.clone(),
                                ),
                            )
                            .await;
                        NodeOutcome {
                            status: TerminalNodeStatus::Succeeded,
                            error: None,
                            result: Some(value),
                        }
                    }
                    Err(message) => NodeOutcome {
                        status: TerminalNodeStatus::Failed,
                        error: Some(message),
                        result: None,
                    },
                },
            };
            let _ = done_tx.send(outcome);
        });

        Ok(NodeHandle::new(Handle { join, done: done_rx }, cancel_tx))
    }

    async fn wait_node(&self, handle: &NodeHandle) -> Result<NodeOutcome, ExecutorError> {
        let Handle { join, done } = handle.take_payload::<Handle>().ok_or_else(|| {
            ExecutorError::WaitFailed("handle already waited on or from a different adapter".to_string())
        })?;
        let outcome = done
            .await
            .map_err(|_| ExecutorError::WaitFailed("node task dropped its result".to_string()))?;
        let _ = join.await;
        Ok(outcome)
    }

    async fn cancel_node(&self, handle: &NodeHandle) {
        handle.signal_cancel();
    }
}
