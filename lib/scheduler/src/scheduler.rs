//! The per-run driving task: level-by-level dispatch, retry with backoff,
//! cancellation propagation, and failure propagation to descendants.

use crate::descendants::descendants_of;
use crate::error::SchedulerError;
use mentatlab_core::RunId;
use mentatlab_event::{EventInput, EventType};
use mentatlab_executor::{TerminalNodeStatus, WorkloadExecutor};
use mentatlab_plan::{NodeId, NodeSpec, Plan, Planner};
use mentatlab_runstore::{RunStore, RunStatus, RunStoreError};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::SchedulerConfig;

/// What dispatching a single node attempt produced, once it stopped
/// retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeRunOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

fn run_status_wire(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

/// Appends a `node_status` event for `node_id` with the given wire status.
async fn append_node_status(
    run_store: &Arc<dyn RunStore>,
    run_id: &RunId,
    node_id: &NodeId,
    status: &str,
    extra: Option<(&'static str, serde_json::Value)>,
) -> Result<(), RunStoreError> {
    let mut data = serde_json::json!({ "status": status });
    if let Some((key, value)) = extra {
        data[key] = value;
    }
    run_store
        .append_event(
            run_id,
            EventInput::for_node(node_id.to_string(), EventType::NodeStatus, data),
        )
        .await?;
    Ok(())
}

/// Races a single `wait_node` call against the run's cancellation watch,
/// returning as soon as either resolves. `cancel_rx` is reused across
/// retries by the caller via repeated calls to this function — each call
/// re-borrows the same `watch::Receiver`, so a cancellation observed on one
/// attempt is still visible to the next.
async fn await_node_outcome(
    executor: &Arc<dyn WorkloadExecutor>,
    handle: &mentatlab_executor::NodeHandle,
    cancel_rx: &mut tokio::sync::watch::Receiver<bool>,
) -> Result<TerminalNodeStatus, SchedulerError> {
    let wait = executor.wait_node(handle);
    tokio::pin!(wait);
    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    executor.cancel_node(handle).await;
                    let outcome = wait.await?;
                    return Ok(outcome.status);
                }
            }
            outcome = &mut wait => {
                return Ok(outcome?.status);
            }
        }
    }
}

/// Runs one node through its full attempt/retry lifecycle: dispatch,
/// await, and — on failure — sleep for the node's backoff before retrying,
/// itself racing the sleep against cancellation. The node's first attempt
/// is expected to have already been started and its `started` event
/// already appended by the caller (see [`Scheduler::drive`] for why); this
/// function owns every attempt after that, including each retry's own
/// `started` event.
async fn run_node_to_completion(
    run_store: Arc<dyn RunStore>,
    executor: Arc<dyn WorkloadExecutor>,
    run_id: RunId,
    node: NodeSpec,
    config: SchedulerConfig,
    mut first_handle: mentatlab_executor::NodeHandle,
    mut cancel_rx: tokio::sync::watch::Receiver<bool>,
) -> Result<NodeRunOutcome, SchedulerError> {
    let max_retries = node.max_retries.unwrap_or(config.default_max_retries);
    let base_backoff = node.backoff_seconds.unwrap_or(config.default_backoff_seconds);
    let mut attempt: u32 = 0;

    loop {
        let status = await_node_outcome(&executor, &first_handle, &mut cancel_rx).await?;

        match status {
            TerminalNodeStatus::Succeeded => {
                append_node_status(&run_store, &run_id, &node.id, "succeeded", None).await?;
                return Ok(NodeRunOutcome::Succeeded);
            }
            TerminalNodeStatus::Cancelled => {
                append_node_status(&run_store, &run_id, &node.id, "cancelled", None).await?;
                return Ok(NodeRunOutcome::Cancelled);
            }
            TerminalNodeStatus::Failed => {
                append_node_status(
                    &run_store,
                    &run_id,
                    &node.id,
                    "failed",
                    Some(("attempt", serde_json::json!(attempt))),
                )
                .await?;

                if attempt >= max_retries || *cancel_rx.borrow() {
                    return Ok(NodeRunOutcome::Failed);
                }

                let backoff_secs = base_backoff.saturating_mul(1 << attempt).max(1);
                let backoff_ms = backoff_secs.saturating_mul(1000);
                let jitter_ms = rand::thread_rng().gen_range(0..backoff_ms.max(1));
                let sleep = tokio::time::sleep(std::time::Duration::from_millis(
                    backoff_ms.saturating_add(jitter_ms),
                ));
                tokio::pin!(sleep);
                tokio::select! {
                    biased;
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            append_node_status(&run_store, &run_id, &node.id, "cancelled", None).await?;
                            return Ok(NodeRunOutcome::Cancelled);
                        }
                    }
                    () = &mut sleep => {}
                }

                attempt += 1;
                append_node_status(
                    &run_store,
                    &run_id,
                    &node.id,
                    "started",
                    Some(("attempt", serde_json::json!(attempt))),
                )
                .await?;
                first_handle = executor
                    .start_node(run_id, &node, node.env.clone().unwrap_or_default())
                    .await?;
            }
        }
    }
}

/// Drives a single run to completion: levelizes its plan, dispatches each
/// level's nodes under the configured bounded parallelism, and reacts to
/// node failure (propagating cancellation to descendants) and run
/// cancellation (observed via the Run Store's cancellation watch).
pub struct Scheduler {
    run_store: Arc<dyn RunStore>,
    executor: Arc<dyn WorkloadExecutor>,
    config: SchedulerConfig,
    global_semaphore: Arc<Semaphore>,
}

impl Scheduler {
    /// Creates a scheduler backed by `run_store` and `executor`, bounding
    /// global concurrency per `config.max_global` (`0` means unbounded).
    #[must_use]
    pub fn new(run_store: Arc<dyn RunStore>, executor: Arc<dyn WorkloadExecutor>, config: SchedulerConfig) -> Self {
        let permits = if config.max_global == 0 {
            Semaphore::MAX_PERMITS
        } else {
            config.max_global
        };
        Self {
            run_store,
            executor,
            config,
            global_semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Drives `run_id` (already persisted, in `pending` status) to
    /// completion. Returns once the run has reached a terminal status and
    /// its `stream_end` event has been appended.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError`] if the plan fails validation, or if the
    /// Run Store or Workload Executor return an unrecoverable error.
    pub async fn drive(&self, run_id: RunId, plan: Plan) -> Result<(), SchedulerError> {
        Planner::validate(&plan)?;
        let levels = Planner::levels(&plan)?;

        let per_run_permits = if self.config.max_per_run == 0 {
            Semaphore::MAX_PERMITS
        } else {
            self.config.max_per_run
        };
        let per_run_semaphore = Arc::new(Semaphore::new(per_run_permits));

        let mut cancel_rx = self.run_store.watch_cancellation(&run_id).await?;
        let mut dispatched_any = false;
        let mut skipped: HashSet<NodeId> = HashSet::new();
        let mut first_failure: Option<String> = None;
        let mut was_cancelled = *cancel_rx.borrow();

        'levels: for level in &levels {
            if was_cancelled || first_failure.is_some() {
                break;
            }

            let mut tasks = Vec::with_capacity(level.len());

            for node_id in level {
                if was_cancelled {
                    break 'levels;
                }
                if skipped.contains(node_id) {
                    continue;
                }

                let Some(node) = plan.node(node_id) else {
                    continue;
                };

                if !dispatched_any {
                    if let Err(e) = self
                        .run_store
                        .update_run_status(&run_id, RunStatus::Running, None)
                        .await
                    {
                        if matches!(e, RunStoreError::Conflict(_)) {
                            was_cancelled = true;
                            break 'levels;
                        }
                        return Err(e.into());
                    }
                    dispatched_any = true;
                }

                let global_permit = Arc::clone(&self.global_semaphore)
                    .acquire_owned()
                    .await
                    .expect("global semaphore never closed");
                let run_permit = Arc::clone(&per_run_semaphore)
                    .acquire_owned()
                    .await
                    .expect("per-run semaphore never closed");

                append_node_status(
                    &self.run_store,
                    &run_id,
                    node_id,
                    "started",
                    Some(("attempt", serde_json::json!(0))),
                )
                .await?;

                let handle = self
                    .executor
                    .start_node(run_id, node, node.env.clone().unwrap_or_default())
                    .await?;

                let run_store = Arc::clone(&self.run_store);
                let executor = Arc::clone(&self.executor);
                let node = node.clone();
                let node_id = node_id.clone();
                let config = self.config;
                let node_cancel_rx = cancel_rx.clone();

                let task = tokio::spawn(async move {
                    let _global_permit = global_permit;
                    let _run_permit = run_permit;
                    let outcome =
                        run_node_to_completion(run_store, executor, run_id, node, config, handle, node_cancel_rx)
                            .await;
                    (node_id, outcome)
                });
                tasks.push(task);
            }

            for task in tasks {
                let (node_id, outcome) = task.await.map_err(|e| {
                    SchedulerError::Executor(format!("node task panicked: {e}"))
                })?;
                match outcome? {
                    NodeRunOutcome::Succeeded => {}
                    NodeRunOutcome::Cancelled => {
                        was_cancelled = true;
                    }
                    NodeRunOutcome::Failed => {
                        if first_failure.is_none() {
                            first_failure = Some(format!("node {node_id} failed"));
                        }
                        let blocked = descendants_of(&plan, &node_id);
                        if !blocked.is_empty() {
                            tracing::info!(run = %run_id, node = %node_id, count = blocked.len(), "node failed, cancelling descendants");
                        }
                        for descendant in blocked {
                            if skipped.insert(descendant.clone()) {
                                append_node_status(&self.run_store, &run_id, &descendant, "cancelled", None).await?;
                            }
                        }
                    }
                }
            }

            if *cancel_rx.borrow() {
                was_cancelled = true;
            }
        }

        let final_status = if was_cancelled {
            RunStatus::Cancelled
        } else if first_failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        if let Err(e) = self
            .run_store
            .update_run_status(&run_id, final_status, first_failure.clone())
            .await
        {
            let already_cancelled = final_status == RunStatus::Cancelled && matches!(e, RunStoreError::Conflict(_));
            if !already_cancelled {
                return Err(e.into());
            }
        }

        self.run_store
            .append_event(
                &run_id,
                EventInput::new(
                    EventType::StreamEnd,
                    serde_json::json!({ "status": run_status_wire(final_status) }),
                ),
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentatlab_executor::{InProcessExecutor, InProcessRegistry, NodeOutcome};
    use mentatlab_runstore::InMemoryRunStore;
    use std::time::Duration;

    fn immediate_ok() -> mentatlab_executor::NodeFn {
        Arc::new(|_id, _env, _sink| Box::pin(async move { Ok(serde_json::json!({"ok": true})) }))
    }

    fn immediate_fail() -> mentatlab_executor::NodeFn {
        Arc::new(|_id, _env, _sink| Box::pin(async move { Err("boom".to_string()) }))
    }

    async fn setup(
        registry: InProcessRegistry,
    ) -> (Scheduler, Arc<dyn RunStore>) {
        let run_store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let executor: Arc<dyn WorkloadExecutor> = Arc::new(InProcessExecutor::new(registry, Arc::clone(&run_store)));
        let scheduler = Scheduler::new(Arc::clone(&run_store), executor, SchedulerConfig::default());
        (scheduler, run_store)
    }

    #[tokio::test]
    async fn linear_plan_succeeds() {
        let registry = InProcessRegistry::new().with("ok", immediate_ok());
        let (scheduler, run_store) = setup(registry).await;

        let plan = Plan::new(
            vec![
                NodeSpec::builtin("a", vec!["ok".to_string()]),
                NodeSpec::builtin("b", vec!["ok".to_string()]),
            ],
            vec![(NodeId::new("a"), NodeId::new("b"))],
        );
        let run_id = run_store.create_run("t".to_string(), plan.clone(), None).await.unwrap();
        scheduler.drive(run_id, plan).await.unwrap();

        let meta = run_store.get_run_meta(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Succeeded);

        let events = run_store.get_events_since(&run_id, None).await.unwrap();
        let last = events.last().unwrap();
        assert_eq!(last.event_type, EventType::StreamEnd);
        assert_eq!(last.data["status"], "succeeded");
    }

    #[tokio::test]
    async fn diamond_plan_bounds_concurrency_and_succeeds() {
        let registry = InProcessRegistry::new().with("ok", immediate_ok());
        let (run_store, executor) = {
            let run_store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
            let executor: Arc<dyn WorkloadExecutor> =
                Arc::new(InProcessExecutor::new(registry, Arc::clone(&run_store)));
            (run_store, executor)
        };
        let scheduler = Scheduler::new(
            Arc::clone(&run_store),
            executor,
            SchedulerConfig { max_per_run: 2, ..SchedulerConfig::default() },
        );

        let plan = Plan::new(
            vec![
                NodeSpec::builtin("a", vec!["ok".to_string()]),
                NodeSpec::builtin("b", vec!["ok".to_string()]),
                NodeSpec::builtin("c", vec!["ok".to_string()]),
                NodeSpec::builtin("d", vec!["ok".to_string()]),
            ],
            vec![
                (NodeId::new("a"), NodeId::new("b")),
                (NodeId::new("a"), NodeId::new("c")),
                (NodeId::new("b"), NodeId::new("d")),
                (NodeId::new("c"), NodeId::new("d")),
            ],
        );
        let run_id = run_store.create_run("t".to_string(), plan.clone(), None).await.unwrap();
        scheduler.drive(run_id, plan).await.unwrap();

        let meta = run_store.get_run_meta(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Succeeded);

        let events = run_store.get_events_since(&run_id, None).await.unwrap();
        let started_middle = events
            .iter()
            .filter(|e| {
                e.event_type == EventType::NodeStatus
                    && e.data["status"] == "started"
                    && matches!(e.node_id.as_deref(), Some("b") | Some("c"))
            })
            .count();
        assert_eq!(started_middle, 2);
    }

    #[tokio::test]
    async fn failed_node_cancels_descendants_without_retry() {
        let registry = InProcessRegistry::new().with("boom", immediate_fail());
        let (scheduler, run_store) = setup(registry).await;

        let plan = Plan::new(
            vec![
                NodeSpec::builtin("a", vec!["boom".to_string()]),
                NodeSpec::builtin("b", vec!["boom".to_string()]),
            ],
            vec![(NodeId::new("a"), NodeId::new("b"))],
        );
        let run_id = run_store.create_run("t".to_string(), plan.clone(), None).await.unwrap();
        scheduler.drive(run_id, plan).await.unwrap();

        let meta = run_store.get_run_meta(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Failed);

        let events = run_store.get_events_since(&run_id, None).await.unwrap();
        let b_cancelled = events
            .iter()
            .any(|e| e.node_id.as_deref() == Some("b") && e.data["status"] == "cancelled");
        assert!(b_cancelled);
        let b_started = events.iter().any(|e| e.node_id.as_deref() == Some("b") && e.data["status"] == "started");
        assert!(!b_started);
    }

    #[tokio::test]
    async fn empty_plan_succeeds_without_running_transition() {
        let registry = InProcessRegistry::new();
        let (scheduler, run_store) = setup(registry).await;

        let plan = Plan::new(vec![], vec![]);
        let run_id = run_store.create_run("t".to_string(), plan.clone(), None).await.unwrap();
        scheduler.drive(run_id, plan).await.unwrap();

        let meta = run_store.get_run_meta(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn cancel_mid_run_stops_not_yet_started_nodes_without_event() {
        let registry = InProcessRegistry::new().with(
            "slow",
            Arc::new(|_id, _env, _sink| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(serde_json::Value::Null)
                })
            }),
        );
        let (scheduler, run_store) = setup(registry).await;

        let plan = Plan::new(
            vec![
                NodeSpec::builtin("a", vec!["slow".to_string()]),
                NodeSpec::builtin("b", vec!["slow".to_string()]),
            ],
            vec![(NodeId::new("a"), NodeId::new("b"))],
        );
        let run_id = run_store.create_run("t".to_string(), plan.clone(), None).await.unwrap();

        let run_store_for_cancel = Arc::clone(&run_store);
        let cancel_run_id = run_id;
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            run_store_for_cancel.cancel_run(&cancel_run_id).await.unwrap();
        });

        scheduler.drive(run_id, plan).await.unwrap();
        canceller.await.unwrap();

        let meta = run_store.get_run_meta(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Cancelled);

        let events = run_store.get_events_since(&run_id, None).await.unwrap();
        let a_cancelled = events
            .iter()
            .any(|e| e.node_id.as_deref() == Some("a") && e.data["status"] == "cancelled");
        assert!(a_cancelled);
        let b_any_event = events.iter().any(|e| e.node_id.as_deref() == Some("b"));
        assert!(!b_any_event);
    }

    #[allow(unused)]
    fn _unused_outcome_field(o: NodeOutcome) -> Option<serde_json::Value> {
        o.result
    }

    #[tokio::test]
    async fn node_retries_twice_then_succeeds() {
        let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counted: mentatlab_executor::NodeFn = {
            let attempts = Arc::clone(&attempts);
            Arc::new(move |_id, _env, _sink| {
                let attempts = Arc::clone(&attempts);
                Box::pin(async move {
                    let n = attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    if n < 2 {
                        Err("boom".to_string())
                    } else {
                        Ok(serde_json::json!({"ok": true}))
                    }
                })
            })
        };
        let registry = InProcessRegistry::new().with("flaky", counted);
        let run_store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let executor: Arc<dyn WorkloadExecutor> =
            Arc::new(InProcessExecutor::new(registry, Arc::clone(&run_store)));
        let scheduler = Scheduler::new(
            Arc::clone(&run_store),
            executor,
            SchedulerConfig { default_max_retries: 2, default_backoff_seconds: 0, ..SchedulerConfig::default() },
        );

        let plan = Plan::new(vec![NodeSpec::builtin("a", vec!["flaky".to_string()])], vec![]);
        let run_id = run_store.create_run("t".to_string(), plan.clone(), None).await.unwrap();
        scheduler.drive(run_id, plan).await.unwrap();

        let meta = run_store.get_run_meta(&run_id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Succeeded);

        let events = run_store.get_events_since(&run_id, None).await.unwrap();
        let sequence: Vec<(String, Option<u64>)> = events
            .iter()
            .filter(|e| e.event_type == EventType::NodeStatus && e.node_id.as_deref() == Some("a"))
            .map(|e| {
                (
                    e.data["status"].as_str().unwrap().to_string(),
                    e.data.get("attempt").and_then(serde_json::Value::as_u64),
                )
            })
            .collect();
        assert_eq!(
            sequence,
            vec![
                ("started".to_string(), Some(0)),
                ("failed".to_string(), Some(0)),
                ("started".to_string(), Some(1)),
                ("failed".to_string(), Some(1)),
                ("started".to_string(), Some(2)),
                ("succeeded".to_string(), None),
            ]
        );
    }
}
