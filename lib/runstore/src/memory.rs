//! In-memory Run Store adapter: process-wide state, one lock per run.
//!
//! Intended for development and testing. All non-terminal runs are lost on
//! process restart — acceptable for this adapter per the scheduler's
//! documented restart-recovery policy.

use crate::error::RunStoreError;
use crate::run::{AdapterInfo, Run, RunMeta, RunStatus};
use crate::store::{RunStore, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mentatlab_core::{EventId, EventIdGenerator, RunId};
use mentatlab_event::{Event, EventInput};
use mentatlab_plan::Plan;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, watch};

/// Per-subscriber buffer size. When full, the subscriber is dropped rather
/// than blocking the append path — bounded fan-out, unbounded log.
const SUBSCRIBER_BUFFER: usize = 256;

struct RunInner {
    meta: RunMeta,
    plan: Plan,
    events: Vec<Event>,
    id_gen: EventIdGenerator,
    last_timestamp: DateTime<Utc>,
    terminal_event_appended: bool,
    subscribers: Vec<(u64, mpsc::Sender<Event>)>,
    next_subscriber_id: u64,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
}

impl RunInner {
    fn new(meta: RunMeta, plan: Plan) -> Self {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self {
            meta,
            plan,
            events: Vec::new(),
            id_gen: EventIdGenerator::new(),
            last_timestamp: DateTime::<Utc>::MIN_UTC,
            terminal_event_appended: false,
            subscribers: Vec::new(),
            next_subscriber_id: 0,
            cancel_tx,
            cancel_rx,
        }
    }

    fn next_event_id(&mut self, now: DateTime<Utc>) -> (EventId, DateTime<Utc>) {
        let micros = u64::try_from(now.timestamp_micros()).unwrap_or(0);
        let id = self.id_gen.next(micros);
        let timestamp = if now > self.last_timestamp {
            now
        } else {
            self.last_timestamp + chrono::Duration::microseconds(1)
        };
        self.last_timestamp = timestamp;
        (id, timestamp)
    }

    /// Fans an event out to all live subscribers, dropping any whose
    /// buffer is full or whose receiver has gone away.
    fn fan_out(&mut self, event: &Event) {
        self.subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => {
                tracing::debug!(subscriber = id, "dropping subscriber: buffer full");
                false
            }
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

struct MemoryState {
    runs: HashMap<RunId, Arc<Mutex<RunInner>>>,
    /// Insertion order, most recent last; reversed for `list_runs`.
    order: Vec<RunId>,
}

/// The in-memory [`RunStore`] adapter.
#[derive(Clone)]
pub struct InMemoryRunStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryRunStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MemoryState {
                runs: HashMap::new(),
                order: Vec::new(),
            })),
        }
    }

    fn get_inner(&self, run_id: &RunId) -> Result<Arc<Mutex<RunInner>>, RunStoreError> {
        self.state
            .read()
            .expect("run store lock poisoned")
            .runs
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunStoreError::NotFound(run_id.to_string()))
    }

    fn legal_transition(current: RunStatus, next: RunStatus) -> bool {
        use RunStatus::{Cancelled, Failed, Pending, Running, Succeeded};
        if current.is_terminal() {
            return false;
        }
        matches!(
            (current, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Succeeded)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(
        &self,
        name: String,
        plan: Plan,
        owner_subject: Option<String>,
    ) -> Result<RunId, RunStoreError> {
        let id = RunId::new();
        let meta = RunMeta {
            id,
            name,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            owner_subject,
        };
        let inner = Arc::new(Mutex::new(RunInner::new(meta, plan)));
        let mut state = self.state.write().expect("run store lock poisoned");
        state.runs.insert(id, inner);
        state.order.push(id);
        Ok(id)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Run, RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let guard = inner.lock().expect("run lock poisoned");
        Ok(Run {
            meta: guard.meta.clone(),
            plan: guard.plan.clone(),
        })
    }

    async fn get_run_meta(&self, run_id: &RunId) -> Result<RunMeta, RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let guard = inner.lock().expect("run lock poisoned");
        Ok(guard.meta.clone())
    }

    async fn list_runs(&self, limit: usize, offset: usize) -> Result<(Vec<RunId>, usize), RunStoreError> {
        let state = self.state.read().expect("run store lock poisoned");
        let total = state.order.len();
        let ids = state
            .order
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .copied()
            .collect();
        Ok((ids, total))
    }

    async fn update_run_status(
        &self,
        run_id: &RunId,
        new_status: RunStatus,
        error_if_terminal: Option<String>,
    ) -> Result<(), RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let mut guard = inner.lock().expect("run lock poisoned");
        let current = guard.meta.status;

        if current == new_status {
            return Err(RunStoreError::Conflict(format!(
                "run already in status {current:?}"
            )));
        }
        if !Self::legal_transition(current, new_status) {
            return Err(RunStoreError::Conflict(format!(
                "illegal transition {current:?} -> {new_status:?}"
            )));
        }

        let now = Utc::now();
        if current == RunStatus::Pending && new_status == RunStatus::Running {
            guard.meta.started_at = Some(now);
        }
        if new_status.is_terminal() {
            guard.meta.finished_at = Some(now);
            guard.meta.error = error_if_terminal;
        }
        guard.meta.status = new_status;
        Ok(())
    }

    async fn append_event(&self, run_id: &RunId, input: EventInput) -> Result<Event, RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let mut guard = inner.lock().expect("run lock poisoned");

        if guard.terminal_event_appended {
            return Err(RunStoreError::Conflict(
                "run already finalized: no further appends accepted".to_string(),
            ));
        }

        let (id, timestamp) = guard.next_event_id(Utc::now());
        let event = Event::new(
            id,
            *run_id,
            input.node_id,
            input.event_type,
            timestamp,
            input.data,
        );

        if event.event_type == mentatlab_event::EventType::StreamEnd {
            guard.terminal_event_appended = true;
        }

        guard.events.push(event.clone());
        guard.fan_out(&event);
        Ok(event)
    }

    async fn get_events_since(
        &self,
        run_id: &RunId,
        since_id: Option<&EventId>,
    ) -> Result<Vec<Event>, RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let guard = inner.lock().expect("run lock poisoned");
        Ok(match since_id {
            None => guard.events.clone(),
            Some(since) => guard
                .events
                .iter()
                .filter(|e| &e.id > since)
                .cloned()
                .collect(),
        })
    }

    async fn subscribe(&self, run_id: &RunId) -> Result<Subscription, RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let mut guard = inner.lock().expect("run lock poisoned");
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = guard.next_subscriber_id;
        guard.next_subscriber_id += 1;
        guard.subscribers.push((id, tx));
        Ok(Subscription { events: rx })
    }

    async fn cancel_run(&self, run_id: &RunId) -> Result<(), RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let mut guard = inner.lock().expect("run lock poisoned");

        match guard.meta.status {
            RunStatus::Cancelled => return Ok(()),
            status if status.is_terminal() => {
                return Err(RunStoreError::Conflict(format!(
                    "cannot cancel a run already in terminal status {status:?}"
                )));
            }
            _ => {}
        }

        guard.meta.status = RunStatus::Cancelled;
        guard.meta.finished_at = Some(Utc::now());
        let _ = guard.cancel_tx.send(true);
        Ok(())
    }

    async fn watch_cancellation(&self, run_id: &RunId) -> Result<watch::Receiver<bool>, RunStoreError> {
        let inner = self.get_inner(run_id)?;
        let guard = inner.lock().expect("run lock poisoned");
        Ok(guard.cancel_rx.clone())
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), RunStoreError> {
        let mut state = self.state.write().expect("run store lock poisoned");
        if state.runs.remove(run_id).is_none() {
            return Err(RunStoreError::NotFound(run_id.to_string()));
        }
        state.order.retain(|id| id != run_id);
        Ok(())
    }

    async fn adapter_info(&self) -> AdapterInfo {
        AdapterInfo {
            adapter_type: "memory".to_string(),
            healthy: true,
            latency_hint_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentatlab_event::EventType;
    use mentatlab_plan::NodeSpec;

    fn sample_plan() -> Plan {
        Plan::new(vec![NodeSpec::agent("a", "x")], vec![])
    }

    #[tokio::test]
    async fn create_then_get_run_roundtrips_plan_and_status() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let run = store.get_run(&id).await.unwrap();
        assert_eq!(run.meta.status, RunStatus::Pending);
        assert_eq!(run.plan, sample_plan());
    }

    #[tokio::test]
    async fn get_run_missing_is_not_found() {
        let store = InMemoryRunStore::new();
        let err = store.get_run(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, RunStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn status_transitions_reject_illegal_moves() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        store
            .update_run_status(&id, RunStatus::Running, None)
            .await
            .unwrap();
        store
            .update_run_status(&id, RunStatus::Succeeded, None)
            .await
            .unwrap();
        let err = store
            .update_run_status(&id, RunStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RunStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn append_event_assigns_strictly_increasing_ids() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let e1 = store
            .append_event(&id, EventInput::new(EventType::Log, serde_json::json!({})))
            .await
            .unwrap();
        let e2 = store
            .append_event(&id, EventInput::new(EventType::Log, serde_json::json!({})))
            .await
            .unwrap();
        assert!(e1.id < e2.id);
    }

    #[tokio::test]
    async fn no_appends_after_stream_end() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        store
            .append_event(
                &id,
                EventInput::new(EventType::StreamEnd, serde_json::json!({"status":"succeeded"})),
            )
            .await
            .unwrap();
        let err = store
            .append_event(&id, EventInput::new(EventType::Log, serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, RunStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn get_events_since_filters_correctly() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let e1 = store
            .append_event(&id, EventInput::new(EventType::Log, serde_json::json!({})))
            .await
            .unwrap();
        let e2 = store
            .append_event(&id, EventInput::new(EventType::Log, serde_json::json!({})))
            .await
            .unwrap();

        let all = store.get_events_since(&id, None).await.unwrap();
        assert_eq!(all, vec![e1.clone(), e2.clone()]);

        let since_e1 = store.get_events_since(&id, Some(&e1.id)).await.unwrap();
        assert_eq!(since_e1, vec![e2]);
    }

    #[tokio::test]
    async fn subscriber_receives_events_appended_after_subscribe() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let mut sub = store.subscribe(&id).await.unwrap();
        store
            .append_event(&id, EventInput::new(EventType::Log, serde_json::json!({})))
            .await
            .unwrap();
        let received = sub.events.recv().await.unwrap();
        assert_eq!(received.event_type, EventType::Log);
    }

    #[tokio::test]
    async fn full_subscriber_buffer_drops_subscriber_not_events() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let sub = store.subscribe(&id).await.unwrap();
        for _ in 0..SUBSCRIBER_BUFFER + 10 {
            store
                .append_event(&id, EventInput::new(EventType::Log, serde_json::json!({})))
                .await
                .unwrap();
        }
        // Log is still fully intact even though the subscriber was dropped.
        let all = store.get_events_since(&id, None).await.unwrap();
        assert_eq!(all.len(), SUBSCRIBER_BUFFER + 10);
        drop(sub);
    }

    #[tokio::test]
    async fn cancel_run_is_idempotent() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        store.cancel_run(&id).await.unwrap();
        store.cancel_run(&id).await.unwrap();
        let meta = store.get_run_meta(&id).await.unwrap();
        assert_eq!(meta.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_run_rejects_after_other_terminal_status() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        store
            .update_run_status(&id, RunStatus::Running, None)
            .await
            .unwrap();
        store
            .update_run_status(&id, RunStatus::Succeeded, None)
            .await
            .unwrap();
        let err = store.cancel_run(&id).await.unwrap_err();
        assert!(matches!(err, RunStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn watch_cancellation_flips_on_cancel() {
        let store = InMemoryRunStore::new();
        let id = store
            .create_run("t".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let mut watcher = store.watch_cancellation(&id).await.unwrap();
        assert!(!*watcher.borrow());
        store.cancel_run(&id).await.unwrap();
        watcher.changed().await.unwrap();
        assert!(*watcher.borrow());
    }

    #[tokio::test]
    async fn list_runs_orders_most_recent_first() {
        let store = InMemoryRunStore::new();
        let a = store
            .create_run("a".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let b = store
            .create_run("b".to_string(), sample_plan(), None)
            .await
            .unwrap();
        let (ids, total) = store.list_runs(10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(ids, vec![b, a]);
    }

    #[tokio::test]
    async fn delete_run_removes_it_from_get_and_list() {
        let store = InMemoryRunStore::new();
        let a = store.create_run("a".to_string(), sample_plan(), None).await.unwrap();
        let b = store.create_run("b".to_string(), sample_plan(), None).await.unwrap();

        store.delete_run(&a).await.unwrap();

        assert!(matches!(store.get_run(&a).await, Err(RunStoreError::NotFound(_))));
        let (ids, total) = store.list_runs(10, 0).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(ids, vec![b]);
    }

    #[tokio::test]
    async fn delete_run_twice_is_not_found() {
        let store = InMemoryRunStore::new();
        let id = store.create_run("a".to_string(), sample_plan(), None).await.unwrap();
        store.delete_run(&id).await.unwrap();
        assert!(matches!(store.delete_run(&id).await, Err(RunStoreError::NotFound(_))));
    }
}
