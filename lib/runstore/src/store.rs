//! The `RunStore` trait: interface shared by the in-memory and Redis
//! adapters.

use crate::error::RunStoreError;
use crate::run::{AdapterInfo, Run, RunMeta, RunStatus};
use async_trait::async_trait;
use mentatlab_core::{EventId, RunId};
use mentatlab_event::{Event, EventInput};
use mentatlab_plan::Plan;
use tokio::sync::{mpsc, watch};

/// A live, per-subscriber feed of events appended to one run.
///
/// Dropping this value unregisters the subscriber from the store (the
/// adapter's `cleanup`); there is no separate cleanup call to make.
pub struct Subscription {
    /// Receives events appended after the subscription was registered.
    /// Closes when the run reaches terminal status and its terminal event
    /// has been delivered, when the subscriber's buffer overflows (the
    /// store drops the subscriber, not the event), or when this value is
    /// dropped.
    pub events: mpsc::Receiver<Event>,
}

/// Persists runs, plans, and each run's append-only event log; offers
/// snapshot reads, atomic append, since-ID replay, and a subscription
/// primitive. All operations are context-cancellable in the sense that
/// every `async fn` here is itself a single cancellable suspension point
/// for its caller (the scheduler / SSE layer own the surrounding
/// cancellation token).
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Assigns a fresh run ID, persists run metadata in `pending`, and
    /// initializes an empty event log.
    async fn create_run(
        &self,
        name: String,
        plan: Plan,
        owner_subject: Option<String>,
    ) -> Result<RunId, RunStoreError>;

    /// Fetches a run, including its plan.
    async fn get_run(&self, run_id: &RunId) -> Result<Run, RunStoreError>;

    /// Fetches a run's metadata only — cheap, no event log, no plan.
    async fn get_run_meta(&self, run_id: &RunId) -> Result<RunMeta, RunStoreError>;

    /// Lists run IDs, most recently created first, with the total count
    /// available regardless of `limit`/`offset`.
    async fn list_runs(&self, limit: usize, offset: usize) -> Result<(Vec<RunId>, usize), RunStoreError>;

    /// Transitions a run to `new_status`. Rejects transitions out of a
    /// terminal state and transitions that are not forward progress in the
    /// state machine.
    async fn update_run_status(
        &self,
        run_id: &RunId,
        new_status: RunStatus,
        error_if_terminal: Option<String>,
    ) -> Result<(), RunStoreError>;

    /// Assigns a fresh monotonic `id`, persists the event atomically, and
    /// notifies subscribers. Rejects appends after the run's terminal
    /// (`stream_end`) event has already been persisted.
    async fn append_event(&self, run_id: &RunId, input: EventInput) -> Result<Event, RunStoreError>;

    /// Returns every event with `id` greater than `since_id`, in order.
    /// `since_id == None` returns the full log.
    async fn get_events_since(
        &self,
        run_id: &RunId,
        since_id: Option<&EventId>,
    ) -> Result<Vec<Event>, RunStoreError>;

    /// Registers a live subscriber for events appended after this call
    /// returns. See [`Subscription`] for closing semantics.
    async fn subscribe(&self, run_id: &RunId) -> Result<Subscription, RunStoreError>;

    /// Idempotently transitions a non-terminal run to `cancelled`.
    async fn cancel_run(&self, run_id: &RunId) -> Result<(), RunStoreError>;

    /// Returns a watch channel that flips to `true` once `cancel_run` has
    /// been observed for this run — the scheduler's cancellation-detection
    /// path, independent of the event subscription.
    async fn watch_cancellation(&self, run_id: &RunId) -> Result<watch::Receiver<bool>, RunStoreError>;

    /// Removes a run and its entire event log. Not restricted to terminal
    /// runs — callers that need to forbid deleting an in-flight run enforce
    /// that above this layer.
    async fn delete_run(&self, run_id: &RunId) -> Result<(), RunStoreError>;

    /// Adapter identity and health, for readiness and `/runstore/info`.
    async fn adapter_info(&self) -> AdapterInfo;
}
