//! Per-connection SSE stream construction: the 8-step contract driving the
//! `GET /api/v1/runs/{id}/events` endpoint.
//!
//! Grounded on the `async_stream::stream!`-based SSE handler pattern used
//! for a run's live event feed elsewhere in this ecosystem, generalized
//! with backfill-dedupe and a synthesized terminal event this store's
//! adapters don't themselves append.

use async_stream::stream;
use futures::stream::Stream;
use mentatlab_core::{EventId, RunId};
use mentatlab_event::{Event, EventType};
use mentatlab_runstore::{RunStore, RunStoreError};
use std::sync::Arc;
use std::time::Duration;

/// Default interval between heartbeat comments, per the SSE contract.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A single rendered SSE wire frame — already-framed bytes, ready to write
/// directly to the response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(pub String);

/// `run_id` is not known to the store; the caller should return 404
/// without ever opening the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunNotFound;

/// Builds the SSE body stream for `run_id`, applying the full contract:
/// synthetic `hello`, optional `Last-Event-ID` backfill deduped against the
/// live tail by a running `highestEmittedID`, heartbeats every
/// `heartbeat_interval`, and exactly one terminal `stream_end` — the run's
/// own if one arrives, else one synthesized from the run's current status.
///
/// # Errors
///
/// Returns [`RunNotFound`] if `run_id` has no run in `run_store`, checked
/// before any bytes are written.
pub async fn build_stream(
    run_store: Arc<dyn RunStore>,
    run_id: RunId,
    last_event_id: Option<EventId>,
    heartbeat_interval: Duration,
) -> Result<impl Stream<Item = Frame>, RunNotFound> {
    run_store.get_run_meta(&run_id).await.map_err(|_| RunNotFound)?;

    let backfill = match &last_event_id {
        Some(since) => run_store
            .get_events_since(&run_id, Some(since))
            .await
            .unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(stream! {
        yield Frame(Event::hello(run_id, chrono::Utc::now()).to_sse_frame());

        let mut highest: Option<EventId> = last_event_id;
        let mut already_ended = false;
        for event in &backfill {
            highest = Some(event.id.clone());
            yield Frame(event.to_sse_frame());
            if event.event_type == EventType::StreamEnd {
                already_ended = true;
            }
        }

        if !already_ended {
            let mut subscription = match run_store.subscribe(&run_id).await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(run = %run_id, error = %e, "could not subscribe for live tail");
                    yield Frame(Event::new(
                        EventId::zero(),
                        run_id,
                        None,
                        EventType::Log,
                        chrono::Utc::now(),
                        serde_json::json!({"level": "error", "message": "event store unavailable"}),
                    ).to_sse_frame());
                    None
                }
            };

            if let Some(sub) = &mut subscription {
                let mut heartbeat = tokio::time::interval(heartbeat_interval);
                heartbeat.tick().await; // first tick fires immediately; skip it
                'live: loop {
                    tokio::select! {
                        biased;
                        event = sub.events.recv() => {
                            match event {
                                Some(event) => {
                                    let is_new = match &highest {
                                        Some(h) => event.id > *h,
                                        None => true,
                                    };
                                    if is_new {
                                        highest = Some(event.id.clone());
                                        let ended = event.event_type == EventType::StreamEnd;
                                        yield Frame(event.to_sse_frame());
                                        if ended {
                                            already_ended = true;
                                            break 'live;
                                        }
                                    }
                                }
                                None => break 'live,
                            }
                        }
                        _ = heartbeat.tick() => {
                            yield Frame(mentatlab_event::heartbeat_frame().to_string());
                        }
                    }
                }
            }
        }

        if !already_ended {
            yield terminal_frame(&run_store, &run_id).await;
        }
    })
}

/// Synthesizes a terminal `stream_end` frame from the run's current
/// metadata, for when the live tail ended without ever delivering the
/// run's own `stream_end` event (subscriber dropped for backpressure, the
/// run store restarted, ...).
async fn terminal_frame(run_store: &Arc<dyn RunStore>, run_id: &RunId) -> Frame {
    let data = match run_store.get_run_meta(run_id).await {
        Ok(meta) => {
            let mut data = serde_json::json!({ "status": status_wire(meta.status) });
            if let Some(err) = meta.error {
                data["error"] = serde_json::Value::String(err);
            }
            data
        }
        Err(RunStoreError::NotFound(_)) => serde_json::json!({ "status": "unknown" }),
        Err(_) => serde_json::json!({ "status": "unknown" }),
    };
    Frame(format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        EventId::zero(),
        EventType::StreamEnd.as_str(),
        data
    ))
}

fn status_wire(status: mentatlab_runstore::RunStatus) -> &'static str {
    use mentatlab_runstore::RunStatus as S;
    match status {
        S::Pending => "pending",
        S::Running => "running",
        S::Succeeded => "succeeded",
        S::Failed => "failed",
        S::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use mentatlab_event::EventInput;
    use mentatlab_plan::Plan;
    use mentatlab_runstore::InMemoryRunStore;

    async fn store_with_run() -> (Arc<dyn RunStore>, RunId) {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let run_id = store
            .create_run("t".to_string(), Plan::new(vec![], vec![]), None)
            .await
            .unwrap();
        (store, run_id)
    }

    #[tokio::test]
    async fn unknown_run_is_rejected_before_any_frame() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let err = build_stream(store, RunId::new(), None, DEFAULT_HEARTBEAT_INTERVAL)
            .await
            .err();
        assert_eq!(err, Some(RunNotFound));
    }

    #[tokio::test]
    async fn first_frame_is_hello_with_sentinel_id() {
        let (store, run_id) = store_with_run().await;
        terminate_with_stream_end(&store, &run_id).await;
        let stream = build_stream(store, run_id, None, Duration::from_millis(50)).await.unwrap();
        tokio::pin!(stream);
        let first = stream.next().await.unwrap();
        assert!(first.0.starts_with("id: 0\nevent: hello\n"));
    }

    #[tokio::test]
    async fn stream_closes_on_the_runs_own_stream_end_event() {
        let (store, run_id) = store_with_run().await;
        terminate_with_stream_end(&store, &run_id).await;
        let stream = build_stream(Arc::clone(&store), run_id, None, Duration::from_millis(20))
            .await
            .unwrap();
        let frames: Vec<Frame> = stream.collect().await;
        let last = frames.last().unwrap();
        assert!(last.0.contains("event: stream_end"));
        assert!(last.0.contains("\"status\":\"succeeded\""));
        let stream_end_count = frames.iter().filter(|f| f.0.contains("event: stream_end")).count();
        assert_eq!(stream_end_count, 1, "must not double up real and synthetic terminal events");
    }

    #[tokio::test]
    async fn missing_stream_end_falls_back_to_synthesized_one() {
        // A run that reached terminal status but (e.g. crash) never got
        // its own `stream_end` appended still needs a terminal frame.
        let (store, run_id) = store_with_run().await;
        store
            .update_run_status(&run_id, mentatlab_runstore::RunStatus::Succeeded, None)
            .await
            .unwrap();

        let frame = terminal_frame(&store, &run_id).await;
        assert!(frame.0.contains("event: stream_end"));
        assert!(frame.0.contains("\"status\":\"succeeded\""));
    }

    #[tokio::test]
    async fn last_event_id_backfill_is_not_repeated_on_live_tail() {
        let (store, run_id) = store_with_run().await;
        let e1 = store
            .append_event(&run_id, EventInput::new(mentatlab_event::EventType::Log, serde_json::json!({"n": 1})))
            .await
            .unwrap();
        terminate_with_stream_end(&store, &run_id).await;

        let stream = build_stream(Arc::clone(&store), run_id, Some(e1.id.clone()), Duration::from_millis(20))
            .await
            .unwrap();
        let frames: Vec<Frame> = stream.collect().await;
        let log_frames = frames.iter().filter(|f| f.0.contains("event: log")).count();
        assert_eq!(log_frames, 0, "event already covered by Last-Event-ID must not repeat");
    }

    async fn terminate_with_stream_end(store: &Arc<dyn RunStore>, run_id: &RunId) {
        store
            .update_run_status(run_id, mentatlab_runstore::RunStatus::Succeeded, None)
            .await
            .unwrap();
        store
            .append_event(
                run_id,
                EventInput::new(EventType::StreamEnd, serde_json::json!({"status": "succeeded"})),
            )
            .await
            .unwrap();
    }
}
