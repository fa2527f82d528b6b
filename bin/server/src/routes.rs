//! The minimum-viable HTTP surface: health/readiness, run CRUD + lifecycle,
//! the SSE event stream, and Run Store introspection.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use mentatlab_core::{EventId, RunId};
use mentatlab_plan::{Plan, Planner};
use mentatlab_runstore::RunStatus;
use mentatlab_sse::DEFAULT_HEARTBEAT_INTERVAL;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;

/// Assembles the full router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready))
        .route("/api/v1/runs", post(create_run).get(list_runs))
        .route("/api/v1/runs/{id}", get(get_run).delete(delete_run))
        .route("/api/v1/runs/{id}/start", post(start_run))
        .route("/api/v1/runs/{id}/cancel", post(cancel_run))
        .route("/api/v1/runs/{id}/events", get(stream_events))
        .route("/api/v1/runstore/info", get(runstore_info))
        .route("/api/v1/runstore/selfcheck", get(runstore_selfcheck))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> Response {
    let info = state.run_store.adapter_info().await;
    let body = json!({ "status": if info.healthy { "ready" } else { "not_ready" }, "runstore": info });
    if info.healthy {
        (StatusCode::OK, Json(body)).into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    name: String,
    plan: Plan,
    #[serde(default)]
    auto_start: bool,
    #[serde(default)]
    owner_subject: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunResponse {
    run_id: RunId,
    status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    sse_url: Option<String>,
}

fn sse_url(run_id: RunId) -> String {
    format!("/api/v1/runs/{run_id}/events")
}

/// `POST /api/v1/runs` — validates the plan, persists the run, and
/// optionally dispatches it immediately (`auto_start`). The Auth hook's
/// `ownerSubject` stamp would come from a verified request identity in a
/// full deployment; here it is accepted as an already-verified field on
/// the request, matching the Auth-hook's documented scope (no network
/// I/O, just a stamp).
async fn create_run(
    State(state): State<AppState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Response, ApiError> {
    Planner::validate(&req.plan)?;

    let run_id = state
        .run_store
        .create_run(req.name, req.plan.clone(), req.owner_subject)
        .await?;

    if req.auto_start {
        dispatch(&state, run_id, req.plan);
    }

    let status = if req.auto_start {
        RunStatus::Running
    } else {
        RunStatus::Pending
    };
    let body = CreateRunResponse {
        run_id,
        status,
        sse_url: req.auto_start.then(|| sse_url(run_id)),
    };
    Ok((StatusCode::CREATED, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
struct ListRunsQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ListRunsResponse {
    runs: Vec<RunId>,
    total: usize,
    limit: usize,
    offset: usize,
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<Json<ListRunsResponse>, ApiError> {
    let (runs, total) = state.run_store.list_runs(query.limit, query.offset).await?;
    Ok(Json(ListRunsResponse {
        runs,
        total,
        limit: query.limit,
        offset: query.offset,
    }))
}

fn parse_run_id(id: &str) -> Result<RunId, ApiError> {
    RunId::from_str(id).map_err(|e| ApiError::InvalidRequest(e.to_string()))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<mentatlab_runstore::Run>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.run_store.get_run(&run_id).await?;
    Ok(Json(run))
}

async fn delete_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let run_id = parse_run_id(&id)?;
    state.run_store.delete_run(&run_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartRunResponse {
    run_id: RunId,
    status: RunStatus,
    sse_url: String,
}

/// `POST /api/v1/runs/{id}/start` — dispatches a previously-created run
/// that was not auto-started. `409` if the run already reached terminal
/// status.
async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StartRunResponse>, ApiError> {
    let run_id = parse_run_id(&id)?;
    let run = state.run_store.get_run(&run_id).await?;
    if run.meta.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "run is already in terminal status {:?}",
            run.meta.status
        )));
    }

    dispatch(&state, run_id, run.plan);

    Ok(Json(StartRunResponse {
        run_id,
        status: RunStatus::Running,
        sse_url: sse_url(run_id),
    }))
}

/// Spawns the per-run driving task. Fire-and-forget: the scheduler itself
/// owns every subsequent status/event transition through the Run Store, so
/// the HTTP handler doesn't need to await it.
fn dispatch(state: &AppState, run_id: RunId, plan: Plan) {
    let scheduler = mentatlab_scheduler::Scheduler::new(
        std::sync::Arc::clone(&state.run_store),
        std::sync::Arc::clone(&state.executor),
        state.scheduler_config,
    );
    tokio::spawn(async move {
        if let Err(err) = scheduler.drive(run_id, plan).await {
            tracing::error!(run = %run_id, error = %err, "scheduler drive failed");
        }
    });
}

async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let run_id = parse_run_id(&id)?;
    state.run_store.cancel_run(&run_id).await?;
    Ok(Json(json!({ "status": "cancelled" })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    last_event_id: Option<String>,
}

/// `GET /api/v1/runs/{id}/events` — opens the SSE body stream. `404` is
/// returned before any bytes are written if the run is unknown; the
/// `Last-Event-ID` header takes precedence over the same-named query
/// parameter, matching how browsers' native `EventSource` resume works.
async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let run_id = parse_run_id(&id)?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or(query.last_event_id)
        .map(|s| EventId::from_str(&s))
        .transpose()
        .map_err(|e: mentatlab_core::ParseEventIdError| ApiError::InvalidRequest(e.to_string()))?;

    let stream = mentatlab_sse::build_stream(
        std::sync::Arc::clone(&state.run_store),
        run_id,
        last_event_id,
        DEFAULT_HEARTBEAT_INTERVAL,
    )
    .await
    .map_err(|_| ApiError::RunNotFound(run_id.to_string()))?;

    let body_stream = futures::StreamExt::map(stream, |frame| {
        Ok::<_, std::convert::Infallible>(axum::body::Bytes::from(frame.0))
    });

    let mut response = Response::new(axum::body::Body::from_stream(body_stream));
    *response.headers_mut() = mentatlab_sse::sse_headers();
    Ok(response)
}

async fn runstore_info(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.run_store.adapter_info().await)
}

async fn runstore_selfcheck(State(state): State<AppState>) -> Response {
    let start = std::time::Instant::now();
    match state.run_store.list_runs(1, 0).await {
        Ok((_, total)) => {
            let latency_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            (
                StatusCode::OK,
                Json(json!({ "status": "ok", "latency_ms": latency_ms, "event_count": total })),
            )
                .into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "runstore selfcheck failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "status": "error", "message": err.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let config = crate::config::ServerConfig::from_env().unwrap_or_else(|_| {
            config::Config::builder()
                .build()
                .unwrap()
                .try_deserialize()
                .unwrap()
        });
        AppState::build(&config).await.unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_and_fetch_a_run_round_trips() {
        let app = router(test_state().await);
        let plan = json!({ "nodes": [], "edges": [] });
        let create_body = json!({ "name": "t", "plan": plan }).to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(create_body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let run_id = created["runId"].as_str().unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_run_with_cycle_is_rejected() {
        let app = router(test_state().await);
        let plan = json!({
            "nodes": [
                {"id": "a", "type": "builtin"},
                {"id": "b", "type": "builtin"},
            ],
            "edges": [["a", "b"], ["b", "a"]],
        });
        let body = json!({ "name": "t", "plan": plan }).to_string();
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_run_is_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/runs/{}", RunId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete_then_get_is_404() {
        let app = router(test_state().await);
        let body = json!({ "name": "t", "plan": { "nodes": [], "edges": [] } }).to_string();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/runs")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let created: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let run_id = created["runId"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/v1/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/runs/{run_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
