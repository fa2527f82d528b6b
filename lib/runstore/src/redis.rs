//! Redis Run Store adapter.
//!
//! Follows the configuration/construction idiom of the workflow engine's
//! NATS adapter this crate descends from: a config struct with sensible
//! defaults, an async constructor that connects and provisions whatever
//! server-side resources it needs, and a trait impl with small
//! error-mapping helpers rather than `?`-propagating raw driver errors.
//!
//! Key layout (see spec §6, "Persisted state (Redis adapter)"):
//! - `run:{runId}:meta` — hash of run metadata fields, including the plan
//!   as a JSON string. TTL'd to `run_ttl` once the run reaches terminal
//!   status.
//! - `run:{runId}:events` — an append-only stream; entries carry `type`,
//!   `timestamp`, `nodeID` (optional), `data` (JSON string); trimmed with
//!   `MAXLEN ~ event_max_len`. The stream's native entry ID *is* the
//!   event's monotonic id — ids are never synthesized here, they come
//!   from the server, so two processes racing an append can never
//!   collide.
//! - `run:{runId}:notify` — a pub/sub channel carrying opaque "new event
//!   appended" notifications; subscribers re-read via `GetEventsSince`.
//! - `runs:index` — a sorted set of run IDs scored by creation time, for
//!   `ListRuns`.

use crate::error::RunStoreError;
use crate::run::{AdapterInfo, Run, RunMeta, RunStatus};
use crate::store::{RunStore, Subscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mentatlab_core::{EventId, RunId};
use mentatlab_event::{Event, EventInput, EventType};
use mentatlab_plan::Plan;
use redis::AsyncCommands;
use redis::IntoConnectionInfo;
use redis::aio::ConnectionManager;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

const DEFAULT_RUN_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_EVENT_MAX_LEN: u64 = 10_000;
const NOTIFY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Configuration for the Redis adapter. Overridable fields default to the
/// values named in the environment-variable table (§6); callers typically
/// build this straight from `bin/server`'s parsed config.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// `redis://` connection URL.
    pub url: String,
    /// Optional password, applied via `AUTH` on connect if `url` doesn't
    /// already carry one.
    pub password: Option<String>,
    /// Logical database index, applied via `SELECT` on connect.
    pub db: i64,
    /// Retention for terminal runs, in seconds.
    pub run_ttl_seconds: u64,
    /// Per-run event stream trim length.
    pub event_max_len: u64,
}

impl RedisConfig {
    /// Creates a config pointed at `url` with every other field defaulted.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            password: None,
            db: 0,
            run_ttl_seconds: DEFAULT_RUN_TTL_SECONDS,
            event_max_len: DEFAULT_EVENT_MAX_LEN,
        }
    }
}

fn unavailable(err: impl std::fmt::Display) -> RunStoreError {
    RunStoreError::Unavailable(err.to_string())
}

/// Builds a client from `config`, applying `password`/`db` on top of the
/// URL's own connection info rather than requiring either to be embedded
/// in `url` itself.
fn build_client(config: &RedisConfig) -> Result<redis::Client, RunStoreError> {
    let mut info = config.url.as_str().into_connection_info().map_err(unavailable)?;
    if let Some(password) = &config.password {
        info.redis.password = Some(password.clone());
    }
    info.redis.db = config.db;
    redis::Client::open(info).map_err(unavailable)
}

/// The Redis [`RunStore`] adapter.
#[derive(Clone)]
pub struct RedisRunStore {
    manager: ConnectionManager,
    config: RedisConfig,
}

impl RedisRunStore {
    /// Connects to Redis and returns a ready-to-use adapter.
    ///
    /// # Errors
    ///
    /// Returns [`RunStoreError::Unavailable`] if the initial connection
    /// fails.
    pub async fn connect(config: RedisConfig) -> Result<Self, RunStoreError> {
        let client = build_client(&config)?;
        let manager = client.get_connection_manager().await.map_err(unavailable)?;
        Ok(Self { manager, config })
    }

    fn meta_key(run_id: &RunId) -> String {
        format!("run:{run_id}:meta")
    }

    fn events_key(run_id: &RunId) -> String {
        format!("run:{run_id}:events")
    }

    fn notify_channel(run_id: &RunId) -> String {
        format!("run:{run_id}:notify")
    }

    const RUN_INDEX_KEY: &'static str = "runs:index";

    async fn meta_from_hash(&self, run_id: &RunId) -> Result<RunMeta, RunStoreError> {
        let mut conn = self.manager.clone();
        let fields: std::collections::HashMap<String, String> =
            conn.hgetall(Self::meta_key(run_id)).await.map_err(unavailable)?;
        if fields.is_empty() {
            return Err(RunStoreError::NotFound(run_id.to_string()));
        }
        decode_meta(*run_id, &fields)
    }

    async fn mark_terminal_ttl(&self, run_id: &RunId) -> Result<(), RunStoreError> {
        let mut conn = self.manager.clone();
        let ttl = i64::try_from(self.config.run_ttl_seconds).unwrap_or(i64::MAX);
        let _: () = conn
            .expire(Self::meta_key(run_id), ttl)
            .await
            .map_err(unavailable)?;
        let _: () = conn
            .expire(Self::events_key(run_id), ttl)
            .await
            .map_err(unavailable)?;
        Ok(())
    }
}

fn decode_meta(
    id: RunId,
    fields: &std::collections::HashMap<String, String>,
) -> Result<RunMeta, RunStoreError> {
    let get = |k: &str| fields.get(k).cloned();
    let status = match get("status").as_deref() {
        Some("pending") => RunStatus::Pending,
        Some("running") => RunStatus::Running,
        Some("succeeded") => RunStatus::Succeeded,
        Some("failed") => RunStatus::Failed,
        Some("cancelled") => RunStatus::Cancelled,
        other => {
            return Err(RunStoreError::Unavailable(format!(
                "corrupt run metadata: unknown status {other:?}"
            )));
        }
    };
    let parse_time = |s: Option<String>| -> Option<DateTime<Utc>> {
        s.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };
    Ok(RunMeta {
        id,
        name: get("name").unwrap_or_default(),
        status,
        created_at: parse_time(get("createdAt")).unwrap_or_else(Utc::now),
        started_at: parse_time(get("startedAt")),
        finished_at: parse_time(get("finishedAt")),
        error: get("error"),
        owner_subject: get("ownerSubject"),
    })
}

#[async_trait]
impl RunStore for RedisRunStore {
    async fn create_run(
        &self,
        name: String,
        plan: Plan,
        owner_subject: Option<String>,
    ) -> Result<RunId, RunStoreError> {
        let id = RunId::new();
        let now = Utc::now();
        let plan_json = serde_json::to_string(&plan).map_err(unavailable)?;

        let mut conn = self.manager.clone();
        let mut fields: Vec<(&str, String)> = vec![
            ("status", "pending".to_string()),
            ("name", name),
            ("createdAt", now.to_rfc3339()),
            ("plan", plan_json),
        ];
        if let Some(subject) = owner_subject {
            fields.push(("ownerSubject", subject));
        }

        let _: () = conn
            .hset_multiple(Self::meta_key(&id), &fields)
            .await
            .map_err(unavailable)?;
        let score = f64::from(u32::try_from(now.timestamp()).unwrap_or(0));
        let _: () = conn
            .zadd(Self::RUN_INDEX_KEY, id.to_string(), score)
            .await
            .map_err(unavailable)?;
        Ok(id)
    }

    async fn get_run(&self, run_id: &RunId) -> Result<Run, RunStoreError> {
        let meta = self.meta_from_hash(run_id).await?;
        let mut conn = self.manager.clone();
        let plan_json: String = conn
            .hget(Self::meta_key(run_id), "plan")
            .await
            .map_err(unavailable)?;
        let plan: Plan = serde_json::from_str(&plan_json).map_err(unavailable)?;
        Ok(Run { meta, plan })
    }

    async fn get_run_meta(&self, run_id: &RunId) -> Result<RunMeta, RunStoreError> {
        self.meta_from_hash(run_id).await
    }

    async fn list_runs(&self, limit: usize, offset: usize) -> Result<(Vec<RunId>, usize), RunStoreError> {
        let mut conn = self.manager.clone();
        let total: usize = conn.zcard(Self::RUN_INDEX_KEY).await.map_err(unavailable)?;
        let start = i64::try_from(offset).unwrap_or(i64::MAX);
        let stop = i64::try_from(offset + limit).unwrap_or(i64::MAX).saturating_sub(1);
        let ids: Vec<String> = conn
            .zrevrange(Self::RUN_INDEX_KEY, start, stop)
            .await
            .map_err(unavailable)?;
        let ids = ids
            .into_iter()
            .filter_map(|s| RunId::from_str(&s).ok())
            .collect();
        Ok((ids, total))
    }

    async fn update_run_status(
        &self,
        run_id: &RunId,
        new_status: RunStatus,
        error_if_terminal: Option<String>,
    ) -> Result<(), RunStoreError> {
        let current = self.meta_from_hash(run_id).await?;
        if current.status == new_status || current.status.is_terminal() {
            return Err(RunStoreError::Conflict(format!(
                "illegal transition {:?} -> {new_status:?}",
                current.status
            )));
        }

        let mut conn = self.manager.clone();
        let now = Utc::now();
        let status_str = match new_status {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        let mut fields: Vec<(&str, String)> = vec![("status", status_str.to_string())];
        if current.status == RunStatus::Pending && new_status == RunStatus::Running {
            fields.push(("startedAt", now.to_rfc3339()));
        }
        if new_status.is_terminal() {
            fields.push(("finishedAt", now.to_rfc3339()));
            if let Some(err) = error_if_terminal {
                fields.push(("error", err));
            }
        }
        let _: () = conn
            .hset_multiple(Self::meta_key(run_id), &fields)
            .await
            .map_err(unavailable)?;

        if new_status.is_terminal() {
            self.mark_terminal_ttl(run_id).await?;
        }
        Ok(())
    }

    async fn append_event(&self, run_id: &RunId, input: EventInput) -> Result<Event, RunStoreError> {
        // Ensure the run exists and reject appends after finalization by
        // checking the meta hash's status plus a sentinel field set once
        // stream_end has been written.
        let meta_key = Self::meta_key(run_id);
        let mut conn = self.manager.clone();
        let finalized: Option<String> = conn
            .hget(meta_key.clone(), "finalized")
            .await
            .map_err(unavailable)?;
        if finalized.is_some() {
            return Err(RunStoreError::Conflict(
                "run already finalized: no further appends accepted".to_string(),
            ));
        }
        // Confirms the run exists; NotFound otherwise.
        let _ = self.meta_from_hash(run_id).await?;

        let now = Utc::now();
        let data_json = serde_json::to_string(&input.data).map_err(unavailable)?;
        let mut items: Vec<(&str, String)> = vec![
            ("type", input.event_type.as_str().to_string()),
            ("timestamp", now.to_rfc3339()),
            ("data", data_json),
        ];
        if let Some(node_id) = &input.node_id {
            items.push(("nodeID", node_id.clone()));
        }

        let entry_id: String = redis::cmd("XADD")
            .arg(Self::events_key(run_id))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.config.event_max_len)
            .arg("*")
            .arg(&items)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let id = EventId::from_str(&entry_id).map_err(unavailable)?;

        if input.event_type == EventType::StreamEnd {
            let _: () = conn
                .hset(meta_key, "finalized", "1")
                .await
                .map_err(unavailable)?;
        }

        let _: () = conn
            .publish(Self::notify_channel(run_id), "event")
            .await
            .map_err(unavailable)?;

        Ok(Event::new(id, *run_id, input.node_id, input.event_type, now, input.data))
    }

    async fn get_events_since(
        &self,
        run_id: &RunId,
        since_id: Option<&EventId>,
    ) -> Result<Vec<Event>, RunStoreError> {
        let mut conn = self.manager.clone();
        let start = match since_id {
            None => "-".to_string(),
            Some(id) => format!("({}", id.as_str()),
        };
        let entries: Vec<(String, std::collections::HashMap<String, String>)> = redis::cmd("XRANGE")
            .arg(Self::events_key(run_id))
            .arg(start)
            .arg("+")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        entries
            .into_iter()
            .map(|(entry_id, fields)| decode_event(*run_id, &entry_id, &fields))
            .collect()
    }

    async fn subscribe(&self, run_id: &RunId) -> Result<Subscription, RunStoreError> {
        // Per the invariant in §4.2 Adapter B: register with the pub/sub
        // channel *before* reading the head position, so no notification
        // can be missed between "start listening" and "know where we are".
        let client = build_client(&self.config)?;
        let mut pubsub = client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub
            .subscribe(Self::notify_channel(run_id))
            .await
            .map_err(unavailable)?;

        let (tx, rx) = mpsc::channel(256);
        let store = self.clone();
        let run_id = *run_id;
        let mut last_id = self
            .get_events_since(&run_id, None)
            .await?
            .last()
            .map(|e| e.id.clone());

        tokio::spawn(async move {
            use futures::StreamExt;
            let mut stream = pubsub.into_on_message();
            loop {
                // Wake on notification, but also poll periodically in case
                // a notification is itself dropped — "at-least-once" is
                // the delivery promise, not "exactly-once".
                if let Ok(None) = tokio::time::timeout(NOTIFY_POLL_INTERVAL, stream.next()).await {
                    break; // pubsub connection closed
                }
                let since = last_id.as_ref();
                let Ok(events) = store.get_events_since(&run_id, since).await else {
                    continue;
                };
                for event in events {
                    last_id = Some(event.id.clone());
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
                let Ok(meta) = store.get_run_meta(&run_id).await else {
                    return;
                };
                if meta.status.is_terminal() {
                    // One last drain in case stream_end landed between the
                    // last GetEventsSince call and here.
                    if let Ok(events) = store.get_events_since(&run_id, last_id.as_ref()).await {
                        for event in events {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    return;
                }
            }
        });

        Ok(Subscription { events: rx })
    }

    async fn cancel_run(&self, run_id: &RunId) -> Result<(), RunStoreError> {
        let meta = self.meta_from_hash(run_id).await?;
        if meta.status == RunStatus::Cancelled {
            return Ok(());
        }
        if meta.status.is_terminal() {
            return Err(RunStoreError::Conflict(format!(
                "cannot cancel a run already in terminal status {:?}",
                meta.status
            )));
        }
        let mut conn = self.manager.clone();
        let now = Utc::now();
        let fields = [
            ("status", "cancelled".to_string()),
            ("finishedAt", now.to_rfc3339()),
        ];
        let _: () = conn
            .hset_multiple(Self::meta_key(run_id), &fields)
            .await
            .map_err(unavailable)?;
        self.mark_terminal_ttl(run_id).await?;
        let _: () = conn
            .publish(Self::notify_channel(run_id), "cancelled")
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn watch_cancellation(&self, run_id: &RunId) -> Result<watch::Receiver<bool>, RunStoreError> {
        let (tx, rx) = watch::channel(false);
        let store = self.clone();
        let run_id = *run_id;
        tokio::spawn(async move {
            loop {
                match store.get_run_meta(&run_id).await {
                    Ok(meta) if meta.status == RunStatus::Cancelled => {
                        let _ = tx.send(true);
                        return;
                    }
                    Ok(meta) if meta.status.is_terminal() => return,
                    Ok(_) => {}
                    Err(_) => return,
                }
                tokio::time::sleep(NOTIFY_POLL_INTERVAL).await;
            }
        });
        Ok(rx)
    }

    async fn delete_run(&self, run_id: &RunId) -> Result<(), RunStoreError> {
        self.meta_from_hash(run_id).await?;
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(&[Self::meta_key(run_id), Self::events_key(run_id)])
            .await
            .map_err(unavailable)?;
        let _: () = conn
            .zrem(Self::RUN_INDEX_KEY, run_id.to_string())
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn adapter_info(&self) -> AdapterInfo {
        let mut conn = self.manager.clone();
        let start = std::time::Instant::now();
        let healthy = redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok();
        let latency_hint_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
        AdapterInfo {
            adapter_type: "redis".to_string(),
            healthy,
            latency_hint_ms,
        }
    }
}

fn decode_event(
    run_id: RunId,
    entry_id: &str,
    fields: &std::collections::HashMap<String, String>,
) -> Result<Event, RunStoreError> {
    let id = EventId::from_str(entry_id).map_err(unavailable)?;
    let event_type = match fields.get("type").map(String::as_str) {
        Some("log") => EventType::Log,
        Some("checkpoint") => EventType::Checkpoint,
        Some("metric") => EventType::Metric,
        Some("node_status") => EventType::NodeStatus,
        Some("result") => EventType::Result,
        Some("stream_start") => EventType::StreamStart,
        Some("stream_data") => EventType::StreamData,
        Some("stream_end") => EventType::StreamEnd,
        Some("hello") => EventType::Hello,
        other => {
            return Err(RunStoreError::Unavailable(format!(
                "corrupt event: unknown type {other:?}"
            )));
        }
    };
    let timestamp = fields
        .get("timestamp")
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let data = fields
        .get("data")
        .map(|s| serde_json::from_str(s).unwrap_or(serde_json::Value::Null))
        .unwrap_or(serde_json::Value::Null);
    Ok(Event::new(
        id,
        run_id,
        fields.get("nodeID").cloned(),
        event_type,
        timestamp,
        data,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = RedisConfig::new("redis://localhost");
        assert_eq!(cfg.run_ttl_seconds, DEFAULT_RUN_TTL_SECONDS);
        assert_eq!(cfg.event_max_len, DEFAULT_EVENT_MAX_LEN);
        assert_eq!(cfg.db, 0);
    }

    #[test]
    fn key_naming() {
        let id = RunId::new();
        assert!(RedisRunStore::meta_key(&id).starts_with("run:"));
        assert!(RedisRunStore::meta_key(&id).ends_with(":meta"));
        assert!(RedisRunStore::events_key(&id).ends_with(":events"));
        assert!(RedisRunStore::notify_channel(&id).ends_with(":notify"));
    }

    #[test]
    fn decode_meta_rejects_unknown_status() {
        let mut fields = std::collections::HashMap::new();
        fields.insert("status".to_string(), "bogus".to_string());
        let err = decode_meta(RunId::new(), &fields).unwrap_err();
        assert!(matches!(err, RunStoreError::Unavailable(_)));
    }
}
