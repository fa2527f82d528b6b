//! Process-wide state: the Run Store, the Workload Executor, and the
//! Scheduler configuration every `/api/v1/runs/*` handler shares.

use mentatlab_executor::{InProcessExecutor, InProcessRegistry, WorkloadExecutor};
use mentatlab_runstore::{InMemoryRunStore, RedisConfig, RedisRunStore, RunStore};
use mentatlab_scheduler::SchedulerConfig;
use std::sync::Arc;

use crate::config::ServerConfig;

/// Shared application state, cloned cheaply into every handler via axum's
/// `State` extractor.
#[derive(Clone)]
pub struct AppState {
    /// The active Run Store adapter.
    pub run_store: Arc<dyn RunStore>,
    /// The active Workload Executor adapter.
    pub executor: Arc<dyn WorkloadExecutor>,
    /// Concurrency/retry defaults passed to every [`mentatlab_scheduler::Scheduler`].
    pub scheduler_config: SchedulerConfig,
}

impl AppState {
    /// Constructs process-wide state from configuration: selects the
    /// in-memory or Redis Run Store per `ORCH_RUNSTORE`, and wires an
    /// in-process Workload Executor (no node functions registered — the
    /// core trusts the plan it receives and treats the agent manifest
    /// registry as an out-of-scope collaborator).
    ///
    /// # Errors
    ///
    /// Returns an error if `ORCH_RUNSTORE=redis` and the Redis connection
    /// cannot be established.
    pub async fn build(config: &ServerConfig) -> Result<Self, mentatlab_runstore::RunStoreError> {
        let run_store: Arc<dyn RunStore> = if config.uses_redis() {
            let mut redis_config = RedisConfig::new(config.redis_url.clone());
            redis_config.password = config.redis_password.clone();
            redis_config.db = config.redis_db.unwrap_or(0);
            redis_config.run_ttl_seconds = config.runstore_ttl;
            redis_config.event_max_len = config.event_max_len;
            Arc::new(RedisRunStore::connect(redis_config).await?)
        } else {
            Arc::new(InMemoryRunStore::new())
        };

        let executor: Arc<dyn WorkloadExecutor> = Arc::new(InProcessExecutor::new(
            InProcessRegistry::new(),
            Arc::clone(&run_store),
        ));

        Ok(Self {
            run_store,
            executor,
            scheduler_config: config.into(),
        })
    }
}
