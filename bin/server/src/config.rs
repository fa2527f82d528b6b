//! Centralized server configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate from
//! environment variables, covering every variable the HTTP gateway
//! recognizes: listen port, which Run Store adapter to use, Redis
//! connection details, and the Scheduler's concurrency/retry defaults.
//! Field names match the environment variables verbatim (lowercased) so a
//! flat `Environment` source maps onto them without nesting.

use serde::Deserialize;

/// Server configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Which Run Store adapter to construct: `"memory"` or `"redis"`.
    #[serde(default = "default_runstore")]
    pub orch_runstore: String,

    /// Redis connection URL, used only when `orch_runstore == "redis"`.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Redis password, if the server requires authentication.
    #[serde(default)]
    pub redis_password: Option<String>,
    /// Redis logical database index.
    #[serde(default)]
    pub redis_db: Option<i64>,

    /// Retention, in seconds, applied to a run once it reaches terminal
    /// status (Redis adapter).
    #[serde(default = "default_runstore_ttl")]
    pub runstore_ttl: u64,
    /// Per-run event stream trim length (Redis adapter).
    #[serde(default = "default_event_max_len")]
    pub event_max_len: u64,

    /// Global active-node bound; `0` means unlimited.
    #[serde(default = "default_max_parallelism")]
    pub orch_max_parallelism: usize,
    /// Default per-node retry count for nodes that don't declare their
    /// own.
    #[serde(default = "default_max_retries")]
    pub orch_max_retries_default: u32,
    /// Default initial backoff, in seconds, for nodes that don't declare
    /// their own.
    #[serde(default = "default_backoff_seconds")]
    pub orch_backoff_seconds_default: u64,

    /// Time to drain SSE connections and active runs on `SIGTERM`, in
    /// seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace: u64,
}

fn default_port() -> u16 {
    8080
}

fn default_runstore() -> String {
    "memory".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_runstore_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_event_max_len() -> u64 {
    10_000
}

fn default_max_parallelism() -> usize {
    0
}

fn default_max_retries() -> u32 {
    0
}

fn default_backoff_seconds() -> u64 {
    1
}

fn default_shutdown_grace() -> u64 {
    10
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a recognized variable is present but fails to
    /// parse into its declared type.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Whether this configuration selects the Redis Run Store adapter.
    #[must_use]
    pub fn uses_redis(&self) -> bool {
        self.orch_runstore.eq_ignore_ascii_case("redis")
    }
}

impl From<&ServerConfig> for mentatlab_scheduler::SchedulerConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            max_per_run: 0,
            max_global: config.orch_max_parallelism,
            default_max_retries: config.orch_max_retries_default,
            default_backoff_seconds: config.orch_backoff_seconds_default,
        }
    }
}
