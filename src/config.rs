//! Configuration types.
//!
//! Every struct has sensible defaults; `AppConfig::from_env()` overrides
//! them from `CONVEYOR_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::compaction::CompactorConfig;
use crate::error::ConfigError;

/// Which loops this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// HTTP server + scheduler ticker (relies on external workers).
    Serve,
    /// Worker only: polls the shared queue.
    Work,
    /// Everything in one process (single-node deployment).
    All,
}

impl RunMode {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "serve" => Ok(RunMode::Serve),
            "work" => Ok(RunMode::Work),
            "all" => Ok(RunMode::All),
            other => Err(ConfigError::InvalidValue {
                key: "CONVEYOR_MODE".to_string(),
                message: format!("expected serve|work|all, got '{other}'"),
            }),
        }
    }

    pub fn serves_http(&self) -> bool {
        matches!(self, RunMode::Serve | RunMode::All)
    }

    pub fn runs_worker(&self) -> bool {
        matches!(self, RunMode::Work | RunMode::All)
    }
}

/// Queue and stream-log tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Stream logs expire this long after their last append.
    pub stream_ttl: Duration,
    /// How often the TTL sweep runs.
    pub sweep_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stream_ttl: Duration::from_secs(600), // 10 minutes
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Stream relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Base sleep between empty reads.
    pub poll_interval: Duration,
    /// Random jitter added on top of `poll_interval` (milliseconds).
    pub max_jitter_ms: u64,
    /// Give up after this long without a new chunk or sentinel.
    pub max_idle: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            max_jitter_ms: 100,
            max_idle: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Worker loop tuning.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Maximum agent steps (model calls) per job.
    pub max_steps: usize,
    /// Model-call retries within a single step.
    pub model_retries: usize,
    /// System prompt prepended to every conversation window.
    pub system_prompt: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_steps: 20,
            model_retries: 2,
            system_prompt: "You are a research agent. Use the available tools to \
                            complete the task, then reply with your findings."
                .to_string(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: RunMode,
    pub bind_addr: String,
    pub db_path: PathBuf,
    /// Static shared secret guarding POST /cron/tick.
    pub cron_secret: Option<String>,
    /// Scheduler tick interval when the internal ticker is enabled.
    pub tick_interval: Duration,
    pub queue: QueueConfig,
    pub relay: RelayConfig,
    pub worker: WorkerConfig,
    pub compaction: CompactorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::All,
            bind_addr: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("./data/conveyor.db"),
            cron_secret: None,
            tick_interval: Duration::from_secs(30),
            queue: QueueConfig::default(),
            relay: RelayConfig::default(),
            worker: WorkerConfig::default(),
            compaction: CompactorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from `CONVEYOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(mode) = std::env::var("CONVEYOR_MODE") {
            config.mode = RunMode::parse(&mode)?;
        }
        if let Ok(addr) = std::env::var("CONVEYOR_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(path) = std::env::var("CONVEYOR_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }
        config.cron_secret = std::env::var("CONVEYOR_CRON_SECRET").ok();

        if let Some(secs) = env_u64("CONVEYOR_TICK_SECS")? {
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("CONVEYOR_STREAM_TTL_SECS")? {
            config.queue.stream_ttl = Duration::from_secs(secs);
        }
        if let Some(steps) = env_u64("CONVEYOR_MAX_STEPS")? {
            config.worker.max_steps = steps as usize;
        }
        if let Ok(prompt) = std::env::var("CONVEYOR_SYSTEM_PROMPT") {
            config.worker.system_prompt = prompt;
        }
        if let Some(n) = env_u64("CONVEYOR_COMPACT_MAX_MESSAGES")? {
            config.compaction.max_messages = n as usize;
        }
        if let Some(k) = env_u64("CONVEYOR_COMPACT_KEEP_RECENT")? {
            config.compaction.keep_recent = k as usize;
        }

        Ok(config)
    }
}

/// Parse an optional numeric environment variable.
fn env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}
