//! Engine Configuration
//!
//! Settings are resolved in three layers, later layers winning:
//!
//! 1. Built-in defaults
//! 2. An optional YAML file
//! 3. Environment variables
//!
//! The CLI applies its flags on top of the result.
//!
//! # Environment Variables
//!
//! - `STEPWISE_BACKEND`: `inline`, `queued` or `distributed`
//! - `STEPWISE_DATABASE`: SQLite database path (unset = in-memory store)
//! - `REDIS_URL`, or `REDIS_HOST` / `REDIS_PORT` / `REDIS_DB`
//! - `STEPWISE_QUEUE_TIMEOUT_SECS`: bounded wait for queued jobs
//! - `STEPWISE_POLL_INTERVAL_MS`: completion poll interval
//! - `STEPWISE_WORKERS`: worker threads of the distributed runtime
//! - `STEPWISE_MAX_PARALLEL`: concurrent tasks per distributed batch
//! - `STEPWISE_CACHE`: `true`/`false`, Redis cache invalidation
//! - `STEPWISE_LEASE_SECS`: heartbeat lease of a scheduler's executions

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::execution::DEFAULT_LEASE;

const DEFAULT_REDIS_HOST: &str = "localhost";
const DEFAULT_REDIS_PORT: u16 = 6379;

/// Default bounded wait for a queued job (one hour).
const DEFAULT_QUEUE_TIMEOUT_SECS: u64 = 3600;

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Longest accepted queued-job wait (thirty days).
const MAX_QUEUE_TIMEOUT_SECS: u64 = 30 * 24 * 3600;

const MAX_POLL_INTERVAL_MS: u64 = 60_000;

const MAX_LEASE_SECS: u64 = 24 * 3600;

/// Which executor backend the process runs with.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Inline,
    Queued,
    Distributed,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inline" => Ok(Self::Inline),
            "queued" | "queue" | "rq" => Ok(Self::Queued),
            "distributed" | "ray" => Ok(Self::Distributed),
            other => Err(EngineError::Config(format!(
                "unknown backend '{}' (expected inline, queued or distributed)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Queued => "queued",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide engine settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Active executor backend
    pub backend: BackendKind,

    /// SQLite database file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,

    /// Redis connection URL for the job queue and the cache
    pub redis_url: String,

    /// Bounded wait for queued jobs, in seconds
    pub queue_timeout_secs: u64,

    /// How long a single completion poll waits, in milliseconds
    pub poll_interval_ms: u64,

    /// Worker threads of the distributed runtime
    pub workers: usize,

    /// Tasks of one batch running at once on the distributed runtime
    pub max_parallel: usize,

    /// Invalidate Redis-cached reads on every status write
    pub cache_enabled: bool,

    /// Seconds without a heartbeat after which an unfinished execution
    /// counts as orphaned
    pub lease_secs: u64,

    /// Working directory for shell-command tasks
    pub working_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let workers = num_cpus::get();
        Self {
            backend: BackendKind::Inline,
            database_path: None,
            redis_url: redis_url_from_parts(DEFAULT_REDIS_HOST, DEFAULT_REDIS_PORT, 0),
            queue_timeout_secs: DEFAULT_QUEUE_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            workers,
            max_parallel: workers,
            cache_enabled: false,
            lease_secs: DEFAULT_LEASE.as_secs(),
            working_dir: None,
        }
    }
}

fn redis_url_from_parts(host: &str, port: u16, db: u32) -> String {
    format!("redis://{}:{}/{}", host, port, db)
}

/// Parses an environment value, naming the variable on failure.
fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| EngineError::Config(format!("invalid value for {}: '{}'", name, value)))
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(EngineError::Config(format!(
            "invalid value for {}: '{}'",
            name, value
        ))),
    }
}

fn check_range(name: &str, value: u64, max: u64) -> Result<()> {
    if value == 0 || value > max {
        return Err(EngineError::Config(format!(
            "{} must be between 1 and {} (got {})",
            name, max, value
        )));
    }
    Ok(())
}

impl EngineConfig {
    /// Loads a YAML config file. Missing keys keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("cannot read config '{}': {}", path.display(), e))
        })?;
        let config: Self = serde_yaml::from_str(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Overlays settings found through `lookup`.
    ///
    /// Takes a lookup function instead of reading the environment directly
    /// so tests do not mutate process-global state.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("STEPWISE_BACKEND") {
            self.backend = BackendKind::parse(&value)?;
        }
        if let Some(value) = lookup("STEPWISE_DATABASE") {
            self.database_path = Some(PathBuf::from(value));
        }

        if let Some(url) = lookup("REDIS_URL") {
            self.redis_url = url;
        } else if lookup("REDIS_HOST").is_some()
            || lookup("REDIS_PORT").is_some()
            || lookup("REDIS_DB").is_some()
        {
            let host = lookup("REDIS_HOST").unwrap_or_else(|| DEFAULT_REDIS_HOST.to_string());
            let port = match lookup("REDIS_PORT") {
                Some(v) => parse_var("REDIS_PORT", &v)?,
                None => DEFAULT_REDIS_PORT,
            };
            let db = match lookup("REDIS_DB") {
                Some(v) => parse_var("REDIS_DB", &v)?,
                None => 0,
            };
            self.redis_url = redis_url_from_parts(&host, port, db);
        }

        if let Some(value) = lookup("STEPWISE_QUEUE_TIMEOUT_SECS") {
            self.queue_timeout_secs = parse_var("STEPWISE_QUEUE_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = lookup("STEPWISE_POLL_INTERVAL_MS") {
            self.poll_interval_ms = parse_var("STEPWISE_POLL_INTERVAL_MS", &value)?;
        }
        if let Some(value) = lookup("STEPWISE_WORKERS") {
            self.workers = parse_var("STEPWISE_WORKERS", &value)?;
        }
        if let Some(value) = lookup("STEPWISE_MAX_PARALLEL") {
            self.max_parallel = parse_var("STEPWISE_MAX_PARALLEL", &value)?;
        }
        if let Some(value) = lookup("STEPWISE_CACHE") {
            self.cache_enabled = parse_bool("STEPWISE_CACHE", &value)?;
        }
        if let Some(value) = lookup("STEPWISE_LEASE_SECS") {
            self.lease_secs = parse_var("STEPWISE_LEASE_SECS", &value)?;
        }

        Ok(())
    }

    /// Rejects settings the backends cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".into()));
        }
        if self.max_parallel == 0 {
            return Err(EngineError::Config("max_parallel must be at least 1".into()));
        }
        check_range("queue_timeout_secs", self.queue_timeout_secs, MAX_QUEUE_TIMEOUT_SECS)?;
        check_range("poll_interval_ms", self.poll_interval_ms, MAX_POLL_INTERVAL_MS)?;
        check_range("lease_secs", self.lease_secs, MAX_LEASE_SECS)?;
        Ok(())
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_secs(self.queue_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }
}
