//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::limiter::{RateLimitConfig, RateLimitError};

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The pool needs at least one worker
    #[error("worker_count must be at least 1 (got {0})")]
    InvalidWorkerCount(usize),

    /// Result channels need room for at least one result
    #[error("result_buffer must be at least 1 (got {0})")]
    InvalidResultBuffer(usize),

    /// Invalid rate limit
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// An environment variable could not be parsed
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Dispatch engine configuration
///
/// # Example
///
/// ```
/// use everruns_dispatch::{EngineConfig, RateLimitConfig};
/// use std::time::Duration;
///
/// let config = EngineConfig::new(4, 16)
///     .with_rate_limit(RateLimitConfig::per_interval(50, Duration::from_secs(1)))
///     .with_task_timeout(Duration::from_secs(10));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of workers (fixed for the engine's lifetime)
    pub worker_count: usize,

    /// Queue capacity (0 = hand tasks directly to idle workers)
    pub queue_capacity: usize,

    /// Task start rate limit (None = unlimited)
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Default deadline for `submit` while the queue is full (None = wait indefinitely)
    #[serde(default, with = "option_duration_millis")]
    pub submit_timeout: Option<Duration>,

    /// Execution limit per task body (None = unlimited)
    #[serde(default, with = "option_duration_millis")]
    pub task_timeout: Option<Duration>,

    /// Capacity of each worker's result channel and of the merged stream
    pub result_buffer: usize,

    /// Publish `Abandoned` results for queued tasks discarded at a hard stop
    #[serde(default)]
    pub report_abandoned: bool,

    /// Deadline used by [`DispatchEngine::shutdown_default`](crate::DispatchEngine::shutdown_default)
    #[serde(with = "crate::limiter::duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            queue_capacity: 0,
            rate_limit: None,
            submit_timeout: None,
            task_timeout: None,
            result_buffer: 64,
            report_abandoned: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Create a configuration with the given pool size and queue capacity
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        Self {
            worker_count,
            queue_capacity,
            ..Default::default()
        }
    }

    /// Set the number of workers
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    /// Set the queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Limit how fast tasks start
    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Remove the rate limit
    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit = None;
        self
    }

    /// Set the default submit deadline
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = Some(timeout);
        self
    }

    /// Set the per-task execution limit
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// Set the result channel capacity
    pub fn with_result_buffer(mut self, buffer: usize) -> Self {
        self.result_buffer = buffer;
        self
    }

    /// Publish `Abandoned` results for tasks discarded at a hard stop
    pub fn with_report_abandoned(mut self, report: bool) -> Self {
        self.report_abandoned = report;
        self
    }

    /// Set the default shutdown deadline
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::InvalidWorkerCount(self.worker_count));
        }
        if self.result_buffer == 0 {
            return Err(ConfigError::InvalidResultBuffer(self.result_buffer));
        }
        if let Some(rate_limit) = &self.rate_limit {
            rate_limit.validate()?;
        }
        Ok(())
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (unset = default):
    /// - `DISPATCH_WORKER_COUNT`: number of workers (default: 1)
    /// - `DISPATCH_QUEUE_CAPACITY`: queue capacity (default: 0)
    /// - `DISPATCH_RATE_CAPACITY`: enables rate limiting with this bucket size
    /// - `DISPATCH_RATE_INTERVAL_MS`: refill interval (default: 1000)
    /// - `DISPATCH_RATE_REFILL`: tokens per refill (default: the capacity)
    /// - `DISPATCH_SUBMIT_TIMEOUT_MS`: default submit deadline
    /// - `DISPATCH_TASK_TIMEOUT_MS`: per-task execution limit
    /// - `DISPATCH_SHUTDOWN_TIMEOUT_MS`: default shutdown deadline (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let mut config = Self {
            worker_count: parse(&lookup, "DISPATCH_WORKER_COUNT")?.unwrap_or(defaults.worker_count),
            queue_capacity: parse(&lookup, "DISPATCH_QUEUE_CAPACITY")?
                .unwrap_or(defaults.queue_capacity),
            ..defaults
        };

        if let Some(capacity) = parse::<u32, _>(&lookup, "DISPATCH_RATE_CAPACITY")? {
            let interval = parse(&lookup, "DISPATCH_RATE_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(1));
            let refill = parse(&lookup, "DISPATCH_RATE_REFILL")?.unwrap_or(capacity);
            config.rate_limit = Some(RateLimitConfig::new(capacity, interval, refill));
        }

        config.submit_timeout =
            parse(&lookup, "DISPATCH_SUBMIT_TIMEOUT_MS")?.map(Duration::from_millis);
        config.task_timeout = parse(&lookup, "DISPATCH_TASK_TIMEOUT_MS")?.map(Duration::from_millis);
        if let Some(millis) = parse(&lookup, "DISPATCH_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = Duration::from_millis(millis);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse<V, F>(lookup: &F, var: &'static str) -> Result<Option<V>, ConfigError>
where
    V: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) if value.trim().is_empty() => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { var, value }),
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => d.as_millis().serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
