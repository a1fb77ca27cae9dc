//! Token-bucket rate limiter
//!
//! Admits at most `capacity` operations per refill window. A single
//! background tick owned by the limiter adds `refill` tokens every
//! `interval`, capped at `capacity`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Rate limit configuration
///
/// # Example
///
/// ```
/// use everruns_dispatch::RateLimitConfig;
/// use std::time::Duration;
///
/// // At most 100 task starts per second
/// let config = RateLimitConfig::per_interval(100, Duration::from_secs(1));
/// assert_eq!(config.capacity, 100);
/// assert_eq!(config.refill, 100);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Maximum tokens held by the bucket (0 = fully throttled)
    pub capacity: u32,

    /// Time between refills
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Tokens added per refill
    pub refill: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            interval: Duration::from_secs(1),
            refill: 10,
        }
    }
}

impl RateLimitConfig {
    /// Create a rate limit configuration
    pub fn new(capacity: u32, interval: Duration, refill: u32) -> Self {
        Self {
            capacity,
            interval,
            refill,
        }
    }

    /// Allow `count` operations per `interval`, refilling the whole bucket each tick
    pub fn per_interval(count: u32, interval: Duration) -> Self {
        Self::new(count, interval, count)
    }

    /// Set the bucket capacity
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the refill interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the tokens added per refill
    pub fn with_refill(mut self, refill: u32) -> Self {
        self.refill = refill;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.interval.is_zero() {
            return Err(RateLimitError::InvalidConfig(
                "refill interval must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Rate limiter errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Invalid configuration
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// Constructed outside a Tokio runtime
    #[error("rate limiter must be created inside a Tokio runtime")]
    NoRuntime,

    /// The wait was cancelled before a token became available
    #[error("token acquisition cancelled")]
    Cancelled,

    /// The limiter has been closed
    #[error("rate limiter is closed")]
    Closed,
}

struct Bucket {
    tokens: u32,
    closed: bool,
}

struct Shared {
    config: RateLimitConfig,
    bucket: Mutex<Bucket>,
    refilled: Notify,
}

impl Shared {
    /// Add one refill's worth of tokens, returning how many were added
    fn refill(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        if bucket.closed {
            return 0;
        }
        let before = bucket.tokens;
        bucket.tokens = before
            .saturating_add(self.config.refill)
            .min(self.config.capacity);
        bucket.tokens - before
    }
}

/// Token-bucket rate limiter shared by all workers
///
/// The bucket starts full. [`try_acquire`](Self::try_acquire) never waits;
/// [`acquire`](Self::acquire) waits for a token or cancellation, whichever
/// comes first.
///
/// # Example
///
/// ```
/// use everruns_dispatch::{RateLimitConfig, RateLimiter};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let limiter = RateLimiter::new(RateLimitConfig::per_interval(2, Duration::from_secs(1)))?;
/// let cancel = CancellationToken::new();
///
/// limiter.acquire(&cancel).await?;
/// assert!(limiter.try_acquire());
/// assert!(!limiter.try_acquire()); // empty until the next refill
///
/// limiter.close();
/// # Ok::<(), everruns_dispatch::RateLimitError>(())
/// # }).unwrap();
/// ```
pub struct RateLimiter {
    shared: Arc<Shared>,
    stop: CancellationToken,
}

impl RateLimiter {
    /// Create a limiter and start its refill tick on the current runtime
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| RateLimitError::NoRuntime)?;

        let shared = Arc::new(Shared {
            bucket: Mutex::new(Bucket {
                tokens: config.capacity,
                closed: false,
            }),
            refilled: Notify::new(),
            config,
        });
        let stop = CancellationToken::new();

        runtime.spawn(refill_loop(Arc::clone(&shared), stop.clone()));

        Ok(Self { shared, stop })
    }

    /// Take a token if one is available, without waiting
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.shared.bucket.lock();
        if bucket.closed || bucket.tokens == 0 {
            return false;
        }
        bucket.tokens -= 1;
        true
    }

    /// Wait for a token
    ///
    /// Returns [`RateLimitError::Cancelled`] without consuming a token if
    /// `cancel` fires first, and [`RateLimitError::Closed`] once the limiter
    /// is closed.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            // Register before checking so a refill between the check and the
            // wait is not missed.
            let refilled = self.shared.refilled.notified();
            tokio::pin!(refilled);
            refilled.as_mut().enable();

            {
                let mut bucket = self.shared.bucket.lock();
                if bucket.closed {
                    return Err(RateLimitError::Closed);
                }
                if cancel.is_cancelled() {
                    return Err(RateLimitError::Cancelled);
                }
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RateLimitError::Cancelled),
                _ = &mut refilled => {}
            }
        }
    }

    /// Close the limiter
    ///
    /// Stops the refill tick and wakes every waiter with
    /// [`RateLimitError::Closed`]. Idempotent.
    pub fn close(&self) {
        {
            let mut bucket = self.shared.bucket.lock();
            if bucket.closed {
                return;
            }
            bucket.closed = true;
        }
        self.stop.cancel();
        self.shared.refilled.notify_waiters();
        debug!("rate limiter closed");
    }

    /// Whether [`close`](Self::close) has been called
    pub fn is_closed(&self) -> bool {
        self.shared.bucket.lock().closed
    }

    /// Tokens currently available
    pub fn available(&self) -> u32 {
        self.shared.bucket.lock().tokens
    }

    /// Maximum tokens the bucket holds
    pub fn capacity(&self) -> u32 {
        self.shared.config.capacity
    }

    /// The limiter configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.shared.config
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.shared.config)
            .field("available", &self.available())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn refill_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let period = shared.config.interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                let added = shared.refill();
                if added > 0 {
                    trace!(added, "refilled rate limit tokens");
                    shared.refilled.notify_waiters();
                }
            }
        }
    }

    debug!("rate limiter refill loop exited");
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
