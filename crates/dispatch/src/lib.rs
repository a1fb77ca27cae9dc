//! # Bounded Concurrent Dispatch Engine
//!
//! Runs units of work on a fixed-size pool of Tokio workers, behind a
//! bounded queue and an optional token-bucket rate limit, and merges every
//! result into a single stream.
//!
//! ## Features
//!
//! - **Backpressure**: producers wait while the queue is full; capacity 0 hands tasks straight to idle workers
//! - **Rate limiting**: a shared token bucket caps how many tasks start per interval
//! - **Fault isolation**: errors and panics in task bodies become failed results, never worker crashes
//! - **Result fan-in**: one stream for all workers, closed only after the last worker exits
//! - **Bounded shutdown**: graceful or immediate, with a deadline after which waiting work is abandoned
//!
//! ## Architecture
//!
//! ```text
//!  submit()                                                  results()
//!     │                                                          ▲
//!     ▼                                                          │
//! ┌───────────┐     ┌──────────────────────────┐     ┌──────────────────┐
//! │ TaskQueue │────▶│       Worker 0..N        │────▶│   ResultMerger   │
//! │ (bounded) │     │ dequeue, acquire token,  │     │ (fan-in, closes  │
//! └───────────┘     │ execute, publish result  │     │  on last exit)   │
//!     ▲             └────────────┬─────────────┘     └──────────────────┘
//!     │ close()                  ▼
//! ┌────────────────┐      ┌───────────────┐
//! │ DispatchEngine │─────▶│  RateLimiter  │
//! │  (lifecycle)   │      │ (refill tick) │
//! └────────────────┘      └───────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use everruns_dispatch::prelude::*;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let config = EngineConfig::new(2, 4)
//!     .with_rate_limit(RateLimitConfig::per_interval(100, Duration::from_secs(1)));
//! let engine: DispatchEngine<String> = DispatchEngine::new(config)?;
//!
//! // Keep reading while the engine runs; shutdown drains into this reader.
//! let mut results = engine.results();
//! let reader = tokio::spawn(async move {
//!     let mut succeeded = 0;
//!     while let Some(result) = results.next_result().await {
//!         if result.is_success() {
//!             succeeded += 1;
//!         }
//!     }
//!     succeeded
//! });
//!
//! engine
//!     .submit(Task::new("greet", || async { anyhow::Ok("hello".to_string()) }))
//!     .await?;
//! engine
//!     .submit(Task::new("fail", || async {
//!         Err::<String, _>(anyhow::anyhow!("no greeting today"))
//!     }))
//!     .await?;
//! engine.shutdown(Duration::from_secs(5)).await?;
//!
//! assert_eq!(reader.await.unwrap(), 1);
//! assert_eq!(engine.stats().failed, 1);
//! # Ok::<(), EngineError>(())
//! # }).unwrap();
//! ```

pub mod engine;
pub mod limiter;
pub mod merger;
pub mod queue;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::engine::{DispatchEngine, EngineConfig, EngineError, EngineState, ShutdownMode};
    pub use crate::limiter::RateLimitConfig;
    pub use crate::merger::ResultStream;
    pub use crate::task::{FailureKind, Task, TaskId, TaskOutcome, TaskResult};
}

// Re-export key types at crate root
pub use engine::{
    ConfigError, DispatchEngine, EngineConfig, EngineError, EngineState, ShutdownMode, SignalState,
    StatsSnapshot,
};
pub use limiter::{RateLimitConfig, RateLimitError, RateLimiter};
pub use merger::ResultStream;
pub use queue::{QueueError, TaskQueue};
pub use task::{FailureKind, Task, TaskFailure, TaskId, TaskOutcome, TaskResult};
pub use worker::WorkerState;
