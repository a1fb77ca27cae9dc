//! Engine lifecycle
//!
//! This module provides:
//! - [`DispatchEngine`] - starts the workers, accepts submissions, drives shutdown
//! - [`EngineConfig`] - pool size, queue capacity, rate limit and timeouts
//! - [`SignalState`] - the engine-wide `Active -> CancelRequested -> Drained` signal
//! - [`StatsSnapshot`] - counters for submitted, executed and abandoned work
//!
//! # Shutdown
//!
//! ```text
//!  Running ──shutdown()──▶ ShuttingDown ──drained──▶ Stopped
//!                               │
//!                               └──deadline──▶ StoppedWithTimeout
//! ```
//!
//! Graceful shutdown closes the queue and lets workers run what is left.
//! Immediate shutdown also abandons queued tasks. In both modes a task that
//! is already executing runs to completion.

mod config;
mod dispatch;
mod signal;
mod stats;

pub use config::{ConfigError, EngineConfig};
pub use dispatch::{DispatchEngine, EngineError, EngineState, ShutdownMode};
pub use signal::SignalState;
pub(crate) use stats::EngineStats;
pub use stats::StatsSnapshot;
