//! Workers that execute queued tasks
//!
//! This module provides:
//! - [`WorkerState`] - what a worker is currently doing
//! - the worker loop: dequeue, rate limit, execute, publish
//! - fault isolation turning errors and panics into results
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   dequeue    ┌──────────────┐  acquire   ┌─────────────┐
//! │  TaskQueue   │─────────────▶│   Worker i   │───────────▶│ RateLimiter │
//! └──────────────┘              │              │◀───────────│             │
//!                               │  run_isolated│   token    └─────────────┘
//!                               └──────┬───────┘
//!                                      │ TaskResult
//!                                      ▼
//!                              per-worker channel ──▶ ResultMerger
//! ```

mod isolation;
mod runner;
mod state;

pub(crate) use runner::{Worker, WorkerShared};
pub(crate) use state::StateCell;
pub use state::WorkerState;
