//! Engine statistics
//!
//! Lock-free counters updated by workers, the merger and the engine, read
//! through [`StatsSnapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::task::{FailureKind, TaskOutcome};

/// Live counters shared across the engine
#[derive(Debug, Default)]
pub struct EngineStats {
    submitted: AtomicU64,
    dequeued: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    faulted: AtomicU64,
    timed_out: AtomicU64,
    interrupted: AtomicU64,
    abandoned: AtomicU64,
    results_dropped: AtomicU64,
}

impl EngineStats {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dequeued(&self) {
        self.dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome<T>(&self, outcome: &TaskOutcome<T>) {
        let counter = match outcome {
            TaskOutcome::Succeeded(_) => &self.succeeded,
            TaskOutcome::Failed(failure) => match failure.kind {
                FailureKind::Error => &self.failed,
                FailureKind::Fault => &self.faulted,
                FailureKind::TimedOut => &self.timed_out,
            },
            TaskOutcome::Abandoned => &self.abandoned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// A worker gave up on a task it had already dequeued
    pub(crate) fn record_interrupted(&self) {
        self.interrupted.fetch_add(1, Ordering::Relaxed);
    }

    /// Queued tasks discarded without ever reaching a worker
    pub(crate) fn record_abandoned(&self, count: u64) {
        self.abandoned.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.results_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            dequeued: self.dequeued.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            interrupted: self.interrupted.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time engine counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Tasks accepted by the queue
    pub submitted: u64,
    /// Tasks taken by a worker
    pub dequeued: u64,
    /// Bodies that returned a value
    pub succeeded: u64,
    /// Bodies that returned an error
    pub failed: u64,
    /// Bodies that panicked
    pub faulted: u64,
    /// Bodies that exceeded the execution limit
    pub timed_out: u64,
    /// Dequeued tasks given up while waiting for a rate limit token
    pub interrupted: u64,
    /// Queued tasks discarded at shutdown without running
    pub abandoned: u64,
    /// Results produced but never delivered to the consumer
    pub results_dropped: u64,
}

impl StatsSnapshot {
    /// Tasks whose body ran to an outcome
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.faulted + self.timed_out
    }

    /// Tasks accounted for: executed, interrupted or abandoned
    pub fn settled(&self) -> u64 {
        self.completed() + self.interrupted + self.abandoned
    }
}
