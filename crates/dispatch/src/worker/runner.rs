//! Worker loop
//!
//! Each worker repeatedly takes one task from the shared queue, waits for a
//! rate limit token, runs the body in isolation and publishes the result on
//! its own channel. It owns that channel's sender, so the channel closes
//! exactly when the worker exits.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::isolation::run_isolated;
use super::state::{StateCell, WorkerState};
use crate::engine::EngineStats;
use crate::limiter::RateLimiter;
use crate::queue::TaskQueue;
use crate::task::{TaskOutcome, TaskResult};

/// Everything the workers of one engine share
pub(crate) struct WorkerShared<T> {
    pub(crate) queue: Arc<TaskQueue<T>>,
    pub(crate) limiter: Option<Arc<RateLimiter>>,
    /// Stop taking new work (dequeue and token waits return)
    pub(crate) halt: CancellationToken,
    /// Shutdown deadline passed; stop waiting to publish
    pub(crate) expired: CancellationToken,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) task_timeout: Option<Duration>,
}

/// A single worker
pub(crate) struct Worker<T> {
    index: usize,
    shared: Arc<WorkerShared<T>>,
    output: mpsc::Sender<TaskResult<T>>,
    state: Arc<StateCell>,
}

impl<T: Send + 'static> Worker<T> {
    pub(crate) fn new(
        index: usize,
        shared: Arc<WorkerShared<T>>,
        output: mpsc::Sender<TaskResult<T>>,
        state: Arc<StateCell>,
    ) -> Self {
        Self {
            index,
            shared,
            output,
            state,
        }
    }

    /// Run until the queue is closed and drained, or until halted
    #[instrument(skip_all, fields(worker = self.index))]
    pub(crate) async fn run(self) {
        debug!("worker started");

        loop {
            self.state.set(WorkerState::Dequeuing);
            let task = match self.shared.queue.dequeue(&self.shared.halt).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    debug!("queue closed and drained");
                    break;
                }
                Err(_) => {
                    debug!("halted while waiting for work");
                    break;
                }
            };
            self.shared.stats.record_dequeued();
            let (task_id, body, submitted_at) = task.into_parts();

            if let Some(limiter) = &self.shared.limiter {
                self.state.set(WorkerState::RateLimited);
                if let Err(e) = limiter.acquire(&self.shared.halt).await {
                    debug!(%task_id, error = %e, "gave up waiting for a rate limit token");
                    self.shared.stats.record_interrupted();
                    self.state.set(WorkerState::Publishing);
                    self.publish(TaskResult::abandoned(task_id, Some(self.index), submitted_at))
                        .await;
                    break;
                }
            }

            self.state.set(WorkerState::Executing);
            let started_at = Utc::now();
            let clock = Instant::now();
            let outcome = run_isolated(body, self.shared.task_timeout).await;
            let elapsed = clock.elapsed();

            self.shared.stats.record_outcome(&outcome);
            match &outcome {
                TaskOutcome::Failed(failure) => {
                    warn!(%task_id, kind = %failure.kind, message = %failure.message, "task failed");
                }
                _ => debug!(%task_id, ?elapsed, "task succeeded"),
            }

            self.state.set(WorkerState::Publishing);
            let result = TaskResult {
                task_id,
                worker: Some(self.index),
                outcome,
                submitted_at,
                started_at: Some(started_at),
                completed_at: Utc::now(),
                elapsed,
            };
            if !self.publish(result).await {
                break;
            }
        }

        self.state.set(WorkerState::Exited);
        debug!("worker exited");
    }

    /// Hand a result to the merger; returns false if the worker should stop
    async fn publish(&self, result: TaskResult<T>) -> bool {
        tokio::select! {
            biased;
            sent = self.output.send(result) => {
                if sent.is_err() {
                    self.shared.stats.record_dropped();
                    debug!("result channel closed");
                    return false;
                }
                true
            }
            _ = self.shared.expired.cancelled() => {
                self.shared.stats.record_dropped();
                warn!("shutdown deadline passed before result was delivered");
                false
            }
        }
    }
}
