//! Dispatch engine lifecycle
//!
//! Owns the queue, the limiter, the workers and the merger; drives shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

use super::config::{ConfigError, EngineConfig};
use super::signal::{self, CancellationSignal, SignalState};
use super::stats::{EngineStats, StatsSnapshot};
use crate::limiter::RateLimiter;
use crate::merger::{ResultMerger, ResultStream};
use crate::queue::{QueueError, TaskQueue};
use crate::task::{Task, TaskResult};
use crate::worker::{StateCell, Worker, WorkerShared, WorkerState};

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    /// Accepting submissions
    Running,
    /// Shutdown in progress; submissions are rejected
    ShuttingDown,
    /// Every worker exited within the deadline
    Stopped,
    /// The deadline elapsed first; some work was abandoned
    StoppedWithTimeout,
}

/// How queued work is treated at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Workers run everything already queued before exiting
    #[default]
    Graceful,
    /// Queued tasks are abandoned; only tasks already executing finish
    Immediate,
}

/// Dispatch engine errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Invalid configuration
    #[error("invalid engine configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// Shutdown has begun; no more submissions or shutdowns
    #[error("dispatch engine is closed")]
    EngineClosed,

    /// The queue stayed full for the whole submit deadline
    #[error("queue stayed full for {0:?}")]
    QueueFullTimeout(Duration),

    /// The queue is full (non-blocking submit only)
    #[error("queue is full")]
    QueueFull,

    /// Workers were still busy when the shutdown deadline elapsed
    #[error("shutdown did not finish within {deadline:?} ({remaining} workers still running)")]
    ShutdownTimeout { deadline: Duration, remaining: usize },

    /// Constructed outside a Tokio runtime
    #[error("dispatch engine must be created inside a Tokio runtime")]
    NoRuntime,
}

/// Bounded concurrent dispatch engine
///
/// Runs a fixed pool of workers that take tasks from a bounded queue,
/// optionally gated by a token-bucket rate limit, and merges every result
/// into one stream.
///
/// # Example
///
/// ```
/// use everruns_dispatch::{DispatchEngine, EngineConfig, Task};
/// use futures::StreamExt;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let engine: DispatchEngine<u64> = DispatchEngine::new(EngineConfig::new(4, 8))?;
/// // Read results while submitting so workers never stall on a full buffer.
/// let collector = tokio::spawn(
///     engine
///         .results()
///         .filter_map(|result| async move { result.into_value() })
///         .collect::<Vec<u64>>(),
/// );
///
/// for n in 0..10u64 {
///     engine.submit(Task::new(n, move || async move { anyhow::Ok(n * n) })).await?;
/// }
/// engine.shutdown(Duration::from_secs(5)).await?;
///
/// let values = collector.await.unwrap();
/// assert_eq!(values.iter().sum::<u64>(), 285);
/// # Ok::<(), everruns_dispatch::EngineError>(())
/// # }).unwrap();
/// ```
pub struct DispatchEngine<T = serde_json::Value> {
    config: EngineConfig,
    queue: Arc<TaskQueue<T>>,
    limiter: Option<Arc<RateLimiter>>,
    signal: Arc<CancellationSignal>,
    state: Arc<RwLock<EngineState>>,
    worker_states: Vec<Arc<StateCell>>,
    stats: Arc<EngineStats>,
    results: Mutex<Option<mpsc::Receiver<TaskResult<T>>>>,
    /// Abandoned-report lane into the merger; the supervisor closes it once
    /// every worker has exited
    abandoned_tx: AbandonedLane<T>,
}

type AbandonedLane<T> = Arc<Mutex<Option<mpsc::UnboundedSender<TaskResult<T>>>>>;

impl<T: Send + 'static> DispatchEngine<T> {
    /// Validate `config` and start the workers on the current runtime
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let limiter = match &config.rate_limit {
            Some(rate_limit) => Some(Arc::new(
                RateLimiter::new(rate_limit.clone()).map_err(ConfigError::from)?,
            )),
            None => None,
        };

        let signal = Arc::new(CancellationSignal::new());
        let stats = Arc::new(EngineStats::default());
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let shared = Arc::new(WorkerShared {
            queue: Arc::clone(&queue),
            limiter: limiter.clone(),
            halt: signal.halt.clone(),
            expired: signal.expired.clone(),
            stats: Arc::clone(&stats),
            task_timeout: config.task_timeout,
        });

        let mut inputs = Vec::with_capacity(config.worker_count);
        let mut handles = Vec::with_capacity(config.worker_count);
        let mut worker_states = Vec::with_capacity(config.worker_count);
        for index in 0..config.worker_count {
            let (tx, rx) = mpsc::channel(config.result_buffer);
            let state = Arc::new(StateCell::new());
            let worker = Worker::new(index, Arc::clone(&shared), tx, Arc::clone(&state));
            handles.push(runtime.spawn(worker.run()));
            inputs.push(rx);
            worker_states.push(state);
        }

        let (output_tx, output_rx) = mpsc::channel(config.result_buffer);
        let (abandoned_tx, abandoned_rx) = mpsc::unbounded_channel();
        let abandoned_tx = Arc::new(Mutex::new(Some(abandoned_tx)));
        let state = Arc::new(RwLock::new(EngineState::Running));
        let merger = ResultMerger::new(
            inputs,
            abandoned_rx,
            output_tx,
            signal.expired.clone(),
            Arc::clone(&stats),
        );
        let merger = runtime.spawn(merger.run());
        runtime.spawn(supervise(
            handles,
            merger,
            Arc::clone(&signal),
            Arc::clone(&state),
            Arc::clone(&abandoned_tx),
        ));

        info!(
            workers = config.worker_count,
            queue_capacity = config.queue_capacity,
            rate_limited = limiter.is_some(),
            "Dispatch engine started"
        );

        Ok(Self {
            config,
            queue,
            limiter,
            signal,
            state,
            worker_states,
            stats,
            results: Mutex::new(Some(output_rx)),
            abandoned_tx,
        })
    }

    /// Submit a task, waiting while the queue is full
    ///
    /// Waits at most [`EngineConfig::submit_timeout`] when one is configured.
    pub async fn submit(&self, task: Task<T>) -> Result<(), EngineError> {
        self.enqueue(task, self.config.submit_timeout).await
    }

    /// Submit a task, waiting at most `timeout` for queue capacity
    pub async fn submit_timeout(&self, task: Task<T>, timeout: Duration) -> Result<(), EngineError> {
        self.enqueue(task, Some(timeout)).await
    }

    /// Submit a task only if the queue has room right now
    pub fn try_submit(&self, mut task: Task<T>) -> Result<(), EngineError> {
        task.mark_submitted();
        let task_id = task.id().clone();
        self.queue.try_submit(task).map_err(|e| map_queue_error(e, None))?;
        self.stats.record_submitted();
        trace!(%task_id, "task submitted");
        Ok(())
    }

    async fn enqueue(&self, mut task: Task<T>, timeout: Option<Duration>) -> Result<(), EngineError> {
        task.mark_submitted();
        let task_id = task.id().clone();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);

        self.queue
            .submit(task, &self.signal.halt, deadline)
            .await
            .map_err(|e| map_queue_error(e, timeout))?;

        self.stats.record_submitted();
        trace!(%task_id, "task submitted");
        Ok(())
    }

    /// Take the merged result stream
    ///
    /// The first call returns the live stream; later calls return a stream
    /// that has already ended.
    pub fn results(&self) -> ResultStream<T> {
        match self.results.lock().take() {
            Some(rx) => ResultStream::new(rx),
            None => {
                warn!("result stream already taken; returning an ended stream");
                ResultStream::terminated()
            }
        }
    }

    /// Graceful shutdown: run everything queued, waiting at most `deadline`
    ///
    /// Workers wait while the result buffers are full, so the drain only
    /// completes while something is reading [`results`](Self::results) (or
    /// the stream has been dropped). With more than roughly
    /// `result_buffer * (worker_count + 1)` results outstanding and nobody
    /// reading, the deadline elapses and the undelivered results are dropped.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), EngineError> {
        self.shutdown_with(ShutdownMode::Graceful, deadline).await
    }

    /// Immediate shutdown: abandon queued tasks, let executing tasks finish
    pub async fn shutdown_now(&self, deadline: Duration) -> Result<(), EngineError> {
        self.shutdown_with(ShutdownMode::Immediate, deadline).await
    }

    /// Graceful shutdown with [`EngineConfig::shutdown_timeout`]
    pub async fn shutdown_default(&self) -> Result<(), EngineError> {
        self.shutdown_with(ShutdownMode::Graceful, self.config.shutdown_timeout)
            .await
    }

    /// Stop accepting work and wait up to `deadline` for every worker to exit
    ///
    /// Tasks already executing are never interrupted. If the deadline elapses
    /// first, workers still waiting for work or a rate limit token are
    /// released, tasks left in the queue are abandoned and
    /// [`EngineError::ShutdownTimeout`] is returned. Any shutdown call after
    /// the first returns [`EngineError::EngineClosed`].
    ///
    /// The engine reaches [`EngineState::Stopped`] when the last worker exits,
    /// even if this future is dropped before then. As with
    /// [`shutdown`](Self::shutdown), draining needs an active reader of the
    /// result stream.
    #[instrument(skip(self), fields(workers = self.config.worker_count))]
    pub async fn shutdown_with(
        &self,
        mode: ShutdownMode,
        deadline: Duration,
    ) -> Result<(), EngineError> {
        {
            let mut state = self.state.write();
            if *state != EngineState::Running {
                return Err(EngineError::EngineClosed);
            }
            *state = EngineState::ShuttingDown;
        }

        info!(queued = self.queue.len(), "Initiating shutdown");

        self.signal.advance(SignalState::CancelRequested);
        self.queue.close();
        if mode == ShutdownMode::Immediate {
            // Reports go out before any worker can be released by halt.
            self.abandon_queued();
            self.signal.halt.cancel();
        }

        let drained = signal::drained(self.signal.subscribe());
        if tokio::time::timeout(deadline, drained).await.is_ok() {
            self.close_limiter();
            info!(stats = ?self.stats.snapshot(), "Dispatch engine stopped");
            return Ok(());
        }

        let abandoned = self.abandon_queued();
        self.signal.abort();
        self.close_limiter();
        let remaining = self
            .worker_states()
            .iter()
            .filter(|state| **state != WorkerState::Exited)
            .count();

        {
            let mut state = self.state.write();
            if *state != EngineState::ShuttingDown {
                // The last worker exited while the deadline was being handled.
                return Ok(());
            }
            *state = EngineState::StoppedWithTimeout;
        }

        warn!(remaining, abandoned, "Shutdown timeout reached");
        Err(EngineError::ShutdownTimeout { deadline, remaining })
    }
}

impl<T> DispatchEngine<T> {
    /// Remove every queued task, counting (and optionally reporting) it as abandoned
    fn abandon_queued(&self) -> usize {
        // Held across the drain so the supervisor cannot close the lane in between.
        let lane = self.abandoned_tx.lock();
        let tasks = self.queue.drain();
        let count = tasks.len();
        if count == 0 {
            return 0;
        }

        self.stats.record_abandoned(count as u64);
        if self.config.report_abandoned {
            for task in tasks {
                let (task_id, _, submitted_at) = task.into_parts();
                let result = TaskResult::abandoned(task_id, None, submitted_at);
                let sent = match lane.as_ref() {
                    Some(tx) => tx.send(result).is_ok(),
                    None => false,
                };
                if !sent {
                    self.stats.record_dropped();
                }
            }
        }

        debug!(count, "Abandoned queued tasks");
        count
    }

    fn close_limiter(&self) {
        if let Some(limiter) = &self.limiter {
            limiter.close();
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Current cancellation signal state
    pub fn signal_state(&self) -> SignalState {
        self.signal.state()
    }

    /// What each worker is doing, indexed by worker
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.worker_states.iter().map(|cell| cell.get()).collect()
    }

    /// Snapshot of the engine counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// The engine configuration
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<T> Drop for DispatchEngine<T> {
    fn drop(&mut self) {
        if *self.state.read() == EngineState::Running {
            debug!("Dispatch engine dropped while running; stopping intake");
            self.queue.close();
            self.abandon_queued();
            self.signal.halt.cancel();
        }
    }
}

impl<T> std::fmt::Debug for DispatchEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("state", &self.state())
            .field("signal", &self.signal_state())
            .field("workers", &self.config.worker_count)
            .field("queued", &self.queued())
            .finish()
    }
}

fn map_queue_error(err: QueueError, timeout: Option<Duration>) -> EngineError {
    match err {
        QueueError::Closed | QueueError::Cancelled => EngineError::EngineClosed,
        QueueError::Full => EngineError::QueueFull,
        QueueError::Timeout => EngineError::QueueFullTimeout(timeout.unwrap_or_default()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Worker,
    Merger,
}

/// Wait for every worker and the merger, then report `Drained`
///
/// Closes the abandoned-report lane once the last worker exits, and moves a
/// shutting-down engine to `Stopped`. Aborts the process as soon as any of
/// the tasks panics.
async fn supervise<T>(
    workers: Vec<JoinHandle<()>>,
    merger: JoinHandle<()>,
    signal: Arc<CancellationSignal>,
    state: Arc<RwLock<EngineState>>,
    abandoned_tx: AbandonedLane<T>,
) {
    let mut workers_left = workers.len();
    let mut running: FuturesUnordered<BoxFuture<'static, (Role, Result<(), JoinError>)>> = workers
        .into_iter()
        .map(|handle| handle.map(|joined| (Role::Worker, joined)).boxed())
        .collect();
    running.push(merger.map(|joined| (Role::Merger, joined)).boxed());

    while let Some((role, joined)) = running.next().await {
        if let Err(e) = joined {
            if e.is_panic() {
                error!(error = %e, ?role, "Dispatch task panicked outside task isolation; aborting");
                std::process::abort();
            }
            debug!(error = %e, ?role, "Dispatch task cancelled");
        }

        if role == Role::Worker {
            workers_left -= 1;
            if workers_left == 0 {
                // No worker is left to empty the queue, so nothing more can be abandoned.
                abandoned_tx.lock().take();
                trace!("Abandoned-report lane closed");
            }
        }
    }

    {
        let mut state = state.write();
        if *state == EngineState::ShuttingDown {
            *state = EngineState::Stopped;
        }
    }
    signal.advance(SignalState::Drained);
    debug!("All workers exited and result stream closed");
}
