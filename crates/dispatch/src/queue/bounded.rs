//! Bounded FIFO task queue
//!
//! Producers wait while the queue is full; consumers wait while it is empty.
//! Every wait also observes a cancellation token, and closing the queue
//! releases every waiter.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::task::Task;

/// Task queue errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// The queue has been closed to new submissions
    #[error("task queue is closed")]
    Closed,

    /// The queue is at capacity (non-blocking submit only)
    #[error("task queue is full")]
    Full,

    /// The submit deadline elapsed while the queue was full
    #[error("timed out waiting for queue capacity")]
    Timeout,

    /// The wait was cancelled
    #[error("queue wait cancelled")]
    Cancelled,
}

struct QueueState<T> {
    items: VecDeque<Task<T>>,
    closed: bool,
    /// Consumers currently parked waiting for work
    parked: usize,
}

/// Bounded, closeable FIFO of pending tasks
///
/// Capacity is fixed at construction. A capacity of zero makes the queue a
/// rendezvous point: a submit is admitted only while a consumer is parked
/// waiting for work, so producers never run ahead of idle workers.
///
/// # Example
///
/// ```
/// use everruns_dispatch::{QueueError, Task, TaskQueue};
/// use tokio_util::sync::CancellationToken;
///
/// # tokio_test::block_on(async {
/// let queue = TaskQueue::new(1);
/// queue.try_submit(Task::new("a", || async { anyhow::Ok(1u8) }))?;
/// assert_eq!(
///     queue.try_submit(Task::new("b", || async { anyhow::Ok(2u8) })),
///     Err(QueueError::Full)
/// );
///
/// let task = queue.dequeue(&CancellationToken::new()).await?.unwrap();
/// assert_eq!(task.id().as_str(), "a");
///
/// queue.close();
/// assert!(queue.dequeue(&CancellationToken::new()).await?.is_none());
/// # Ok::<(), QueueError>(())
/// # }).unwrap();
/// ```
pub struct TaskQueue<T> {
    capacity: usize,
    state: Mutex<QueueState<T>>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> TaskQueue<T> {
    /// Create an empty queue holding at most `capacity` tasks
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                parked: 0,
            }),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    fn admits(&self, state: &QueueState<T>) -> bool {
        state.items.len() < self.capacity + state.parked
    }

    /// Submit a task, waiting while the queue is full
    ///
    /// Fails with [`QueueError::Closed`] if the queue is closed before or
    /// while waiting, [`QueueError::Timeout`] once `deadline` passes, and
    /// [`QueueError::Cancelled`] if `cancel` fires.
    pub async fn submit(
        &self,
        task: Task<T>,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), QueueError> {
        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        loop {
            let space = self.not_full.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if self.admits(&state) {
                    state.items.push_back(task);
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            let error = tokio::select! {
                biased;
                _ = cancel.cancelled() => QueueError::Cancelled,
                _ = &mut expiry => QueueError::Timeout,
                _ = &mut space => continue,
            };

            // A wakeup meant for this producer may have been consumed; hand it on.
            self.not_full.notify_one();
            return Err(error);
        }
    }

    /// Submit a task without waiting
    pub fn try_submit(&self, task: Task<T>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if !self.admits(&state) {
            return Err(QueueError::Full);
        }
        state.items.push_back(task);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the next task, waiting while the queue is empty
    ///
    /// Returns `Ok(None)` once the queue is closed and drained, and
    /// [`QueueError::Cancelled`] if `cancel` fires first. Cancellation takes
    /// priority over queued tasks.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<Task<T>>, QueueError> {
        loop {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }

            let ready = self.not_empty.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(task) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(Some(task));
                }
                if state.closed {
                    return Ok(None);
                }
                state.parked += 1;
            }
            let _parked = Parked { queue: self };

            // A rendezvous producer may now hand over a task.
            self.not_full.notify_one();

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if !self.is_empty() {
                        self.not_empty.notify_one();
                    }
                    return Err(QueueError::Cancelled);
                }
                _ = &mut ready => {}
            }
        }
    }

    /// Close the queue to new submissions
    ///
    /// Parked producers fail with [`QueueError::Closed`]; consumers keep
    /// draining what is left. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
        debug!(remaining = self.len(), "task queue closed");
        true
    }

    /// Remove and return every queued task
    pub fn drain(&self) -> Vec<Task<T>> {
        let drained: Vec<Task<T>> = self.state.lock().items.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_waiters();
        }
        drained
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no tasks are queued
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the queue has been closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    #[cfg(test)]
    fn parked(&self) -> usize {
        self.state.lock().parked
    }
}

impl<T> std::fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Unregisters a parked consumer when its wait ends, however it ends
struct Parked<'a, T> {
    queue: &'a TaskQueue<T>,
}

impl<T> Drop for Parked<'_, T> {
    fn drop(&mut self) {
        self.queue.state.lock().parked -= 1;
    }
}
