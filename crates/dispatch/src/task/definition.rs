//! Task definitions
//!
//! A [`Task`] pairs a caller-assigned [`TaskId`] with a body that is run
//! exactly once by whichever worker dequeues it.

use std::fmt;
use std::future::Future;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Caller-assigned task identifier
///
/// Used for tracing and de-duplication by the caller. The engine never
/// requires identifiers to be unique.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Create an identifier from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a time-ordered identifier (UUID v7)
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<Uuid> for TaskId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Boxed async body
pub(crate) type AsyncBody<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// Boxed blocking body
pub(crate) type BlockingBody<T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send>;

/// How a task body is executed
pub(crate) enum TaskBody<T> {
    /// Polled on the worker's own task
    Async(AsyncBody<T>),
    /// Run on Tokio's blocking thread pool
    Blocking(BlockingBody<T>),
}

impl<T> TaskBody<T> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Async(_) => "async",
            Self::Blocking(_) => "blocking",
        }
    }
}

/// A unit of work
///
/// The body is not invoked until a worker dequeues the task, so nothing runs
/// for tasks that are abandoned at shutdown.
///
/// # Example
///
/// ```
/// use everruns_dispatch::Task;
///
/// let task: Task<u64> = Task::new("resize-42", || async {
///     // ... do the work ...
///     anyhow::Ok(42)
/// });
/// assert_eq!(task.id().as_str(), "resize-42");
///
/// let checksum: Task<u32> = Task::blocking("crc-7", || anyhow::Ok(0xCAFE));
/// assert_eq!(checksum.id().as_str(), "crc-7");
/// ```
pub struct Task<T = serde_json::Value> {
    id: TaskId,
    body: TaskBody<T>,
    submitted_at: DateTime<Utc>,
}

impl<T: Send + 'static> Task<T> {
    /// Create a task with an async body
    pub fn new<F, Fut>(id: impl Into<TaskId>, body: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            id: id.into(),
            body: TaskBody::Async(Box::new(move || body().boxed())),
            submitted_at: Utc::now(),
        }
    }

    /// Create a task whose body blocks (CPU-bound or synchronous I/O)
    ///
    /// The body runs on Tokio's blocking pool so it never stalls the
    /// worker's executor thread.
    pub fn blocking<F>(id: impl Into<TaskId>, body: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            id: id.into(),
            body: TaskBody::Blocking(Box::new(body)),
            submitted_at: Utc::now(),
        }
    }
}

impl<T> Task<T> {
    /// The caller-assigned identifier
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// When the task was handed to the engine
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub(crate) fn mark_submitted(&mut self) {
        self.submitted_at = Utc::now();
    }

    pub(crate) fn into_parts(self) -> (TaskId, TaskBody<T>, DateTime<Utc>) {
        (self.id, self.body, self.submitted_at)
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("body", &self.body.kind())
            .field("submitted_at", &self.submitted_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_conversions() {
        assert_eq!(TaskId::from("job-1").as_str(), "job-1");
        assert_eq!(TaskId::from(7u64).to_string(), "7");
        assert_eq!(TaskId::from(String::from("x")), TaskId::new("x"));
    }

    #[test]
    fn test_generated_ids_are_time_ordered() {
        let first = TaskId::generate();
        let second = TaskId::generate();
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn test_task_debug_shows_body_kind() {
        let task: Task<u8> = Task::blocking("b", || anyhow::Ok(1));
        let rendered = format!("{task:?}");
        assert!(rendered.contains("blocking"));
        assert!(rendered.contains("\"b\""));
    }

    #[tokio::test]
    async fn test_async_body_is_lazy() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let task: Task<()> = Task::new("lazy", move || async move {
            flag.store(true, Ordering::SeqCst);
            anyhow::Ok(())
        });
        assert!(!ran.load(Ordering::SeqCst));

        let (_, body, _) = task.into_parts();
        match body {
            TaskBody::Async(run) => run().await.unwrap(),
            TaskBody::Blocking(_) => panic!("expected async body"),
        }
        assert!(ran.load(Ordering::SeqCst));
    }
}
