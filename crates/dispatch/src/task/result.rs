//! Task results
//!
//! Every dequeued task produces exactly one [`TaskResult`]. Errors returned
//! by the body and panics raised inside it are converted into data here
//! instead of propagating out of the worker.

use std::any::Any;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::definition::TaskId;

/// Why a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The body returned an error
    Error,
    /// The body panicked; the panic was intercepted by the worker
    Fault,
    /// The body exceeded the configured execution limit
    TimedOut,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Fault => write!(f, "fault"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Failure descriptor recorded in a result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    /// Failure category
    pub kind: FailureKind,

    /// Human-readable message
    pub message: String,

    /// Underlying causes, outermost first, one per line (errors only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl TaskFailure {
    /// Build a failure from an error returned by a task body
    pub fn error(err: &anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(ToString::to_string).collect();
        Self {
            kind: FailureKind::Error,
            message: err.to_string(),
            trace: (!causes.is_empty()).then(|| causes.join("\n")),
        }
    }

    /// Build a failure from an intercepted panic payload
    pub fn fault(payload: Box<dyn Any + Send>) -> Self {
        Self {
            kind: FailureKind::Fault,
            message: format!("panic: {}", panic_message(&*payload)),
            trace: None,
        }
    }

    /// Build a failure for a body that ran past its execution limit
    pub fn timed_out(limit: Duration) -> Self {
        Self {
            kind: FailureKind::TimedOut,
            message: format!("task exceeded execution limit of {limit:?}"),
            trace: None,
        }
    }

    /// Whether the failure came from a panic
    pub fn is_fault(&self) -> bool {
        self.kind == FailureKind::Fault
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Extract a readable message from a panic payload
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Outcome of one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum TaskOutcome<T> {
    /// The body returned a value
    Succeeded(T),
    /// The body returned an error, panicked or timed out
    Failed(TaskFailure),
    /// The task was never executed because the engine stopped first
    Abandoned,
}

impl<T> TaskOutcome<T> {
    /// Whether the body returned a value
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded(_))
    }

    /// Whether the body failed in any way
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Whether the task was abandoned at shutdown
    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned)
    }

    /// The failure descriptor, if any
    pub fn failure(&self) -> Option<&TaskFailure> {
        match self {
            Self::Failed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Short label used in logs
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Failed(failure) => match failure.kind {
                FailureKind::Error => "failed",
                FailureKind::Fault => "faulted",
                FailureKind::TimedOut => "timed_out",
            },
            Self::Abandoned => "abandoned",
        }
    }
}

/// Result of executing (or abandoning) one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult<T = serde_json::Value> {
    /// Identifier of the originating task
    pub task_id: TaskId,

    /// Index of the worker that owned the task (`None` if it never left the queue)
    pub worker: Option<usize>,

    /// What happened
    pub outcome: TaskOutcome<T>,

    /// When the task was submitted
    pub submitted_at: DateTime<Utc>,

    /// When the body started running
    pub started_at: Option<DateTime<Utc>>,

    /// When this result was created
    pub completed_at: DateTime<Utc>,

    /// Time spent inside the body
    pub elapsed: Duration,
}

impl<T> TaskResult<T> {
    pub(crate) fn abandoned(
        task_id: TaskId,
        worker: Option<usize>,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            worker,
            outcome: TaskOutcome::Abandoned,
            submitted_at,
            started_at: None,
            completed_at: Utc::now(),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether the task succeeded
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The success value, if any
    pub fn value(&self) -> Option<&T> {
        match &self.outcome {
            TaskOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    /// Consume the result, keeping only the success value
    pub fn into_value(self) -> Option<T> {
        match self.outcome {
            TaskOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }
}
