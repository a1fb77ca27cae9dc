//! Fault isolation for task bodies
//!
//! Runs a body so that neither an error nor a panic can escape into the
//! worker loop. Both become a [`TaskOutcome::Failed`].

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;

use crate::task::{TaskBody, TaskFailure, TaskOutcome};

/// Run a body to completion, converting every failure mode into data
///
/// With a `limit`, a body still running when it elapses yields
/// [`FailureKind::TimedOut`](crate::FailureKind::TimedOut). Async bodies are
/// dropped at that point; blocking bodies keep their pool thread until they
/// return, but their result is discarded.
pub(crate) async fn run_isolated<T>(body: TaskBody<T>, limit: Option<Duration>) -> TaskOutcome<T>
where
    T: Send + 'static,
{
    let run = execute(body);
    match limit {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::Failed(TaskFailure::timed_out(limit)),
        },
        None => run.await,
    }
}

async fn execute<T>(body: TaskBody<T>) -> TaskOutcome<T>
where
    T: Send + 'static,
{
    let finished = match body {
        TaskBody::Async(start) => {
            // Creating the future runs caller code too, so it sits inside the guard.
            match AssertUnwindSafe(async move { start().await })
                .catch_unwind()
                .await
            {
                Ok(finished) => finished,
                Err(payload) => return TaskOutcome::Failed(TaskFailure::fault(payload)),
            }
        }
        TaskBody::Blocking(run) => match tokio::task::spawn_blocking(run).await {
            Ok(finished) => finished,
            Err(join_error) => {
                return match join_error.try_into_panic() {
                    Ok(payload) => TaskOutcome::Failed(TaskFailure::fault(payload)),
                    Err(join_error) => TaskOutcome::Failed(TaskFailure::error(
                        &anyhow::Error::new(join_error).context("blocking task did not complete"),
                    )),
                };
            }
        },
    };

    match finished {
        Ok(value) => TaskOutcome::Succeeded(value),
        Err(err) => TaskOutcome::Failed(TaskFailure::error(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{FailureKind, Task};
    use anyhow::Context;

    fn body<T>(task: Task<T>) -> TaskBody<T> {
        task.into_parts().1
    }

    #[tokio::test]
    async fn test_success() {
        let outcome = run_isolated(body(Task::new("ok", || async { anyhow::Ok(5u32) })), None).await;
        assert_eq!(outcome, TaskOutcome::Succeeded(5));
    }

    #[tokio::test]
    async fn test_error_keeps_context() {
        let task: Task<u32> = Task::new("err", || async {
            std::fs::read_to_string("/definitely/not/here")
                .context("loading fixture")
                .map(|s| s.len() as u32)
        });
        let outcome = run_isolated(body(task), None).await;

        let failure = outcome.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Error);
        assert_eq!(failure.message, "loading fixture");
        assert!(failure.trace.is_some());
    }

    #[tokio::test]
    async fn test_async_panic_becomes_fault() {
        let task: Task<u32> = Task::new("boom", || async {
            let explode = true;
            if explode {
                panic!("worker exploded");
            }
            anyhow::Ok(0)
        });
        let outcome = run_isolated(body(task), None).await;

        let failure = outcome.failure().unwrap();
        assert!(failure.is_fault());
        assert_eq!(failure.message, "panic: worker exploded");
    }

    #[tokio::test]
    async fn test_panic_while_building_future_becomes_fault() {
        #[allow(unreachable_code)]
        let task: Task<u32> = Task::new("eager", || {
            panic!("before the first poll");
            async { anyhow::Ok(1) }
        });
        let outcome = run_isolated(body(task), None).await;
        assert!(outcome.failure().unwrap().is_fault());
    }

    #[tokio::test]
    async fn test_blocking_body_success_and_panic() {
        let sum = Task::blocking("sum", || anyhow::Ok((1..=10u32).sum::<u32>()));
        let ok = run_isolated(body(sum), None).await;
        assert_eq!(ok, TaskOutcome::Succeeded(55));

        let task: Task<u32> = Task::blocking("bad", || panic!("blocking failure {}", 7));
        let outcome = run_isolated(body(task), None).await;
        assert_eq!(outcome.failure().unwrap().message, "panic: blocking failure 7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_times_out_slow_body() {
        let task: Task<()> = Task::new("slow", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            anyhow::Ok(())
        });
        let outcome = run_isolated(body(task), Some(Duration::from_millis(100))).await;
        assert_eq!(outcome.failure().unwrap().kind, FailureKind::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_does_not_affect_fast_body() {
        let task: Task<u8> = Task::new("fast", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            anyhow::Ok(1)
        });
        let outcome = run_isolated(body(task), Some(Duration::from_millis(100))).await;
        assert!(outcome.is_success());
    }
}
