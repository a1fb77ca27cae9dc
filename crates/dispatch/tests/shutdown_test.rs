// Integration tests for DispatchEngine shutdown
//
// Graceful drain, deadline expiry, immediate mode, rate-limited workers and
// repeated or racing shutdown calls.
//
// Run with: cargo test -p everruns-dispatch --test shutdown_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use everruns_dispatch::{
    DispatchEngine, EngineConfig, EngineError, EngineState, RateLimitConfig, SignalState, Task,
    TaskResult, WorkerState,
};
use tokio::sync::Semaphore;

fn collect(engine: &DispatchEngine<u32>) -> tokio::task::JoinHandle<Vec<TaskResult<u32>>> {
    tokio::spawn(engine.results().collect_all())
}

fn sleeper(id: &str, millis: u64, runs: &Arc<AtomicUsize>) -> Task<u32> {
    let runs = Arc::clone(runs);
    Task::new(id, move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        anyhow::Ok(millis as u32)
    })
}

async fn wait_until(engine: &DispatchEngine<u32>, predicate: impl Fn(&[WorkerState]) -> bool) {
    while !predicate(&engine.worker_states()) {
        tokio::task::yield_now().await;
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_graceful_shutdown_runs_everything_queued() {
    let engine = DispatchEngine::<u32>::new(EngineConfig::new(2, 10)).unwrap();
    let collector = collect(&engine);
    let runs = Arc::new(AtomicUsize::new(0));

    for n in 0..10 {
        engine.submit(sleeper(&format!("job-{n}"), 10, &runs)).await.unwrap();
    }
    engine.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(engine.signal_state(), SignalState::Drained);
    assert!(engine
        .worker_states()
        .iter()
        .all(|state| *state == WorkerState::Exited));
    assert_eq!(runs.load(Ordering::SeqCst), 10);
    assert_eq!(collector.await.unwrap().len(), 10);
    assert_eq!(engine.stats().abandoned, 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_abandons_queued_tasks_and_reports_them() {
    let config = EngineConfig::new(1, 4).with_report_abandoned(true);
    let engine = DispatchEngine::<u32>::new(config).unwrap();
    let collector = collect(&engine);
    let runs = Arc::new(AtomicUsize::new(0));

    engine.submit(sleeper("long", 10_000, &runs)).await.unwrap();
    wait_until(&engine, |states| states[0] == WorkerState::Executing).await;
    for n in 0..3 {
        engine.submit(sleeper(&format!("queued-{n}"), 1, &runs)).await.unwrap();
    }

    let outcome = engine.shutdown(Duration::from_millis(100)).await;
    assert_eq!(
        outcome,
        Err(EngineError::ShutdownTimeout {
            deadline: Duration::from_millis(100),
            remaining: 1,
        })
    );
    assert_eq!(engine.state(), EngineState::StoppedWithTimeout);
    assert_eq!(engine.queued(), 0);

    // The in-flight task is never killed; it still delivers its result.
    let results = collector.await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 4);

    let abandoned: Vec<&TaskResult<u32>> =
        results.iter().filter(|r| r.outcome.is_abandoned()).collect();
    assert_eq!(abandoned.len(), 3);
    assert!(abandoned.iter().all(|r| r.worker.is_none() && r.started_at.is_none()));

    let long = results.iter().find(|r| r.task_id.as_str() == "long").unwrap();
    assert_eq!(long.value(), Some(&10_000));

    let stats = engine.stats();
    assert_eq!(stats.abandoned, 3);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.settled(), stats.submitted);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_without_reporting_only_counts_abandoned() {
    let engine = DispatchEngine::<u32>::new(EngineConfig::new(1, 4)).unwrap();
    let collector = collect(&engine);
    let runs = Arc::new(AtomicUsize::new(0));

    engine.submit(sleeper("long", 1_000, &runs)).await.unwrap();
    wait_until(&engine, |states| states[0] == WorkerState::Executing).await;
    engine.submit(sleeper("queued", 1, &runs)).await.unwrap();

    assert!(matches!(
        engine.shutdown(Duration::from_millis(10)).await,
        Err(EngineError::ShutdownTimeout { .. })
    ));

    let results = collector.await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id.as_str(), "long");
    assert_eq!(engine.stats().abandoned, 1);
}

#[tokio::test(start_paused = true)]
async fn test_immediate_shutdown_skips_queued_tasks() {
    let config = EngineConfig::new(1, 8).with_report_abandoned(true);
    let engine = DispatchEngine::<u32>::new(config).unwrap();
    let collector = collect(&engine);
    let runs = Arc::new(AtomicUsize::new(0));

    engine.submit(sleeper("in-flight", 200, &runs)).await.unwrap();
    wait_until(&engine, |states| states[0] == WorkerState::Executing).await;
    for n in 0..5 {
        engine.submit(sleeper(&format!("queued-{n}"), 1, &runs)).await.unwrap();
    }

    engine.shutdown_now(Duration::from_secs(5)).await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let results = collector.await.unwrap();
    assert_eq!(results.len(), 6);
    assert_eq!(results.iter().filter(|r| r.outcome.is_abandoned()).count(), 5);
    assert!(results
        .iter()
        .any(|r| r.task_id.as_str() == "in-flight" && r.is_success()));

    let stats = engine.stats();
    assert_eq!(stats.abandoned, 5);
    assert_eq!(stats.completed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_capacity_rate_limit_releases_workers_at_deadline() {
    let config = EngineConfig::new(2, 2)
        .with_rate_limit(RateLimitConfig::new(0, Duration::from_millis(10), 1));
    let engine = DispatchEngine::<u32>::new(config).unwrap();
    let collector = collect(&engine);
    let runs = Arc::new(AtomicUsize::new(0));

    engine.submit(sleeper("starved-0", 1, &runs)).await.unwrap();
    engine.submit(sleeper("starved-1", 1, &runs)).await.unwrap();
    wait_until(&engine, |states| {
        states.iter().all(|state| *state == WorkerState::RateLimited)
    })
    .await;

    assert!(matches!(
        engine.shutdown(Duration::from_millis(100)).await,
        Err(EngineError::ShutdownTimeout { .. })
    ));

    // Tasks held while waiting for a token come back as abandoned, never lost.
    let results = collector.await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results
        .iter()
        .all(|r| r.outcome.is_abandoned() && r.worker.is_some()));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(engine.stats().interrupted, 2);

    while engine.signal_state() != SignalState::Drained {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_concurrent_shutdowns_one_wins() {
    let engine = DispatchEngine::<u32>::new(EngineConfig::new(2, 2)).unwrap();
    let _results = engine.results();

    let (first, second) = tokio::join!(
        engine.shutdown(Duration::from_secs(1)),
        engine.shutdown_now(Duration::from_secs(1))
    );

    let outcomes = [first, second];
    assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
    assert!(outcomes.contains(&Err(EngineError::EngineClosed)));
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_blocked_producer_is_released_by_shutdown() {
    let engine = Arc::new(DispatchEngine::<u32>::new(EngineConfig::new(1, 0)).unwrap());
    let collector = collect(&engine);
    let gate = Arc::new(Semaphore::new(0));

    let blocker = {
        let gate = Arc::clone(&gate);
        Task::new("blocker", move || async move {
            let _permit = gate.acquire().await?;
            anyhow::Ok(7)
        })
    };
    engine.submit(blocker).await.unwrap();
    wait_until(&engine, |states| states[0] == WorkerState::Executing).await;

    let producer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .submit(Task::new("stuck", || async { anyhow::Ok(0) }))
                .await
        })
    };
    tokio::task::yield_now().await;
    assert!(!producer.is_finished());

    let shutdown = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.shutdown(Duration::from_secs(5)).await })
    };
    assert_eq!(producer.await.unwrap(), Err(EngineError::EngineClosed));

    gate.add_permits(1);
    shutdown.await.unwrap().unwrap();

    let results = collector.await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value(), Some(&7));
}

#[tokio::test]
async fn test_dropping_engine_ends_result_stream() {
    let engine = DispatchEngine::<u32>::new(EngineConfig::new(2, 4)).unwrap();
    let mut results = engine.results();
    engine
        .submit(Task::new("last", || async { anyhow::Ok(1) }))
        .await
        .unwrap();
    drop(engine);

    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        let mut seen = 0;
        while results.next_result().await.is_some() {
            seen += 1;
        }
        seen
    })
    .await
    .expect("result stream did not end after the engine was dropped");
    assert!(drained <= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_immediate_shutdown_reports_every_abandoned_task_across_threads() {
    for round in 0..200 {
        let config = EngineConfig::new(4, 64).with_report_abandoned(true);
        let engine = DispatchEngine::<u32>::new(config).unwrap();
        let collector = collect(&engine);

        for n in 0..32u32 {
            engine
                .try_submit(Task::new(format!("job-{n}"), move || async move { anyhow::Ok(n) }))
                .unwrap();
        }
        engine.shutdown_now(Duration::from_secs(5)).await.unwrap();

        let results = collector.await.unwrap();
        let stats = engine.stats();
        assert_eq!(results.len(), 32, "round {round}: {stats:?}");
        assert_eq!(stats.results_dropped, 0, "round {round}: {stats:?}");
        assert_eq!(stats.settled(), 32, "round {round}: {stats:?}");
        assert_eq!(
            results.iter().filter(|r| r.outcome.is_abandoned()).count() as u64,
            stats.abandoned
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_dropped_shutdown_call_still_reaches_stopped() {
    let engine = DispatchEngine::<u32>::new(EngineConfig::new(1, 2)).unwrap();
    let collector = collect(&engine);
    let runs = Arc::new(AtomicUsize::new(0));

    engine.submit(sleeper("slow", 100, &runs)).await.unwrap();
    wait_until(&engine, |states| states[0] == WorkerState::Executing).await;

    let gave_up =
        tokio::time::timeout(Duration::from_millis(10), engine.shutdown(Duration::from_secs(5)))
            .await;
    assert!(gave_up.is_err());
    assert_eq!(engine.state(), EngineState::ShuttingDown);

    while engine.signal_state() != SignalState::Drained {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.state(), EngineState::Stopped);
    assert_eq!(
        engine.shutdown(Duration::from_secs(1)).await,
        Err(EngineError::EngineClosed)
    );
    assert_eq!(engine.state(), EngineState::Stopped);

    let results = collector.await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].value(), Some(&100));
}

#[tokio::test]
async fn test_dropping_engine_reports_queued_tasks_as_abandoned() {
    let config = EngineConfig::new(1, 4).with_report_abandoned(true);
    let engine = DispatchEngine::<u32>::new(config).unwrap();
    let collector = collect(&engine);
    let runs = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let blocker = {
        let gate = Arc::clone(&gate);
        Task::new("blocker", move || async move {
            let _permit = gate.acquire().await?;
            anyhow::Ok(7)
        })
    };
    engine.submit(blocker).await.unwrap();
    wait_until(&engine, |states| states[0] == WorkerState::Executing).await;
    for n in 0..3 {
        engine.submit(sleeper(&format!("queued-{n}"), 1, &runs)).await.unwrap();
    }

    drop(engine);
    gate.add_permits(1);

    let results = tokio::time::timeout(Duration::from_secs(5), collector)
        .await
        .expect("result stream did not end after the engine was dropped")
        .unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let blocker = results.iter().find(|r| r.task_id.as_str() == "blocker").unwrap();
    assert_eq!(blocker.value(), Some(&7));
    let abandoned: Vec<&str> = results
        .iter()
        .filter(|r| r.outcome.is_abandoned())
        .map(|r| r.task_id.as_str())
        .collect();
    assert_eq!(abandoned, ["queued-0", "queued-1", "queued-2"]);
}
