//! Dispatch throughput benchmark
//!
//! Measures the submit → execute → merged result path for trivial task
//! bodies, across pool sizes and queue capacities.

use std::time::{Duration, Instant};

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use everruns_dispatch::{DispatchEngine, EngineConfig, Task};

const TASKS_PER_RUN: u64 = 1_000;

/// Run `TASKS_PER_RUN` no-op tasks through a fresh engine and time it
async fn run_batch(workers: usize, capacity: usize) -> Duration {
    let engine = DispatchEngine::<u64>::new(EngineConfig::new(workers, capacity)).unwrap();
    let consumer = tokio::spawn(engine.results().collect_all());

    let start = Instant::now();
    for n in 0..TASKS_PER_RUN {
        engine
            .submit(Task::new(n, move || async move { anyhow::Ok(n) }))
            .await
            .unwrap();
    }
    engine.shutdown(Duration::from_secs(30)).await.unwrap();
    let results = consumer.await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(results.len() as u64, TASKS_PER_RUN);
    elapsed
}

/// Throughput by worker count with a generous queue
fn bench_workers(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch/workers");
    group.throughput(Throughput::Elements(TASKS_PER_RUN));

    for workers in [1, 4, 8, 16] {
        group.bench_with_input(
            BenchmarkId::new("workers", workers),
            &workers,
            |b, &workers| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        total += run_batch(workers, 256).await;
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

/// Cost of backpressure: same pool, shrinking queue down to rendezvous
fn bench_queue_capacity(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dispatch/queue_capacity");
    group.throughput(Throughput::Elements(TASKS_PER_RUN));

    for capacity in [0, 1, 16, 256] {
        group.bench_with_input(
            BenchmarkId::new("capacity", capacity),
            &capacity,
            |b, &capacity| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        total += run_batch(4, capacity).await;
                    }
                    total
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_workers, bench_queue_capacity);

criterion_main!(benches);
