//! Simulated job pipeline
//!
//! Pushes a batch of jobs with random durations and failure modes through a
//! dispatch engine configured from the environment, then prints a summary.
//!
//! Run with: cargo run -p everruns-dispatch --example pipeline
//! Tune with e.g. DISPATCH_WORKER_COUNT=8 DISPATCH_RATE_CAPACITY=20 RUST_LOG=everruns_dispatch=trace

use std::time::Duration;

use anyhow::{Context, Result};
use everruns_dispatch::prelude::*;
use rand::Rng;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const JOBS: u64 = 40;

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Succeed,
    Fail,
    Panic,
    Crunch,
}

fn job(id: u64, behaviour: Behaviour, work: Duration) -> Task<u64> {
    match behaviour {
        Behaviour::Succeed => Task::new(id, move || async move {
            tokio::time::sleep(work).await;
            anyhow::Ok(id * 2)
        }),
        Behaviour::Fail => Task::new(id, move || async move {
            tokio::time::sleep(work).await;
            Err::<u64, _>(anyhow::anyhow!("upstream returned 503"))
                .with_context(|| format!("fetching record {id}"))
        }),
        Behaviour::Panic => Task::new(id, move || async move {
            tokio::time::sleep(work).await;
            let records: Vec<u64> = Vec::new();
            anyhow::Ok(records[id as usize])
        }),
        Behaviour::Crunch => Task::blocking(id, move || {
            let rounds = work.as_millis() as u64 * 10_000;
            anyhow::Ok((0..rounds).fold(id, |acc, n| acc.wrapping_mul(31).wrapping_add(n)))
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "everruns_dispatch=debug,pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = EngineConfig::from_env().context("loading dispatch configuration")?;
    if config.worker_count == 1 && config.queue_capacity == 0 {
        config = config.with_worker_count(4).with_queue_capacity(8);
    }
    tracing::info!(?config, "Starting pipeline");

    let engine = DispatchEngine::<u64>::new(config)?;
    let mut results = engine.results();

    let consumer = tokio::spawn(async move {
        let mut summary = std::collections::BTreeMap::<&'static str, u64>::new();
        while let Some(result) = results.next_result().await {
            *summary.entry(result.outcome.label()).or_default() += 1;
            if let Some(failure) = result.outcome.failure() {
                tracing::info!(task_id = %result.task_id, %failure, "job did not succeed");
            }
        }
        summary
    });

    let mut rng = rand::thread_rng();
    for id in 0..JOBS {
        let behaviour = match rng.gen_range(0..10) {
            0 => Behaviour::Fail,
            1 => Behaviour::Panic,
            2 | 3 => Behaviour::Crunch,
            _ => Behaviour::Succeed,
        };
        let work = Duration::from_millis(rng.gen_range(5..60));
        engine.submit(job(id, behaviour, work)).await?;
    }

    if let Err(e) = engine.shutdown_default().await {
        tracing::warn!(error = %e, "Pipeline did not drain in time");
    }

    let summary = consumer.await?;
    tracing::info!(?summary, stats = ?engine.stats(), "Pipeline finished");
    Ok(())
}
