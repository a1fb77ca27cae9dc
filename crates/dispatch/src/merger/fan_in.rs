//! Fan-in of per-worker result channels
//!
//! The merger forwards every result from every worker channel and from the
//! abandoned-report lane into one output channel, then closes the output
//! once all of them are exhausted.
//! Results from one worker keep their relative order; results from
//! different workers interleave in arrival order.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::engine::EngineStats;
use crate::task::TaskResult;

/// The merged stream of task results
///
/// Ends once every worker has exited and every result has been delivered.
/// Implements [`Stream`], so the usual combinators apply.
pub struct ResultStream<T> {
    rx: Option<mpsc::Receiver<TaskResult<T>>>,
}

impl<T> ResultStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<TaskResult<T>>) -> Self {
        Self { rx: Some(rx) }
    }

    /// A stream that is already finished
    pub(crate) fn terminated() -> Self {
        Self { rx: None }
    }

    /// Wait for the next result; `None` once the stream has ended
    pub async fn next_result(&mut self) -> Option<TaskResult<T>> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Collect every remaining result
    pub async fn collect_all(mut self) -> Vec<TaskResult<T>> {
        let mut results = Vec::new();
        while let Some(result) = self.next_result().await {
            results.push(result);
        }
        results
    }
}

impl<T> Stream for ResultStream<T> {
    type Item = TaskResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.rx.as_mut() {
            Some(rx) => rx.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

impl<T> std::fmt::Debug for ResultStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("terminated", &self.rx.is_none())
            .finish()
    }
}

enum Merged<T> {
    Result(TaskResult<T>),
    Exhausted(usize),
}

/// Coordinator that owns the output sender
pub(crate) struct ResultMerger<T> {
    inputs: Vec<mpsc::Receiver<TaskResult<T>>>,
    /// Results that never reached a worker (abandoned at shutdown); the
    /// engine closes it once no further reports can be produced
    side: mpsc::UnboundedReceiver<TaskResult<T>>,
    output: mpsc::Sender<TaskResult<T>>,
    expired: CancellationToken,
    stats: Arc<EngineStats>,
}

impl<T: Send + 'static> ResultMerger<T> {
    pub(crate) fn new(
        inputs: Vec<mpsc::Receiver<TaskResult<T>>>,
        side: mpsc::UnboundedReceiver<TaskResult<T>>,
        output: mpsc::Sender<TaskResult<T>>,
        expired: CancellationToken,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            inputs,
            side,
            output,
            expired,
            stats,
        }
    }

    /// Forward results until every input channel and the side lane have closed
    #[instrument(skip_all, fields(inputs = self.inputs.len()))]
    pub(crate) async fn run(mut self) {
        let mut live = self.inputs.len();
        let mut side_open = true;
        let streams: Vec<BoxStream<'static, Merged<T>>> = std::mem::take(&mut self.inputs)
            .into_iter()
            .enumerate()
            .map(|(index, rx)| {
                ReceiverStream::new(rx)
                    .map(Merged::Result)
                    .chain(stream::once(async move { Merged::Exhausted(index) }))
                    .boxed()
            })
            .collect();
        let mut merged = stream::select_all(streams);
        let mut delivering = true;

        while live > 0 || side_open {
            tokio::select! {
                biased;
                item = merged.next(), if live > 0 => match item {
                    Some(Merged::Result(result)) => {
                        delivering = self.forward(result, delivering).await;
                    }
                    Some(Merged::Exhausted(worker)) => {
                        live -= 1;
                        debug!(worker, remaining = live, "worker result channel closed");
                    }
                    None => live = 0,
                },
                report = self.side.recv(), if side_open => match report {
                    Some(result) => {
                        delivering = self.forward(result, delivering).await;
                    }
                    None => side_open = false,
                },
            }
        }

        debug!("all worker channels closed; result stream ends");
    }

    /// Deliver one result; returns whether later results should still be delivered
    async fn forward(&self, result: TaskResult<T>, delivering: bool) -> bool {
        if !delivering {
            self.stats.record_dropped();
            return false;
        }

        tokio::select! {
            biased;
            sent = self.output.send(result) => {
                if sent.is_err() {
                    self.stats.record_dropped();
                    debug!("result consumer went away; discarding further results");
                    return false;
                }
                true
            }
            _ = self.expired.cancelled() => {
                self.stats.record_dropped();
                warn!("shutdown deadline passed with undelivered results; discarding");
                false
            }
        }
    }
}
