//! Shared priority work queue
//!
//! One queue serves every file a strategy downloads. The `low` lane
//! carries each file's discovery request, the `high` lane everything
//! else, so a free slot always goes to finishing a file already in
//! flight before admitting a new one: completing a download releases
//! buffers and its consumer, starting one only adds pressure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::trace;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Bounded-concurrency scheduler with high/low priority lanes
#[derive(Debug, Clone)]
pub struct WorkQueue {
    high: mpsc::UnboundedSender<Job>,
    low: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
    /// Start a queue running at most `workers` jobs simultaneously
    pub fn new(workers: usize) -> Self {
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (low_tx, low_rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(workers, high_rx, low_rx));
        Self {
            high: high_tx,
            low: low_tx,
        }
    }

    /// Submit a chunk task for a file already in progress
    pub fn submit_high(&self, job: impl Future<Output = ()> + Send + 'static) {
        let _ = self.high.send(Box::pin(job));
    }

    /// Submit the discovery task for a new file
    pub fn submit_low(&self, job: impl Future<Output = ()> + Send + 'static) {
        let _ = self.low.send(Box::pin(job));
    }
}

/// Pull jobs as slots free up, always draining `high` first
async fn dispatch(
    workers: usize,
    mut high_rx: mpsc::UnboundedReceiver<Job>,
    mut low_rx: mpsc::UnboundedReceiver<Job>,
) {
    let slots = Arc::new(Semaphore::new(workers));
    loop {
        let Ok(permit) = slots.clone().acquire_owned().await else {
            break;
        };
        let job = tokio::select! {
            biased;
            Some(job) = high_rx.recv() => job,
            Some(job) = low_rx.recv() => job,
            else => break,
        };
        trace!("dispatching job");
        tokio::spawn(async move {
            job.await;
            drop(permit);
        });
    }
}
