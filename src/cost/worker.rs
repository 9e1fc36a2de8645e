//! Background cost worker
//!
//! Periodic task that prices uncalculated usage rows. Failures in one
//! tick are logged and the next tick retries; no backoff is applied
//! because the interval already bounds the load. On cancellation the
//! in-flight batch finishes before the task exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::aggregator::{CostAggregator, DEFAULT_BATCH_LIMIT};

pub const DEFAULT_WORKER_INTERVAL: Duration = Duration::from_secs(300);

pub struct CostWorker {
    aggregator: Arc<CostAggregator>,
    tick: Duration,
    batch_limit: u32,
}

impl CostWorker {
    pub fn new(aggregator: Arc<CostAggregator>) -> Self {
        Self {
            aggregator,
            tick: DEFAULT_WORKER_INTERVAL,
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }

    pub fn with_interval(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_batch_limit(mut self, limit: u32) -> Self {
        self.batch_limit = limit;
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(interval_secs = self.tick.as_secs(), "cost worker started");
        let mut timer = interval(self.tick);
        // The first tick fires immediately; that is wanted, it clears any
        // backlog left from a previous process.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cost worker stopped");
                    return;
                }
                _ = timer.tick() => {
                    match self.aggregator.process_batch(self.batch_limit).await {
                        Ok(0) => {}
                        Ok(updated) => info!(updated, "cost worker filled usage rows"),
                        Err(e) => warn!(error = %e, "cost worker tick failed"),
                    }
                }
            }
        }
    }
}

pub fn spawn_cost_worker(
    aggregator: Arc<CostAggregator>,
    tick: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let worker = CostWorker::new(aggregator).with_interval(tick);
    tokio::spawn(async move {
        worker.run(cancel).await;
    })
}
