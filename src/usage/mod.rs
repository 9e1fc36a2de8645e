//! Usage recording
//!
//! Every gateway request ends with exactly one [`UsageRecord`]. Records
//! land in an in-memory ring for instant management queries and, when a
//! store is configured, in a bounded queue drained by a background writer
//! that batches inserts. The queue drops its *oldest* entry on overflow so
//! back-pressure never reaches the request path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::Store;
use crate::trace::TraceEvent;

pub const DEFAULT_RING_CAPACITY: usize = 2000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_WRITE_BATCH: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Terminal outcome of a gateway request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
    Cancelled,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Timeout => "timeout",
            ResponseStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(ResponseStatus::Success),
            "error" => Some(ResponseStatus::Error),
            "timeout" => Some(ResponseStatus::Timeout),
            "cancelled" => Some(ResponseStatus::Cancelled),
            _ => None,
        }
    }
}

/// Audit row for one completed gateway request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub workspace_id: String,
    pub request_id: String,
    pub trace_id: String,
    pub api_key_id: String,
    pub provider_id: String,
    pub incoming_model: String,
    pub selected_model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Filled once by the cost worker; never overwritten.
    pub cost_usd: Option<f64>,
    pub duration_ms: u64,
    pub response_status: ResponseStatus,
    pub created_at: DateTime<Utc>,
}

/// Filter for usage queries, shared by the ring and the store.
#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub workspace_id: Option<String>,
    pub api_key_id: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl UsageFilter {
    pub fn matches(&self, record: &UsageRecord) -> bool {
        if let Some(ws) = &self.workspace_id {
            if &record.workspace_id != ws {
                return false;
            }
        }
        if let Some(key) = &self.api_key_id {
            if &record.api_key_id != key {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if &record.provider_id != provider {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if &record.selected_model != model && &record.incoming_model != model {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.created_at > until {
                return false;
            }
        }
        true
    }
}

struct FlushItem {
    record: UsageRecord,
    events: Vec<TraceEvent>,
}

/// In-memory ring plus optional durable queue.
pub struct UsageSink {
    ring: Mutex<VecDeque<UsageRecord>>,
    ring_capacity: usize,
    queue: Mutex<VecDeque<FlushItem>>,
    queue_capacity: usize,
    dropped: AtomicU64,
    durable: bool,
}

impl UsageSink {
    pub fn new(durable: bool) -> Arc<Self> {
        Self::with_capacity(durable, DEFAULT_RING_CAPACITY, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(durable: bool, ring_capacity: usize, queue_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            ring_capacity,
            queue: Mutex::new(VecDeque::new()),
            queue_capacity,
            dropped: AtomicU64::new(0),
            durable,
        })
    }

    /// Record a completed request. Never blocks.
    pub fn submit(&self, record: UsageRecord, events: Vec<TraceEvent>) {
        {
            let mut ring = self.ring.lock();
            if ring.len() >= self.ring_capacity {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }

        if !self.durable {
            return;
        }

        let mut queue = self.queue.lock();
        if queue.len() >= self.queue_capacity {
            // Oldest out, newest in: the freshest data is the most useful
            // and the request path must never wait.
            queue.pop_front();
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "usage write queue full, dropped oldest record");
        }
        queue.push_back(FlushItem { record, events });
    }

    /// Most recent records matching the filter, newest first.
    pub fn query(&self, filter: &UsageFilter) -> Vec<UsageRecord> {
        let limit = filter.limit.unwrap_or(usize::MAX);
        self.ring
            .lock()
            .iter()
            .rev()
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn take_batch(&self, max: usize) -> Vec<FlushItem> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(max);
        queue.drain(..n).collect()
    }

    async fn flush(&self, store: &dyn Store, batch_size: usize) {
        loop {
            let batch = self.take_batch(batch_size);
            if batch.is_empty() {
                return;
            }
            let records: Vec<UsageRecord> = batch.iter().map(|i| i.record.clone()).collect();
            let events: Vec<TraceEvent> =
                batch.iter().flat_map(|i| i.events.iter().cloned()).collect();

            if let Err(e) = store.insert_usage(&records).await {
                warn!(error = %e, count = records.len(), "failed to persist usage batch");
            } else {
                debug!(count = records.len(), "persisted usage batch");
            }
            if !events.is_empty() {
                if let Err(e) = store.insert_trace_events(&events).await {
                    warn!(error = %e, count = events.len(), "failed to persist trace events");
                }
            }
        }
    }

    /// Spawn the background writer. On cancellation it flushes whatever is
    /// queued, then exits.
    pub fn spawn_writer(
        self: &Arc<Self>,
        store: Arc<dyn Store>,
        batch_size: usize,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let sink = self.clone();
        tokio::spawn(async move {
            info!(batch_size, "usage writer started");
            let mut timer = interval(flush_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        sink.flush(store.as_ref(), batch_size).await;
                        info!("usage writer stopped");
                        return;
                    }
                    _ = timer.tick() => {
                        sink.flush(store.as_ref(), batch_size).await;
                    }
                }
            }
        })
    }
}
