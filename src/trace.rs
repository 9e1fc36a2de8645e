//! Per-request trace event log
//!
//! Fixed-capacity ring of recent events. Appends are O(1); eviction is by
//! age with no durability contract. Event order within a trace is assigned
//! from a per-trace counter at emission, so concurrent stages of one
//! request can never interleave their order numbers.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_TRACE_CAPACITY: usize = 4000;

/// Stage labels used by the gateway pipeline.
pub mod stage {
    pub const AUTH_OK: &str = "auth.ok";
    pub const ROUTE_SELECTED: &str = "route.selected";
    pub const ATTEMPT_START: &str = "attempt.start";
    pub const ATTEMPT_END: &str = "attempt.end";
    pub const STREAM_CHUNK: &str = "stream.chunk";
    pub const FINALIZE: &str = "finalize";
}

/// One recorded pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub trace_id: String,
    pub request_id: String,
    pub event_order: u64,
    pub timestamp: DateTime<Utc>,
    pub stage: String,
    pub payload: Value,
}

struct TraceCounter {
    next_order: u64,
    live_events: usize,
}

/// Ring-buffered trace store.
pub struct TraceStore {
    ring: Mutex<VecDeque<TraceEvent>>,
    counters: DashMap<String, TraceCounter>,
    capacity: usize,
}

impl TraceStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            counters: DashMap::new(),
            capacity,
        }
    }

    /// Append an event, assigning its order number. Returns the stored event.
    pub fn append(
        &self,
        trace_id: &str,
        request_id: &str,
        stage: &str,
        payload: Value,
    ) -> TraceEvent {
        let event_order = {
            let mut counter = self
                .counters
                .entry(trace_id.to_string())
                .or_insert(TraceCounter {
                    next_order: 0,
                    live_events: 0,
                });
            let order = counter.next_order;
            counter.next_order += 1;
            counter.live_events += 1;
            order
        };

        let event = TraceEvent {
            trace_id: trace_id.to_string(),
            request_id: request_id.to_string(),
            event_order,
            timestamp: Utc::now(),
            stage: stage.to_string(),
            payload,
        };

        let evicted = {
            let mut ring = self.ring.lock();
            let evicted = if ring.len() >= self.capacity {
                ring.pop_front()
            } else {
                None
            };
            ring.push_back(event.clone());
            evicted
        };

        // Drop the order counter once a trace has fully aged out, otherwise
        // the counter map grows for the lifetime of the process.
        if let Some(old) = evicted {
            self.release(&old.trace_id);
        }

        event
    }

    fn release(&self, trace_id: &str) {
        let remove = match self.counters.get_mut(trace_id) {
            Some(mut counter) => {
                counter.live_events = counter.live_events.saturating_sub(1);
                counter.live_events == 0
            }
            None => false,
        };
        if remove {
            self.counters.remove(trace_id);
        }
    }

    /// Events for one trace, in event order.
    pub fn get(&self, trace_id: &str) -> Vec<TraceEvent> {
        let mut events: Vec<TraceEvent> = self
            .ring
            .lock()
            .iter()
            .filter(|e| e.trace_id == trace_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.event_order);
        events
    }

    pub fn len(&self) -> usize {
        self.ring.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }
}

impl Default for TraceStore {
    fn default() -> Self {
        Self::new(DEFAULT_TRACE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_order_is_monotone_per_trace() {
        let store = TraceStore::new(100);
        store.append("t1", "r1", stage::AUTH_OK, json!({}));
        store.append("t2", "r2", stage::AUTH_OK, json!({}));
        store.append("t1", "r1", stage::ATTEMPT_START, json!({"candidate": "openai"}));
        store.append("t1", "r1", stage::ATTEMPT_END, json!({"outcome": "success"}));

        let events = store.get("t1");
        assert_eq!(events.len(), 3);
        assert_eq!(
            events.iter().map(|e| e.event_order).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(store.get("t2")[0].event_order, 0);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let store = TraceStore::new(3);
        for i in 0..5 {
            store.append(&format!("t{}", i), "r", stage::AUTH_OK, json!({}));
        }
        assert_eq!(store.len(), 3);
        assert!(store.get("t0").is_empty());
        assert!(store.get("t1").is_empty());
        assert_eq!(store.get("t4").len(), 1);
    }

    #[test]
    fn test_counter_released_after_full_eviction() {
        let store = TraceStore::new(2);
        store.append("gone", "r", stage::AUTH_OK, json!({}));
        store.append("stay", "r", stage::AUTH_OK, json!({}));
        store.append("stay", "r", stage::FINALIZE, json!({}));
        // "gone" fully evicted; its counter entry must not linger.
        assert!(!store.counters.contains_key("gone"));
        assert!(store.counters.contains_key("stay"));
    }

    #[test]
    fn test_get_unknown_trace_is_empty() {
        let store = TraceStore::default();
        assert!(store.get("missing").is_empty());
    }
}
