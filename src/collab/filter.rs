//! Delivery veto filters
//!
//! Filters are keyed by gateway event type (the payload's `t` field) and run
//! before a payload reaches the dispatch sink. Any filter returning false
//! drops the payload.

use crate::shard::{ShardId, WorkerId};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Veto hook for one event type
pub trait EventFilter: Send + Sync {
    fn allow(&self, shard_id: ShardId, worker_id: WorkerId, payload: &Value) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(ShardId, WorkerId, &Value) -> bool + Send + Sync,
{
    fn allow(&self, shard_id: ShardId, worker_id: WorkerId, payload: &Value) -> bool {
        self(shard_id, worker_id, payload)
    }
}

/// Filters grouped by event type
#[derive(Clone, Default)]
pub struct FilterSet {
    filters: HashMap<String, Vec<Arc<dyn EventFilter>>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `filter` for `event_type` (e.g. `PRESENCE_UPDATE`)
    pub fn add(&mut self, event_type: impl Into<String>, filter: Arc<dyn EventFilter>) {
        self.filters.entry(event_type.into()).or_default().push(filter);
    }

    /// True when every filter for `event_type` lets the payload through
    pub fn allows(&self, event_type: &str, shard_id: ShardId, worker_id: WorkerId, payload: &Value) -> bool {
        self.filters
            .get(event_type)
            .map_or(true, |filters| {
                filters.iter().all(|f| f.allow(shard_id, worker_id, payload))
            })
    }

    pub fn len(&self) -> usize {
        self.filters.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Gateway event type carried in a dispatch payload
pub fn event_type(payload: &Value) -> &str {
    payload.get("t").and_then(Value::as_str).unwrap_or_default()
}
