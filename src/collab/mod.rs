//! External collaborators the orchestrator calls into
//!
//! The core only depends on these seams: a named-method cache, a REST
//! transport, a dispatch sink with optional veto filters, a presence
//! function, and the gateway bootstrap source.

pub mod bootstrap;
pub mod cache;
pub mod filter;
pub mod rest;
pub mod sink;

pub use bootstrap::{fetch_bootstrap, static_bootstrap};
pub use cache::{CacheAdapter, MemoryCache};
pub use filter::{EventFilter, FilterSet};
pub use rest::{HttpRest, RestTransport};
pub use sink::{DispatchSink, TracingSink};

use crate::metrics::ClusterMetrics;
use crate::shard::{ShardId, WorkerId};
use serde_json::Value;
use std::sync::Arc;

/// Computes the identify presence for a shard, if any
pub type PresenceFn = Arc<dyn Fn(ShardId, WorkerId) -> Option<Value> + Send + Sync>;

/// Everything the router hands work off to
#[derive(Clone)]
pub struct Collaborators {
    pub cache: Arc<dyn CacheAdapter>,
    pub rest: Arc<dyn RestTransport>,
    pub sink: Arc<dyn DispatchSink>,
    pub filters: FilterSet,
    pub presence: Option<PresenceFn>,
    pub metrics: ClusterMetrics,
}

impl Collaborators {
    pub fn new(
        cache: Arc<dyn CacheAdapter>,
        rest: Arc<dyn RestTransport>,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        Self {
            cache,
            rest,
            sink,
            filters: FilterSet::new(),
            presence: None,
            metrics: ClusterMetrics::default(),
        }
    }

    pub fn with_filter(mut self, event_type: impl Into<String>, filter: Arc<dyn EventFilter>) -> Self {
        self.filters.add(event_type, filter);
        self
    }

    pub fn with_presence(mut self, presence: PresenceFn) -> Self {
        self.presence = Some(presence);
        self
    }

    pub fn with_metrics(mut self, metrics: ClusterMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Presence payload for a shard admission
    pub fn presence_for(&self, shard_id: ShardId, worker_id: WorkerId) -> Option<Value> {
        self.presence.as_ref().and_then(|f| f(shard_id, worker_id))
    }
}
