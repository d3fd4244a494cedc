//! Dispatch sink seam

use crate::shard::{ShardId, WorkerId};
use serde_json::Value;
use tracing::debug;

/// Receives every inbound gateway payload that survived the filters.
///
/// Called from the router's inbound loop, so implementations must not block;
/// hand slow work to a background task.
pub trait DispatchSink: Send + Sync {
    fn deliver(&self, shard_id: ShardId, worker_id: WorkerId, payload: Value);
}

/// Logs payloads instead of forwarding them (local mode)
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DispatchSink for TracingSink {
    fn deliver(&self, shard_id: ShardId, worker_id: WorkerId, payload: Value) {
        let event_type = crate::collab::filter::event_type(&payload);
        debug!(shard_id, worker_id, event_type, "Gateway payload");
    }
}
