//! Dispatch envelope serialization
//!
//! Wraps raw gateway dispatch payloads received by workers into the JSON
//! envelope published to the message broker.

use crate::shard::{ShardId, WorkerId};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Envelope around one gateway dispatch
#[derive(Debug, Clone, Serialize)]
pub struct DispatchEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub shard_id: ShardId,
    pub worker_id: WorkerId,
    pub timestamp: u64,
    pub guild_id: Option<String>,
    pub channel_id: Option<String>,
    pub user_id: Option<String>,
    pub data: Value,
}

fn snowflake(data: &Value, key: &str) -> Option<String> {
    match data.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Build the envelope for a gateway payload.
///
/// Returns None for non-dispatch payloads (heartbeats, hello, reconnect).
pub fn envelope(shard_id: ShardId, worker_id: WorkerId, payload: &Value) -> Option<DispatchEnvelope> {
    let event_type = payload.get("t").and_then(Value::as_str)?;
    let data = payload.get("d").cloned().unwrap_or(Value::Null);

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default();

    let user_id = data
        .get("user")
        .and_then(|u| snowflake(u, "id"))
        .or_else(|| data.get("author").and_then(|a| snowflake(a, "id")))
        .or_else(|| snowflake(&data, "user_id"));

    Some(DispatchEnvelope {
        event_id: Uuid::new_v4().to_string(),
        event_type: event_type.to_ascii_lowercase().replace('_', "."),
        shard_id,
        worker_id,
        timestamp,
        guild_id: snowflake(&data, "guild_id"),
        channel_id: snowflake(&data, "channel_id"),
        user_id,
        data,
    })
}
