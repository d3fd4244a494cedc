//! Orchestrator <-> worker wire protocol
//!
//! Both directions are closed, internally tagged enums. Every message crosses
//! the process boundary as one JSON object per line (see [`codec`]).

pub mod codec;

use crate::shard::{ShardId, WorkerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Session start limit reported by the gateway bootstrap endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    pub max_concurrency: u32,
}

/// Gateway bootstrap info forwarded to every worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayBootstrap {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Identify connection properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionProperties {
    pub os: String,
    pub browser: String,
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: env!("CARGO_PKG_NAME").to_string(),
            device: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

/// Instructions sent from the orchestrator to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClusterMessage {
    /// Initial shard assignment
    SpawnShards {
        shards: Vec<ShardId>,
        compress: bool,
        bootstrap: GatewayBootstrap,
        properties: ConnectionProperties,
    },
    /// Admission grant for one shard
    AllowConnect {
        shard_id: ShardId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        presence: Option<Value>,
    },
    /// Outbound gateway payload; the worker acks with the same nonce
    SendPayload {
        nonce: String,
        shard_id: ShardId,
        payload: Value,
    },
    ShardInfoRequest {
        nonce: String,
        shard_id: ShardId,
    },
    WorkerInfoRequest {
        nonce: String,
    },
    CacheResult {
        nonce: String,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Every worker reported ready; sent to one worker only
    ClusterReady,
    ApiResponse {
        nonce: String,
        #[serde(default)]
        response: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Run `script` on behalf of another worker and reply with `nonce`
    ExecuteEvaluation {
        nonce: String,
        script: String,
        target_worker: WorkerId,
    },
    /// Final evaluation result, tagged with the requester's own nonce
    EvaluationResponse {
        nonce: String,
        #[serde(default)]
        response: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Orchestrator is going away; the worker should close its shards
    Shutdown,
}

impl ClusterMessage {
    /// Wire discriminant, used for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SpawnShards { .. } => "spawn_shards",
            Self::AllowConnect { .. } => "allow_connect",
            Self::SendPayload { .. } => "send_payload",
            Self::ShardInfoRequest { .. } => "shard_info_request",
            Self::WorkerInfoRequest { .. } => "worker_info_request",
            Self::CacheResult { .. } => "cache_result",
            Self::ClusterReady => "cluster_ready",
            Self::ApiResponse { .. } => "api_response",
            Self::ExecuteEvaluation { .. } => "execute_evaluation",
            Self::EvaluationResponse { .. } => "evaluation_response",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Messages sent from a worker to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// A shard wants to start a session
    AdmissionRequest { shard_id: ShardId },
    CacheRequest {
        nonce: String,
        method: String,
        #[serde(default)]
        args: Vec<Value>,
    },
    /// Inbound gateway payload received by one of the worker's shards
    Payload { shard_id: ShardId, payload: Value },
    Ack { nonce: String },
    ShardInfo { nonce: String, data: Value },
    WorkerInfo { nonce: String, data: Value },
    Ready,
    ApiRequest {
        nonce: String,
        method: String,
        url: String,
        #[serde(default)]
        options: Value,
    },
    /// Ask the orchestrator to run `script` on `target_worker`
    EvaluationRequest {
        nonce: String,
        script: String,
        target_worker: WorkerId,
    },
    /// Result of an `execute_evaluation` instruction
    EvaluationReply {
        nonce: String,
        #[serde(default)]
        response: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl WorkerMessage {
    /// Wire discriminant, used as a metrics label
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AdmissionRequest { .. } => "admission_request",
            Self::CacheRequest { .. } => "cache_request",
            Self::Payload { .. } => "payload",
            Self::Ack { .. } => "ack",
            Self::ShardInfo { .. } => "shard_info",
            Self::WorkerInfo { .. } => "worker_info",
            Self::Ready => "ready",
            Self::ApiRequest { .. } => "api_request",
            Self::EvaluationRequest { .. } => "evaluation_request",
            Self::EvaluationReply { .. } => "evaluation_reply",
        }
    }
}

/// A worker message tagged with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub worker_id: WorkerId,
    pub message: WorkerMessage,
}

/// Everything the orchestrator's inbound loop receives
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Envelope),
    /// The worker's transport closed
    Exited { worker_id: WorkerId },
}

/// Split a collaborator result into the `(value, error)` reply fields
pub fn reply_fields<E: std::fmt::Display>(result: Result<Value, E>) -> (Option<Value>, Option<String>) {
    match result {
        Ok(value) => (Some(value), None),
        Err(e) => (None, Some(e.to_string())),
    }
}
