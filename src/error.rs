//! Domain error types for the Arrakis cluster orchestrator
//!
//! main.rs is the ONLY module allowed to use anyhow::Result (process boundary).
//! All library code returns Result<T, ClusterError>.

use crate::shard::{ShardId, WorkerId};
use std::time::Duration;
use thiserror::Error;

/// Boxed error used at collaborator seams (cache, REST, spawner)
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cluster domain errors
///
/// Every variant carries structured context fields for diagnostics.
///
/// Example log output:
/// ```text
/// ClusterError::Timeout { nonce: "9f2c...", after: 60s }
/// → "request 9f2c... timed out after 60s"
/// ```
#[derive(Error, Debug)]
pub enum ClusterError {
    /// Instruction addressed to a worker with no live handle
    #[error("worker {worker_id} does not exist")]
    WorkerNotFound { worker_id: WorkerId },

    /// Shard id resolves outside the configured worker range
    #[error("shard {shard_id} does not resolve to any of the {worker_count} configured workers")]
    ShardOutOfRange {
        shard_id: ShardId,
        worker_count: u32,
    },

    /// No reply arrived before the request deadline
    #[error("request {nonce} timed out after {after:?}")]
    Timeout { nonce: String, after: Duration },

    /// Configured worker count cannot hold every shard group
    #[error("{required} shard groups are required but only {configured} workers are configured")]
    InsufficientWorkers { required: usize, configured: u32 },

    /// Request from a worker id with no registered handle (routing corruption)
    #[error("{kind} request from unknown worker {worker_id}")]
    UnknownWorker { worker_id: WorkerId, kind: &'static str },

    /// Worker kept exiting right after spawn (respawn circuit tripped)
    #[error("worker {worker_id} exited {attempts} times in a row without staying up (limit {max})")]
    RespawnLimit {
        worker_id: WorkerId,
        attempts: u32,
        max: u32,
    },

    /// Worker channel closed while sending an instruction
    #[error("worker {worker_id} channel closed")]
    WorkerClosed { worker_id: WorkerId },

    /// Could not mint a nonce that is not already pending
    #[error("no unique nonce after {attempts} attempts")]
    NonceExhausted { attempts: usize },

    /// Partition inputs violate shardEnd > shardStart, shardsPerWorker >= 1
    #[error("invalid shard range [{start}, {end}) with {per_worker} shards per worker")]
    InvalidPartition {
        start: ShardId,
        end: ShardId,
        per_worker: u32,
    },

    /// Inbound loop already taken by another `run` call
    #[error("cluster is already running")]
    AlreadyRunning,

    /// Waiter dropped without reply or timeout (table torn down)
    #[error("reply for {nonce} was dropped")]
    ReplyDropped { nonce: String },

    /// Cache collaborator failed
    #[error("cache method '{method}' failed: {source}")]
    Cache {
        method: String,
        #[source]
        source: BoxError,
    },

    /// REST collaborator failed
    #[error("{method} {url} failed: {source}")]
    Rest {
        method: String,
        url: String,
        #[source]
        source: BoxError,
    },

    /// Gateway bootstrap endpoint failed
    #[error("gateway bootstrap failed")]
    Bootstrap(#[source] BoxError),

    /// NATS connection failed
    #[error("NATS connection failed")]
    NatsConnectionFailed(#[source] BoxError),

    /// Worker reported a failure for a correlated request
    #[error("worker reported error: {0}")]
    Remote(String),

    /// Worker could not be spawned
    #[error("failed to spawn worker {worker_id}")]
    Spawn {
        worker_id: WorkerId,
        #[source]
        source: BoxError,
    },

    /// Wire message could not be encoded or decoded
    #[error("message serialization failed")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (environment variable missing or invalid)
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClusterError {
    /// Returns a static label string suitable for Prometheus metrics.
    ///
    /// Used as the `error_type` label on `cluster_errors_total` counter.
    pub fn error_type_label(&self) -> &'static str {
        match self {
            Self::WorkerNotFound { .. } => "worker_not_found",
            Self::ShardOutOfRange { .. } => "shard_out_of_range",
            Self::Timeout { .. } => "timeout",
            Self::InsufficientWorkers { .. } => "insufficient_workers",
            Self::UnknownWorker { .. } => "unknown_worker",
            Self::RespawnLimit { .. } => "respawn_limit",
            Self::WorkerClosed { .. } => "worker_closed",
            Self::NonceExhausted { .. } => "nonce_exhausted",
            Self::InvalidPartition { .. } => "invalid_partition",
            Self::AlreadyRunning => "already_running",
            Self::ReplyDropped { .. } => "reply_dropped",
            Self::Cache { .. } => "cache",
            Self::Rest { .. } => "rest",
            Self::Bootstrap(_) => "bootstrap",
            Self::NatsConnectionFailed(_) => "nats_connection",
            Self::Remote(_) => "remote",
            Self::Spawn { .. } => "spawn",
            Self::Serialization(_) => "serialization",
            Self::Config(_) => "config",
        }
    }

    /// True for errors the caller may see simply because a reply was late
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
