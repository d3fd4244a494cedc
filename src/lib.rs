//! Arrakis Cluster - multi-process gateway shard orchestrator
//!
//! Partitions a bot's gateway shards across worker processes and acts as the
//! hub between them:
//! - Buckets shards into fixed-size worker groups
//! - Rate-limits shard session starts through a rolling admission window
//! - Correlates worker request/reply pairs by nonce, with deadlines
//! - Relays cache, REST and cross-worker evaluation calls
//! - Signals cluster readiness once every worker reports ready

pub mod cluster;
pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod metrics;
pub mod nats;
pub mod protocol;
pub mod shard;
pub mod worker;

pub use cluster::{Cluster, ClusterOptions};
pub use error::ClusterError;
pub use worker::{WorkerClient, WorkerSpawner};
