//! Shard partitioning
//!
//! Maps the configured shard range onto fixed-size worker buckets.

pub mod bucket;

pub use bucket::{partition, required_workers, ShardGroup, ShardId, ShardLayout, WorkerId};
