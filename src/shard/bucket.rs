//! Shard-space partitioning
//!
//! Splits the half-open shard range `[shard_start, shard_end)` into
//! contiguous, worker-sized buckets. The chunk index is the owning worker id,
//! and [`ShardLayout::resolve_worker_id`] is the exact inverse of that
//! chunking.

use crate::error::ClusterError;
use serde::{Deserialize, Serialize};

/// Shard identifier, `0 <= id < total_shards`
pub type ShardId = u32;

/// Worker identifier, `0 <= id < worker_count`
pub type WorkerId = u32;

/// Ordered shards owned by one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardGroup {
    pub worker_id: WorkerId,
    pub shards: Vec<ShardId>,
}

/// Partition `[shard_start, shard_end)` into chunks of `shards_per_worker`.
///
/// The final chunk may be shorter. Deterministic: the same inputs always
/// produce the same partition.
pub fn partition(
    shard_start: ShardId,
    shard_end: ShardId,
    shards_per_worker: u32,
) -> Result<Vec<ShardGroup>, ClusterError> {
    if shard_end <= shard_start || shards_per_worker == 0 {
        return Err(ClusterError::InvalidPartition {
            start: shard_start,
            end: shard_end,
            per_worker: shards_per_worker,
        });
    }

    let shards: Vec<ShardId> = (shard_start..shard_end).collect();
    let groups = shards
        .chunks(shards_per_worker as usize)
        .enumerate()
        .map(|(index, chunk)| ShardGroup {
            worker_id: index as WorkerId,
            shards: chunk.to_vec(),
        })
        .collect();

    Ok(groups)
}

/// Number of groups `partition` produces for a valid range
pub fn required_workers(shard_start: ShardId, shard_end: ShardId, shards_per_worker: u32) -> u32 {
    let span = shard_end.saturating_sub(shard_start);
    span.div_ceil(shards_per_worker.max(1))
}

/// Live shard layout of the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardLayout {
    pub total_shards: u32,
    pub shard_start: ShardId,
    pub shard_end: ShardId,
    pub shards_per_worker: u32,
    pub worker_count: u32,
}

impl ShardLayout {
    /// Partition this layout's shard range
    pub fn partition(&self) -> Result<Vec<ShardGroup>, ClusterError> {
        partition(self.shard_start, self.shard_end, self.shards_per_worker)
    }

    /// `floor((shard_id - shard_start) / shards_per_worker)`
    ///
    /// Fails immediately when the shard falls outside the configured workers.
    pub fn resolve_worker_id(&self, shard_id: ShardId) -> Result<WorkerId, ClusterError> {
        let out_of_range = ClusterError::ShardOutOfRange {
            shard_id,
            worker_count: self.worker_count,
        };

        let offset = shard_id.checked_sub(self.shard_start).ok_or(out_of_range)?;
        let worker_id = offset / self.shards_per_worker.max(1);

        if worker_id >= self.worker_count {
            return Err(ClusterError::ShardOutOfRange {
                shard_id,
                worker_count: self.worker_count,
            });
        }

        Ok(worker_id)
    }
}
