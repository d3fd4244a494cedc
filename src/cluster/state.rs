//! Cluster state tracking
//!
//! Shared snapshot of worker health, read by the health endpoints while the
//! router updates it.

use crate::shard::{ShardId, WorkerId};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Health status for a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    /// Process started, shards still negotiating sessions
    Spawned,
    /// Worker reported all of its shards ready
    Ready,
    /// Transport closed
    Exited,
}

impl WorkerHealth {
    /// Returns true if the worker is still attached
    pub fn is_live(&self) -> bool {
        !matches!(self, WorkerHealth::Exited)
    }
}

/// State for a single worker
#[derive(Debug)]
pub struct WorkerStateEntry {
    pub health: WorkerHealth,
    pub shards: Vec<ShardId>,
    pub spawn_count: u32,
    pub messages_received: AtomicU64,
    pub admissions: AtomicU64,
    pub spawned_at: Instant,
}

/// Serializable view of one worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub health: WorkerHealth,
    pub shards: Vec<ShardId>,
    pub spawn_count: u32,
    pub messages_received: u64,
    pub admissions: u64,
    pub uptime_secs: u64,
}

/// Shared state across the cluster
#[derive(Debug, Clone)]
pub struct ClusterState {
    inner: Arc<ClusterStateInner>,
}

#[derive(Debug)]
struct ClusterStateInner {
    total_shards: u32,
    worker_count: u32,
    workers: DashMap<WorkerId, WorkerStateEntry>,
    cluster_ready: AtomicBool,
    ready_broadcasts: AtomicU64,
}

impl ClusterState {
    pub fn new(total_shards: u32, worker_count: u32) -> Self {
        Self {
            inner: Arc::new(ClusterStateInner {
                total_shards,
                worker_count,
                workers: DashMap::new(),
                cluster_ready: AtomicBool::new(false),
                ready_broadcasts: AtomicU64::new(0),
            }),
        }
    }

    pub fn total_shards(&self) -> u32 {
        self.inner.total_shards
    }

    /// Configured worker count
    pub fn worker_count(&self) -> u32 {
        self.inner.worker_count
    }

    /// Record a (re)spawned worker
    pub fn register_worker(&self, worker_id: WorkerId, shards: Vec<ShardId>) {
        let spawn_count = self
            .inner
            .workers
            .get(&worker_id)
            .map_or(0, |e| e.spawn_count);

        self.inner.workers.insert(
            worker_id,
            WorkerStateEntry {
                health: WorkerHealth::Spawned,
                shards,
                spawn_count: spawn_count + 1,
                messages_received: AtomicU64::new(0),
                admissions: AtomicU64::new(0),
                spawned_at: Instant::now(),
            },
        );
    }

    pub fn set_health(&self, worker_id: WorkerId, health: WorkerHealth) {
        if let Some(mut entry) = self.inner.workers.get_mut(&worker_id) {
            entry.health = health;
        }
    }

    pub fn get_health(&self, worker_id: WorkerId) -> Option<WorkerHealth> {
        self.inner.workers.get(&worker_id).map(|e| e.health)
    }

    pub fn record_message(&self, worker_id: WorkerId) {
        if let Some(entry) = self.inner.workers.get(&worker_id) {
            entry.messages_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_admission(&self, worker_id: WorkerId) {
        if let Some(entry) = self.inner.workers.get(&worker_id) {
            entry.admissions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Set when the ready broadcast fires, cleared when a worker exits
    pub fn set_cluster_ready(&self, ready: bool) {
        if ready {
            self.inner.ready_broadcasts.fetch_add(1, Ordering::Relaxed);
        }
        self.inner.cluster_ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_cluster_ready(&self) -> bool {
        self.inner.cluster_ready.load(Ordering::SeqCst)
    }

    pub fn ready_broadcasts(&self) -> u64 {
        self.inner.ready_broadcasts.load(Ordering::Relaxed)
    }

    pub fn live_workers(&self) -> usize {
        self.inner
            .workers
            .iter()
            .filter(|e| e.health.is_live())
            .count()
    }

    pub fn ready_workers(&self) -> usize {
        self.inner
            .workers
            .iter()
            .filter(|e| e.health == WorkerHealth::Ready)
            .count()
    }

    pub fn admissions_total(&self) -> u64 {
        self.inner
            .workers
            .iter()
            .map(|e| e.admissions.load(Ordering::Relaxed))
            .sum()
    }

    pub fn messages_total(&self) -> u64 {
        self.inner
            .workers
            .iter()
            .map(|e| e.messages_received.load(Ordering::Relaxed))
            .sum()
    }

    /// Per-worker view ordered by worker id
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let mut workers: Vec<WorkerSnapshot> = self
            .inner
            .workers
            .iter()
            .map(|e| WorkerSnapshot {
                worker_id: *e.key(),
                health: e.health,
                shards: e.shards.clone(),
                spawn_count: e.spawn_count,
                messages_received: e.messages_received.load(Ordering::Relaxed),
                admissions: e.admissions.load(Ordering::Relaxed),
                uptime_secs: e.spawned_at.elapsed().as_secs(),
            })
            .collect();
        workers.sort_by_key(|w| w.worker_id);
        workers
    }
}
