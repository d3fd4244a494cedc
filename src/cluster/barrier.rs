//! Cluster-wide ready barrier
//!
//! Fires once per full cohort of ready signals. Firing clears every flag,
//! so duplicates for a cohort that already fired start a new cohort rather
//! than re-triggering.

use crate::error::ClusterError;
use crate::shard::WorkerId;
use std::collections::BTreeMap;

/// Per-worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    Ready,
}

/// Where the barrier stands after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierPhase {
    /// No worker has reported ready
    Idle,
    /// Some, but not all, workers are ready
    Accumulating { ready: usize, total: usize },
    /// Every worker was ready; `target` gets the cluster-ready signal
    Satisfied { target: WorkerId },
}

#[derive(Debug, Default)]
pub struct ReadyBarrier {
    states: BTreeMap<WorkerId, WorkerState>,
    fired: u64,
}

impl ReadyBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly spawned worker
    pub fn register(&mut self, worker_id: WorkerId) {
        self.states.insert(worker_id, WorkerState::Spawned);
    }

    /// Stop tracking a worker that went away.
    ///
    /// The cohort shrinks, so this fires when every remaining worker was
    /// already ready.
    pub fn remove(&mut self, worker_id: WorkerId) -> BarrierPhase {
        if self.states.remove(&worker_id).is_none() {
            return self.phase();
        }
        self.settle()
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn state(&self, worker_id: WorkerId) -> Option<WorkerState> {
        self.states.get(&worker_id).copied()
    }

    pub fn ready_count(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == WorkerState::Ready)
            .count()
    }

    /// Number of times the barrier has fired
    pub fn fired(&self) -> u64 {
        self.fired
    }

    pub fn phase(&self) -> BarrierPhase {
        match self.ready_count() {
            0 => BarrierPhase::Idle,
            ready => BarrierPhase::Accumulating {
                ready,
                total: self.states.len(),
            },
        }
    }

    /// Record a ready signal from `worker_id`.
    ///
    /// When this completes the cohort, every flag is reset and the lowest
    /// registered worker id is returned as the broadcast target.
    pub fn mark_ready(&mut self, worker_id: WorkerId) -> Result<BarrierPhase, ClusterError> {
        let state = self
            .states
            .get_mut(&worker_id)
            .ok_or(ClusterError::UnknownWorker {
                worker_id,
                kind: "ready",
            })?;
        *state = WorkerState::Ready;

        Ok(self.settle())
    }

    /// Fire if the whole cohort is ready, resetting every flag
    fn settle(&mut self) -> BarrierPhase {
        let ready = self.ready_count();
        if ready == 0 {
            return BarrierPhase::Idle;
        }
        let total = self.states.len();
        if ready < total {
            return BarrierPhase::Accumulating { ready, total };
        }

        // BTreeMap iterates in key order: first key is the lowest id.
        let Some(target) = self.states.keys().next().copied() else {
            return BarrierPhase::Idle;
        };
        for state in self.states.values_mut() {
            *state = WorkerState::Spawned;
        }
        self.fired += 1;

        BarrierPhase::Satisfied { target }
    }
}
