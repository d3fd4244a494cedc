//! Worker handles and spawning
//!
//! A worker is an isolated unit of execution that owns one shard group. The
//! orchestrator only ever talks to it through serialized messages: the
//! [`WorkerLink`] carries orchestrator→worker instructions, and the spawner
//! forwards everything the worker sends as [`Inbound`] events.

pub mod client;
pub mod process;

pub use client::WorkerClient;
pub use process::ProcessSpawner;

use crate::error::ClusterError;
use crate::protocol::{ClusterMessage, Inbound};
use crate::shard::{ShardId, WorkerId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

/// Creates workers on demand
pub trait WorkerSpawner: Send + Sync {
    /// Start worker `worker_id`. Messages it sends go to `inbound`; when its
    /// transport closes the spawner must emit `Inbound::Exited`.
    fn spawn(
        &self,
        worker_id: WorkerId,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<WorkerLink, ClusterError>;
}

/// Result of a successful spawn
pub struct WorkerLink {
    pub sender: mpsc::UnboundedSender<ClusterMessage>,
    /// Supervising task, if the spawner runs one
    pub task: Option<JoinHandle<()>>,
}

/// Orchestrator-side reference to one live worker
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    shards: Vec<ShardId>,
    sender: mpsc::UnboundedSender<ClusterMessage>,
    task: Option<JoinHandle<()>>,
    spawned_at: Instant,
}

impl WorkerHandle {
    pub fn new(id: WorkerId, shards: Vec<ShardId>, link: WorkerLink) -> Self {
        Self {
            id,
            shards,
            sender: link.sender,
            task: link.task,
            spawned_at: Instant::now(),
        }
    }

    pub fn shards(&self) -> &[ShardId] {
        &self.shards
    }

    /// Queue an instruction on the worker's channel (FIFO per worker)
    pub fn send(&self, message: ClusterMessage) -> Result<(), ClusterError> {
        self.sender
            .send(message)
            .map_err(|_| ClusterError::WorkerClosed { worker_id: self.id })
    }

    /// Clone of the instruction channel, for replies sent from spawned tasks
    pub fn sender(&self) -> mpsc::UnboundedSender<ClusterMessage> {
        self.sender.clone()
    }

    /// Time since the spawn
    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    /// Detach the supervising task, if any
    pub fn take_task(&mut self) -> Option<JoinHandle<()>> {
        self.task.take()
    }
}
