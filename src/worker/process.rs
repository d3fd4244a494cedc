//! Child-process workers
//!
//! Each worker is a separate OS process speaking newline-delimited JSON on
//! stdin (instructions) and stdout (worker messages). Stderr is inherited so
//! worker logs land next to the orchestrator's.

use crate::error::ClusterError;
use crate::protocol::codec::{read_messages, spawn_writer};
use crate::protocol::{Envelope, Inbound, WorkerMessage};
use crate::shard::WorkerId;
use crate::worker::{WorkerLink, WorkerSpawner};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Spawns `program` once per worker
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: String,
    args: Vec<String>,
    worker_count: u32,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<String>, args: Vec<String>, worker_count: u32) -> Self {
        Self {
            program: program.into(),
            args,
            worker_count,
        }
    }

    /// Split a shell-style command line on whitespace
    pub fn from_command_line(command: &str, worker_count: u32) -> Result<Self, ClusterError> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ClusterError::Config("WORKER_COMMAND must not be empty".to_string()))?;
        Ok(Self::new(program, parts.collect(), worker_count))
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &self,
        worker_id: WorkerId,
        inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<WorkerLink, ClusterError> {
        let spawn_error = |source: crate::error::BoxError| ClusterError::Spawn { worker_id, source };

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("WORKER_ID", worker_id.to_string())
            .env("WORKER_COUNT", self.worker_count.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(Box::new(e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("stdout was not captured".into()))?;

        info!(worker_id, pid = ?child.id(), program = %self.program, "Worker process started");

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_writer(stdin, rx, format!("worker-{worker_id}-stdin"));

        let task = tokio::spawn(async move {
            let label = format!("worker-{worker_id}-stdout");
            read_messages(stdout, &label, |message: WorkerMessage| {
                inbound
                    .send(Inbound::Message(Envelope { worker_id, message }))
                    .is_ok()
            })
            .await;

            // stdout closed: the process is gone or going
            match child.wait().await {
                Ok(status) => warn!(worker_id, %status, "Worker process exited"),
                Err(e) => warn!(worker_id, error = %e, "Failed to reap worker process"),
            }
            let _ = inbound.send(Inbound::Exited { worker_id });
        });

        Ok(WorkerLink {
            sender: tx,
            task: Some(task),
        })
    }
}
