//! Worker-side half of the protocol
//!
//! [`WorkerClient`] is what a worker process links against: it frames
//! [`WorkerMessage`]s onto the orchestrator link, correlates replies to
//! cache, API and evaluation requests, and hands every other instruction to
//! the worker through a channel.

use crate::cluster::pending::{NonceKind, PendingTable};
use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use crate::protocol::codec::{read_messages, spawn_writer};
use crate::protocol::{ClusterMessage, WorkerMessage};
use crate::shard::{ShardId, WorkerId};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Outstanding admission per shard, tagged with the request that owns it
type AdmissionWaiters = Arc<DashMap<ShardId, (u64, oneshot::Sender<Option<Value>>)>>;

/// Drops an admission waiter whose request ended without an answer
struct AdmissionTicket<'a> {
    admissions: &'a AdmissionWaiters,
    shard_id: ShardId,
    ticket: u64,
}

impl Drop for AdmissionTicket<'_> {
    fn drop(&mut self) {
        // A newer request for the same shard keeps its entry.
        self.admissions
            .remove_if(&self.shard_id, |_, (ticket, _)| *ticket == self.ticket);
    }
}

/// Connection from a worker back to its orchestrator
#[derive(Clone)]
pub struct WorkerClient {
    worker_id: WorkerId,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    pending: PendingTable,
    admissions: AdmissionWaiters,
    next_ticket: Arc<AtomicU64>,
}

impl WorkerClient {
    /// Attach to an orchestrator link.
    ///
    /// Returns the client and the stream of instructions that are not
    /// replies to this worker's own requests (spawn_shards, send_payload,
    /// info requests, execute_evaluation, cluster_ready, shutdown).
    pub fn connect<R, W>(
        worker_id: WorkerId,
        reader: R,
        writer: W,
        request_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ClusterMessage>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        spawn_writer(writer, outbound_rx, format!("worker-{worker_id}-out"));

        let client = Self {
            worker_id,
            outbound,
            pending: PendingTable::new(request_timeout, ClusterMetrics::default()),
            admissions: Arc::new(DashMap::new()),
            next_ticket: Arc::new(AtomicU64::new(0)),
        };

        let (instructions, instructions_rx) = mpsc::unbounded_channel();
        let router = client.clone();
        tokio::spawn(async move {
            let label = format!("worker-{worker_id}-in");
            read_messages(reader, &label, |message: ClusterMessage| router.route(message, &instructions)).await;
        });

        (client, instructions_rx)
    }

    /// Attach over this process's stdin/stdout, reading `WORKER_ID` from
    /// the environment the spawner set up.
    pub fn from_stdio(
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ClusterMessage>), ClusterError> {
        let worker_id = std::env::var("WORKER_ID")
            .map_err(|_| ClusterError::Config("WORKER_ID is not set".to_string()))?
            .parse::<WorkerId>()
            .map_err(|e| ClusterError::Config(format!("WORKER_ID: {e}")))?;

        Ok(Self::connect(
            worker_id,
            tokio::io::stdin(),
            tokio::io::stdout(),
            request_timeout,
        ))
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    fn route(&self, message: ClusterMessage, instructions: &mpsc::UnboundedSender<ClusterMessage>) -> bool {
        match message {
            ClusterMessage::AllowConnect { shard_id, presence } => {
                match self.admissions.remove(&shard_id) {
                    Some((_, (_, waiter))) => {
                        let _ = waiter.send(presence);
                        true
                    }
                    None => {
                        debug!(worker_id = self.worker_id, shard_id, "Unsolicited admission");
                        instructions
                            .send(ClusterMessage::AllowConnect { shard_id, presence })
                            .is_ok()
                    }
                }
            }
            ClusterMessage::CacheResult { nonce, result, error }
            | ClusterMessage::ApiResponse {
                nonce,
                response: result,
                error,
            }
            | ClusterMessage::EvaluationResponse {
                nonce,
                response: result,
                error,
            } => {
                match error {
                    Some(message) => self.pending.reject(&nonce, ClusterError::Remote(message)),
                    None => self.pending.resolve(&nonce, result.unwrap_or(Value::Null)),
                };
                true
            }
            other => instructions.send(other).is_ok(),
        }
    }

    fn send(&self, message: WorkerMessage) -> Result<(), ClusterError> {
        self.outbound.send(message).map_err(|_| ClusterError::WorkerClosed {
            worker_id: self.worker_id,
        })
    }

    async fn request<F>(&self, kind: NonceKind, build: F) -> Result<Value, ClusterError>
    where
        F: FnOnce(String) -> WorkerMessage,
    {
        let reply = self.pending.open(kind)?;
        if let Err(e) = self.send(build(reply.nonce().to_string())) {
            self.pending.reject(reply.nonce(), ClusterError::WorkerClosed {
                worker_id: self.worker_id,
            });
            return Err(e);
        }
        reply.await
    }

    /// Wait for the orchestrator to admit `shard_id`; resolves to the
    /// presence to identify with, if one was supplied.
    pub async fn request_admission(&self, shard_id: ShardId) -> Result<Option<Value>, ClusterError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        if self.admissions.insert(shard_id, (ticket, tx)).is_some() {
            warn!(worker_id = self.worker_id, shard_id, "Replacing an outstanding admission request");
        }
        let _ticket = AdmissionTicket {
            admissions: &self.admissions,
            shard_id,
            ticket,
        };
        self.send(WorkerMessage::AdmissionRequest { shard_id })?;

        rx.await.map_err(|_| ClusterError::WorkerClosed {
            worker_id: self.worker_id,
        })
    }

    /// Call a method on the orchestrator's cache
    pub async fn cache(&self, method: &str, args: Vec<Value>) -> Result<Value, ClusterError> {
        let method = method.to_string();
        self.request(NonceKind::Short, |nonce| WorkerMessage::CacheRequest { nonce, method, args })
            .await
    }

    /// Relay a REST call through the orchestrator
    pub async fn api(&self, method: &str, url: &str, options: Value) -> Result<Value, ClusterError> {
        let (method, url) = (method.to_string(), url.to_string());
        self.request(NonceKind::Long, |nonce| WorkerMessage::ApiRequest {
            nonce,
            method,
            url,
            options,
        })
        .await
    }

    /// Run `script` on another worker
    pub async fn evaluate(&self, script: &str, target_worker: WorkerId) -> Result<Value, ClusterError> {
        let script = script.to_string();
        self.request(NonceKind::Long, |nonce| WorkerMessage::EvaluationRequest {
            nonce,
            script,
            target_worker,
        })
        .await
    }

    /// Report every shard of this worker ready
    pub fn ready(&self) -> Result<(), ClusterError> {
        self.send(WorkerMessage::Ready)
    }

    /// Forward an inbound gateway payload
    pub fn deliver(&self, shard_id: ShardId, payload: Value) -> Result<(), ClusterError> {
        self.send(WorkerMessage::Payload { shard_id, payload })
    }

    /// Acknowledge a `send_payload`
    pub fn ack(&self, nonce: String) -> Result<(), ClusterError> {
        self.send(WorkerMessage::Ack { nonce })
    }

    pub fn reply_shard_info(&self, nonce: String, data: Value) -> Result<(), ClusterError> {
        self.send(WorkerMessage::ShardInfo { nonce, data })
    }

    pub fn reply_worker_info(&self, nonce: String, data: Value) -> Result<(), ClusterError> {
        self.send(WorkerMessage::WorkerInfo { nonce, data })
    }

    /// Answer an `execute_evaluation`
    pub fn reply_evaluation(&self, nonce: String, result: Result<Value, String>) -> Result<(), ClusterError> {
        let (response, error) = match result {
            Ok(value) => (value, None),
            Err(e) => (Value::Null, Some(e)),
        };
        self.send(WorkerMessage::EvaluationReply { nonce, response, error })
    }

    /// Requests still waiting on the orchestrator
    pub fn pending_requests(&self) -> usize {
        self.pending.len() + self.admissions.len()
    }
}
