//! Worker registry and RPC router
//!
//! The [`Cluster`] owns one handle per worker, assigns shard groups, gates
//! shard sessions through the [`AdmissionQueue`], correlates request/reply
//! pairs through the [`PendingTable`], and demultiplexes every inbound
//! worker message.
//!
//! Inbound messages are handled one at a time by [`Cluster::run`]. Handlers
//! only suspend where they await a collaborator or a worker reply, and those
//! waits run on spawned tasks so the inbound loop never stalls.

pub mod barrier;
pub mod pending;
pub mod queue;
pub mod state;

pub use barrier::{BarrierPhase, ReadyBarrier, WorkerState};
pub use pending::{NonceKind, PendingReply, PendingTable};
pub use queue::AdmissionQueue;
pub use state::{ClusterState, WorkerHealth, WorkerSnapshot};

use crate::collab::filter::event_type;
use crate::collab::Collaborators;
use crate::error::ClusterError;
use crate::protocol::{
    reply_fields, ClusterMessage, ConnectionProperties, Envelope, GatewayBootstrap, Inbound,
    WorkerMessage,
};
use crate::shard::{required_workers, ShardGroup, ShardId, ShardLayout, WorkerId};
use crate::worker::{WorkerHandle, WorkerSpawner};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Ceiling for the delay before a respawn
pub const MAX_RESPAWN_BACKOFF: Duration = Duration::from_secs(60);

/// A worker that stayed up this long starts its respawn backoff over
pub const STABLE_UPTIME: Duration = Duration::from_secs(30);

/// Options for one orchestrator instance
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Overrides the bootstrap shard count
    pub total_shards: Option<u32>,
    pub shard_start: ShardId,
    /// Defaults to `total_shards`
    pub shard_end: Option<ShardId>,
    pub shards_per_worker: u32,
    /// Defaults to the number of shard groups
    pub worker_count: Option<u32>,
    pub compress: bool,
    pub properties: ConnectionProperties,
    pub admission_interval: Duration,
    pub request_timeout: Duration,
    /// Respawn workers whose transport closes
    pub respawn: bool,
    /// Delay before the first respawn; doubles per consecutive quick exit
    pub respawn_backoff: Duration,
    /// Consecutive quick exits tolerated before a worker is given up on
    pub respawn_limit: u32,
    /// Log every inbound worker message
    pub debug: bool,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            total_shards: None,
            shard_start: 0,
            shard_end: None,
            shards_per_worker: 25,
            worker_count: None,
            compress: false,
            properties: ConnectionProperties::default(),
            admission_interval: queue::DEFAULT_ADMISSION_INTERVAL,
            request_timeout: pending::DEFAULT_REQUEST_TIMEOUT,
            respawn: true,
            respawn_backoff: Duration::from_secs(1),
            respawn_limit: 5,
            debug: false,
        }
    }
}

impl ClusterOptions {
    /// Resolve the live layout, failing before anything is spawned when the
    /// configured workers cannot hold every shard group.
    pub fn resolve(&self, bootstrap: &GatewayBootstrap) -> Result<ShardLayout, ClusterError> {
        let total_shards = self.total_shards.unwrap_or(bootstrap.shards);
        let shard_end = self.shard_end.unwrap_or(total_shards);

        if self.shards_per_worker == 0 || shard_end <= self.shard_start {
            return Err(ClusterError::InvalidPartition {
                start: self.shard_start,
                end: shard_end,
                per_worker: self.shards_per_worker,
            });
        }
        if shard_end > total_shards {
            return Err(ClusterError::Config(format!(
                "shard_end {shard_end} exceeds total_shards {total_shards}"
            )));
        }

        let required = required_workers(self.shard_start, shard_end, self.shards_per_worker);
        let worker_count = match self.worker_count {
            Some(configured) if configured < required => {
                return Err(ClusterError::InsufficientWorkers {
                    required: required as usize,
                    configured,
                });
            }
            Some(configured) => configured,
            None => required,
        };

        Ok(ShardLayout {
            total_shards,
            shard_start: self.shard_start,
            shard_end,
            shards_per_worker: self.shards_per_worker,
            worker_count,
        })
    }
}

#[derive(Default)]
struct WorkerRegistry {
    handles: BTreeMap<WorkerId, WorkerHandle>,
    barrier: ReadyBarrier,
    /// Consecutive exits before `STABLE_UPTIME`, per worker
    quick_exits: BTreeMap<WorkerId, u32>,
}

/// Orchestrator handle. Cheap to clone.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

struct ClusterInner {
    options: ClusterOptions,
    layout: ShardLayout,
    bootstrap: GatewayBootstrap,
    spawner: Arc<dyn WorkerSpawner>,
    collab: Collaborators,
    registry: Mutex<WorkerRegistry>,
    pending: PendingTable,
    queue: AdmissionQueue,
    state: ClusterState,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Cluster {
    /// Build the orchestrator. Must be called inside a Tokio runtime.
    ///
    /// Configuration errors surface here, before any worker exists.
    pub fn new(
        options: ClusterOptions,
        bootstrap: GatewayBootstrap,
        spawner: Arc<dyn WorkerSpawner>,
        collab: Collaborators,
    ) -> Result<Self, ClusterError> {
        let layout = options.resolve(&bootstrap)?;

        // Workers see the overridden shard count.
        let bootstrap = GatewayBootstrap {
            shards: layout.total_shards,
            ..bootstrap
        };

        let queue = AdmissionQueue::new(
            bootstrap.session_start_limit.max_concurrency,
            options.admission_interval,
        );
        let pending = PendingTable::new(options.request_timeout, collab.metrics.clone());
        let state = ClusterState::new(layout.total_shards, layout.worker_count);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            total_shards = layout.total_shards,
            shard_start = layout.shard_start,
            shard_end = layout.shard_end,
            shards_per_worker = layout.shards_per_worker,
            worker_count = layout.worker_count,
            max_concurrency = queue.max_concurrency(),
            "Cluster configured"
        );

        Ok(Self {
            inner: Arc::new(ClusterInner {
                options,
                layout,
                bootstrap,
                spawner,
                collab,
                registry: Mutex::new(WorkerRegistry::default()),
                pending,
                queue,
                state,
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                shutdown_tx,
            }),
        })
    }

    pub fn layout(&self) -> ShardLayout {
        self.inner.layout
    }

    pub fn options(&self) -> &ClusterOptions {
        &self.inner.options
    }

    /// Shared health snapshot
    pub fn state(&self) -> ClusterState {
        self.inner.state.clone()
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn queued_admissions(&self) -> usize {
        self.inner.queue.len()
    }

    /// Sender for injecting inbound events (spawners get a clone of this)
    pub fn inbound(&self) -> mpsc::UnboundedSender<Inbound> {
        self.inner.inbound_tx.clone()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.inner.registry.lock().handles.keys().copied().collect()
    }

    pub fn worker_state(&self, worker_id: WorkerId) -> Option<WorkerState> {
        self.inner.registry.lock().barrier.state(worker_id)
    }

    /// Times the ready barrier has fired
    pub fn ready_broadcasts(&self) -> u64 {
        self.inner.registry.lock().barrier.fired()
    }

    pub fn resolve_worker_id(&self, shard_id: ShardId) -> Result<WorkerId, ClusterError> {
        self.inner.layout.resolve_worker_id(shard_id)
    }

    /// Partition the shard range and spawn every worker
    pub fn start(&self) -> Result<(), ClusterError> {
        let groups = self.inner.layout.partition()?;
        if groups.len() > self.inner.layout.worker_count as usize {
            return Err(ClusterError::InsufficientWorkers {
                required: groups.len(),
                configured: self.inner.layout.worker_count,
            });
        }
        self.spawn_all(&groups)
    }

    /// Spawn a worker for every group not already backed by a live one and
    /// send it its shard assignment.
    pub fn spawn_all(&self, groups: &[ShardGroup]) -> Result<(), ClusterError> {
        let mut registry = self.inner.registry.lock();

        for group in groups {
            if registry.handles.contains_key(&group.worker_id) {
                debug!(worker_id = group.worker_id, "Worker already live, skipping spawn");
                continue;
            }

            let link = self
                .inner
                .spawner
                .spawn(group.worker_id, self.inner.inbound_tx.clone())?;
            let handle = WorkerHandle::new(group.worker_id, group.shards.clone(), link);

            handle.send(ClusterMessage::SpawnShards {
                shards: group.shards.clone(),
                compress: self.inner.options.compress,
                bootstrap: self.inner.bootstrap.clone(),
                properties: self.inner.options.properties.clone(),
            })?;

            info!(
                worker_id = group.worker_id,
                first_shard = group.shards.first().copied(),
                shard_count = group.shards.len(),
                "Worker spawned"
            );

            self.inner.state.register_worker(group.worker_id, group.shards.clone());
            registry.barrier.register(group.worker_id);
            registry.handles.insert(group.worker_id, handle);
        }

        self.sync_ready_gauge();
        Ok(())
    }

    /// Queue an admission for `shard_id`; when the rate limit allows, the
    /// owning worker receives `allow_connect`. Never blocks.
    pub fn request_admission(&self, worker_id: WorkerId, shard_id: ShardId) -> Result<(), ClusterError> {
        let sender = self
            .sender_for(worker_id)
            .ok_or(ClusterError::WorkerNotFound { worker_id })?;

        let collab = self.inner.collab.clone();
        let state = self.inner.state.clone();
        debug!(worker_id, shard_id, queued = self.inner.queue.len(), "Admission queued");

        self.inner.queue.push(move || {
            let presence = collab.presence_for(shard_id, worker_id);
            match sender.send(ClusterMessage::AllowConnect { shard_id, presence }) {
                Ok(()) => {
                    state.record_admission(worker_id);
                    collab.metrics.record_admission(worker_id);
                    info!(worker_id, shard_id, "Shard admitted");
                }
                Err(_) => warn!(worker_id, shard_id, "Worker gone before admission"),
            }
        });

        Ok(())
    }

    /// Send a gateway payload through the shard's worker; resolves to true
    /// once the worker acknowledges it.
    pub async fn send(&self, payload: Value, shard_id: ShardId) -> Result<bool, ClusterError> {
        let worker_id = self.resolve_worker_id(shard_id)?;
        let reply = self.request(worker_id, NonceKind::Long, |nonce| ClusterMessage::SendPayload {
            nonce,
            shard_id,
            payload,
        })?;
        reply.await?;
        Ok(true)
    }

    /// Ask the owning worker for one shard's metadata
    pub async fn get_shard_info(&self, shard_id: ShardId) -> Result<Value, ClusterError> {
        let worker_id = self.resolve_worker_id(shard_id)?;
        let reply = self.request(worker_id, NonceKind::Short, |nonce| {
            ClusterMessage::ShardInfoRequest { nonce, shard_id }
        })?;
        reply.await
    }

    /// Ask a worker for its own metadata
    pub async fn get_worker_info(&self, worker_id: WorkerId) -> Result<Value, ClusterError> {
        let reply = self.request(worker_id, NonceKind::Long, |nonce| {
            ClusterMessage::WorkerInfoRequest { nonce }
        })?;
        reply.await
    }

    /// Address a correlated instruction to `worker_id`.
    ///
    /// Fails before minting a nonce when the worker does not exist.
    fn request<F>(&self, worker_id: WorkerId, kind: NonceKind, build: F) -> Result<PendingReply, ClusterError>
    where
        F: FnOnce(String) -> ClusterMessage,
    {
        let sender = self
            .sender_for(worker_id)
            .ok_or(ClusterError::WorkerNotFound { worker_id })?;

        let reply = self.inner.pending.open(kind)?;
        let message = build(reply.nonce().to_string());

        if sender.send(message).is_err() {
            self.inner
                .pending
                .reject(reply.nonce(), ClusterError::WorkerClosed { worker_id });
            return Err(ClusterError::WorkerClosed { worker_id });
        }

        Ok(reply)
    }

    fn sender_for(&self, worker_id: WorkerId) -> Option<mpsc::UnboundedSender<ClusterMessage>> {
        self.inner
            .registry
            .lock()
            .handles
            .get(&worker_id)
            .map(WorkerHandle::sender)
    }

    /// Route one inbound event
    pub fn handle_inbound(&self, inbound: Inbound) -> Result<(), ClusterError> {
        match inbound {
            Inbound::Message(envelope) => self.dispatch_worker_message(envelope),
            Inbound::Exited { worker_id } => self.handle_exit(worker_id),
        }
    }

    /// Demultiplex one worker message
    pub fn dispatch_worker_message(&self, envelope: Envelope) -> Result<(), ClusterError> {
        let Envelope { worker_id, message } = envelope;
        let kind = message.kind();

        self.inner.collab.metrics.record_message(kind);
        self.inner.state.record_message(worker_id);
        if self.inner.options.debug {
            debug!(worker_id, kind, "Worker message");
        }

        match message {
            WorkerMessage::AdmissionRequest { shard_id } => self.request_admission(worker_id, shard_id),

            WorkerMessage::CacheRequest { nonce, method, args } => {
                let sender = self
                    .sender_for(worker_id)
                    .ok_or(ClusterError::UnknownWorker { worker_id, kind })?;
                let cache = Arc::clone(&self.inner.collab.cache);

                tokio::spawn(async move {
                    let outcome = cache.call(&method, args).await.map_err(|source| {
                        ClusterError::Cache {
                            method: method.clone(),
                            source,
                        }
                    });
                    if let Err(e) = &outcome {
                        warn!(worker_id, method = %method, error = %e, "Cache call failed");
                    }
                    let (result, error) = reply_fields(outcome);
                    if sender.send(ClusterMessage::CacheResult { nonce, result, error }).is_err() {
                        warn!(worker_id, "Worker gone before cache result");
                    }
                });
                Ok(())
            }

            WorkerMessage::Payload { shard_id, payload } => {
                self.deliver(worker_id, shard_id, payload);
                Ok(())
            }

            WorkerMessage::Ack { nonce } => {
                self.inner.pending.resolve(&nonce, Value::Bool(true));
                Ok(())
            }

            WorkerMessage::ShardInfo { nonce, data } | WorkerMessage::WorkerInfo { nonce, data } => {
                self.inner.pending.resolve(&nonce, data);
                Ok(())
            }

            WorkerMessage::EvaluationReply { nonce, response, error } => {
                match error {
                    None => self.inner.pending.resolve(&nonce, response),
                    Some(message) => self.inner.pending.reject(&nonce, ClusterError::Remote(message)),
                };
                Ok(())
            }

            WorkerMessage::Ready => self.mark_ready(worker_id),

            WorkerMessage::ApiRequest {
                nonce,
                method,
                url,
                options,
            } => {
                let sender = self
                    .sender_for(worker_id)
                    .ok_or(ClusterError::UnknownWorker { worker_id, kind })?;
                let rest = Arc::clone(&self.inner.collab.rest);

                tokio::spawn(async move {
                    let outcome = rest.request(&method, &url, options).await.map_err(|source| {
                        ClusterError::Rest {
                            method: method.clone(),
                            url: url.clone(),
                            source,
                        }
                    });
                    if let Err(e) = &outcome {
                        warn!(worker_id, error = %e, "API call failed");
                    }
                    let (response, error) = reply_fields(outcome);
                    if sender
                        .send(ClusterMessage::ApiResponse { nonce, response, error })
                        .is_err()
                    {
                        warn!(worker_id, "Worker gone before API response");
                    }
                });
                Ok(())
            }

            WorkerMessage::EvaluationRequest {
                nonce,
                script,
                target_worker,
            } => self.relay_evaluation(worker_id, nonce, script, target_worker),
        }
    }

    /// Double-hop evaluation: forward under a fresh nonce, answer the
    /// requester under its own.
    fn relay_evaluation(
        &self,
        worker_id: WorkerId,
        nonce: String,
        script: String,
        target_worker: WorkerId,
    ) -> Result<(), ClusterError> {
        let requester = self.sender_for(worker_id).ok_or(ClusterError::UnknownWorker {
            worker_id,
            kind: "evaluation_request",
        })?;

        let forwarded = self.request(target_worker, NonceKind::Long, |inner_nonce| {
            ClusterMessage::ExecuteEvaluation {
                nonce: inner_nonce,
                script,
                target_worker,
            }
        });

        let reply = match forwarded {
            Ok(reply) => reply,
            Err(e) => {
                warn!(worker_id, target_worker, error = %e, "Evaluation target unavailable");
                if requester
                    .send(ClusterMessage::EvaluationResponse {
                        nonce,
                        response: None,
                        error: Some(e.to_string()),
                    })
                    .is_err()
                {
                    warn!(worker_id, "Worker gone before evaluation error");
                }
                return Ok(());
            }
        };

        debug!(worker_id, target_worker, nonce = %nonce, inner_nonce = reply.nonce(), "Evaluation relayed");
        tokio::spawn(async move {
            let (response, error) = reply_fields(reply.await);
            if requester
                .send(ClusterMessage::EvaluationResponse { nonce, response, error })
                .is_err()
            {
                warn!(worker_id, "Worker gone before evaluation response");
            }
        });
        Ok(())
    }

    fn deliver(&self, worker_id: WorkerId, shard_id: ShardId, payload: Value) {
        let event = event_type(&payload);
        if !self.inner.collab.filters.allows(event, shard_id, worker_id, &payload) {
            debug!(worker_id, shard_id, event_type = event, "Payload vetoed by filter");
            self.inner.collab.metrics.record_vetoed(event);
            return;
        }
        self.inner.collab.sink.deliver(shard_id, worker_id, payload);
    }

    fn mark_ready(&self, worker_id: WorkerId) -> Result<(), ClusterError> {
        let mut registry = self.inner.registry.lock();
        let phase = registry.barrier.mark_ready(worker_id)?;
        self.inner.state.set_health(worker_id, WorkerHealth::Ready);
        self.sync_ready_gauge();

        match phase {
            BarrierPhase::Satisfied { target } => self.broadcast_ready(&registry, target)?,
            BarrierPhase::Accumulating { ready, total } => {
                info!(worker_id, ready, total, "Worker ready");
            }
            BarrierPhase::Idle => {}
        }

        Ok(())
    }

    fn broadcast_ready(&self, registry: &WorkerRegistry, target: WorkerId) -> Result<(), ClusterError> {
        let handle = registry
            .handles
            .get(&target)
            .ok_or(ClusterError::WorkerNotFound { worker_id: target })?;
        handle.send(ClusterMessage::ClusterReady)?;

        self.inner.state.set_cluster_ready(true);
        self.inner.collab.metrics.record_ready_broadcast();
        info!(
            target_worker = target,
            workers = registry.handles.len(),
            broadcasts = registry.barrier.fired(),
            "All workers ready, cluster ready sent"
        );
        Ok(())
    }

    /// Gauge mirrors the health table: workers that reported ready since
    /// their last spawn.
    fn sync_ready_gauge(&self) {
        self.inner
            .collab
            .metrics
            .set_workers_ready(self.inner.state.ready_workers());
    }

    fn handle_exit(&self, worker_id: WorkerId) -> Result<(), ClusterError> {
        let (group, attempt) = {
            let mut registry = self.inner.registry.lock();
            let Some(mut handle) = registry.handles.remove(&worker_id) else {
                debug!(worker_id, "Exit from a worker that is no longer registered");
                return Ok(());
            };
            drop(handle.take_task());

            let attempt = if handle.uptime() >= STABLE_UPTIME {
                1
            } else {
                registry.quick_exits.get(&worker_id).copied().unwrap_or(0) + 1
            };
            registry.quick_exits.insert(worker_id, attempt);

            let group = ShardGroup {
                worker_id,
                shards: handle.shards().to_vec(),
            };
            (group, attempt)
        };

        self.inner.state.set_health(worker_id, WorkerHealth::Exited);
        self.inner.state.set_cluster_ready(false);
        self.sync_ready_gauge();
        warn!(worker_id, shards = ?group.shards, attempt, "Worker exited");

        if !self.inner.options.respawn || *self.inner.shutdown_tx.borrow() {
            self.abandon(worker_id);
            return Ok(());
        }

        let max = self.inner.options.respawn_limit;
        if attempt > max {
            error!(worker_id, attempt, max, "Worker keeps exiting, giving up on it");
            self.abandon(worker_id);
            return Err(ClusterError::RespawnLimit {
                worker_id,
                attempts: attempt,
                max,
            });
        }

        // Hold the slot so the cohort waits for the replacement.
        self.inner.registry.lock().barrier.register(worker_id);

        let delay = respawn_delay(self.inner.options.respawn_backoff, attempt);
        info!(worker_id, attempt, delay_ms = delay.as_millis() as u64, "Respawning worker");

        let cluster = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if *cluster.inner.shutdown_tx.borrow() {
                return;
            }
            if let Err(e) = cluster.spawn_all(std::slice::from_ref(&group)) {
                cluster.inner.collab.metrics.record_error(e.error_type_label());
                error!(worker_id, error = %e, "Respawn failed");
                cluster.abandon(worker_id);
            }
        });
        Ok(())
    }

    /// Drop a worker from the ready cohort for good. The survivors may now
    /// all be ready, in which case the barrier fires.
    fn abandon(&self, worker_id: WorkerId) {
        let mut registry = self.inner.registry.lock();
        if let BarrierPhase::Satisfied { target } = registry.barrier.remove(worker_id) {
            if let Err(e) = self.broadcast_ready(&registry, target) {
                warn!(target_worker = target, error = %e, "Cluster ready not delivered");
            }
        }
    }

    /// Process inbound events until [`Cluster::shutdown`] is called.
    ///
    /// Errors from individual messages are logged and counted; they never
    /// stop the loop.
    pub async fn run(&self) -> Result<(), ClusterError> {
        let mut rx = self
            .inner
            .inbound_rx
            .lock()
            .take()
            .ok_or(ClusterError::AlreadyRunning)?;
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Ok(());
        }

        info!("Cluster router running");
        loop {
            tokio::select! {
                inbound = rx.recv() => {
                    let Some(inbound) = inbound else { break };
                    if let Err(e) = self.handle_inbound(inbound) {
                        self.inner.collab.metrics.record_error(e.error_type_label());
                        error!(error = %e, error_type = e.error_type_label(), "Failed to handle worker message");
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        info!("Cluster router stopped");
        Ok(())
    }

    /// Tell every worker to shut down, drop all handles, and stop `run`
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);

        let mut registry = self.inner.registry.lock();
        for (worker_id, handle) in &registry.handles {
            if handle.send(ClusterMessage::Shutdown).is_err() {
                debug!(worker_id, "Worker already closed at shutdown");
            }
        }
        registry.handles.clear();
        registry.barrier.clear();
        registry.quick_exits.clear();
        info!("Cluster shut down");
    }
}

/// `base * 2^(attempt - 1)`, capped at [`MAX_RESPAWN_BACKOFF`]
fn respawn_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RESPAWN_BACKOFF)
}
