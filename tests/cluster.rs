//! Router behaviour against in-memory workers
//!
//! Workers are plain channels: the spawner hands each orchestrator→worker
//! receiver to the test, and worker messages are injected straight into the
//! router.

use arrakis_cluster::cluster::{ClusterOptions, WorkerHealth, WorkerState, STABLE_UPTIME};
use arrakis_cluster::collab::{
    static_bootstrap, CacheAdapter, Collaborators, DispatchSink, EventFilter, MemoryCache, RestTransport,
};
use arrakis_cluster::error::BoxError;
use arrakis_cluster::protocol::{ClusterMessage, Envelope, Inbound, WorkerMessage};
use arrakis_cluster::shard::{ShardId, WorkerId};
use arrakis_cluster::worker::{WorkerLink, WorkerSpawner};
use arrakis_cluster::{Cluster, ClusterError};
use async_trait::async_trait;
use metrics_exporter_prometheus::PrometheusBuilder;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct ChannelSpawner {
    links: Mutex<BTreeMap<WorkerId, mpsc::UnboundedReceiver<ClusterMessage>>>,
    spawns: AtomicUsize,
}

impl ChannelSpawner {
    fn take(&self, worker_id: WorkerId) -> mpsc::UnboundedReceiver<ClusterMessage> {
        self.links
            .lock()
            .remove(&worker_id)
            .unwrap_or_else(|| panic!("worker {worker_id} was not spawned"))
    }

    fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl WorkerSpawner for ChannelSpawner {
    fn spawn(
        &self,
        worker_id: WorkerId,
        _inbound: mpsc::UnboundedSender<Inbound>,
    ) -> Result<WorkerLink, ClusterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().insert(worker_id, rx);
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerLink { sender: tx, task: None })
    }
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<(ShardId, WorkerId, Value)>>,
}

impl DispatchSink for RecordingSink {
    fn deliver(&self, shard_id: ShardId, worker_id: WorkerId, payload: Value) {
        self.delivered.lock().push((shard_id, worker_id, payload));
    }
}

#[derive(Default)]
struct StubRest {
    calls: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait]
impl RestTransport for StubRest {
    async fn request(&self, method: &str, url: &str, options: Value) -> Result<Value, BoxError> {
        self.calls.lock().push((method.to_string(), url.to_string(), options));
        if url.starts_with("/missing") {
            return Err("404 Not Found".into());
        }
        Ok(json!({ "id": "42" }))
    }
}

struct Harness {
    cluster: Cluster,
    spawner: Arc<ChannelSpawner>,
    sink: Arc<RecordingSink>,
    rest: Arc<StubRest>,
    workers: BTreeMap<WorkerId, mpsc::UnboundedReceiver<ClusterMessage>>,
}

impl Harness {
    fn new(options: ClusterOptions, max_concurrency: u32) -> Self {
        Self::with_collab(options, max_concurrency, |collab| collab)
    }

    fn with_collab(
        options: ClusterOptions,
        max_concurrency: u32,
        configure: impl FnOnce(Collaborators) -> Collaborators,
    ) -> Self {
        let spawner = Arc::new(ChannelSpawner::default());
        let sink = Arc::new(RecordingSink::default());
        let rest = Arc::new(StubRest::default());
        let cache: Arc<dyn CacheAdapter> = Arc::new(MemoryCache::new());
        let collab = configure(Collaborators::new(cache, rest.clone(), sink.clone()));

        let cluster = Cluster::new(options, static_bootstrap(10, max_concurrency), spawner.clone(), collab).unwrap();
        cluster.start().unwrap();

        let mut workers = BTreeMap::new();
        for worker_id in cluster.worker_ids() {
            let mut rx = spawner.take(worker_id);
            assert!(matches!(rx.try_recv(), Ok(ClusterMessage::SpawnShards { .. })));
            workers.insert(worker_id, rx);
        }

        Self {
            cluster,
            spawner,
            sink,
            rest,
            workers,
        }
    }

    fn worker(&mut self, worker_id: WorkerId) -> &mut mpsc::UnboundedReceiver<ClusterMessage> {
        self.workers.get_mut(&worker_id).unwrap()
    }

    fn from_worker(&self, worker_id: WorkerId, message: WorkerMessage) -> Result<(), ClusterError> {
        self.cluster.dispatch_worker_message(Envelope { worker_id, message })
    }
}

fn ten_shards_four_per_worker() -> ClusterOptions {
    ClusterOptions {
        shards_per_worker: 4,
        ..ClusterOptions::default()
    }
}

#[tokio::test]
async fn start_assigns_contiguous_groups() {
    let spawner = Arc::new(ChannelSpawner::default());
    let collab = Collaborators::new(
        Arc::new(MemoryCache::new()),
        Arc::new(StubRest::default()),
        Arc::new(RecordingSink::default()),
    );
    let cluster = Cluster::new(ten_shards_four_per_worker(), static_bootstrap(10, 1), spawner.clone(), collab).unwrap();
    cluster.start().unwrap();

    assert_eq!(cluster.worker_ids(), vec![0, 1, 2]);
    let expected: [&[ShardId]; 3] = [&[0, 1, 2, 3], &[4, 5, 6, 7], &[8, 9]];
    for (worker_id, shards) in expected.iter().enumerate() {
        match spawner.take(worker_id as WorkerId).try_recv().unwrap() {
            ClusterMessage::SpawnShards {
                shards: assigned,
                bootstrap,
                ..
            } => {
                assert_eq!(assigned, shards.to_vec());
                assert_eq!(bootstrap.shards, 10);
            }
            other => panic!("expected spawn_shards, got {other:?}"),
        }
    }

    // starting again does not double-spawn live workers
    cluster.start().unwrap();
    assert_eq!(spawner.spawns(), 3);
}

#[tokio::test]
async fn too_few_workers_fail_before_spawning() {
    let spawner = Arc::new(ChannelSpawner::default());
    let collab = Collaborators::new(
        Arc::new(MemoryCache::new()),
        Arc::new(StubRest::default()),
        Arc::new(RecordingSink::default()),
    );
    let options = ClusterOptions {
        worker_count: Some(2),
        ..ten_shards_four_per_worker()
    };

    let result = Cluster::new(options, static_bootstrap(10, 1), spawner.clone(), collab);
    assert!(matches!(
        result,
        Err(ClusterError::InsufficientWorkers {
            required: 3,
            configured: 2
        })
    ));
    assert_eq!(spawner.spawns(), 0);
}

#[tokio::test]
async fn send_resolves_on_ack() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);
    let send = tokio::spawn({
        let cluster = h.cluster.clone();
        async move { cluster.send(json!({ "op": 3, "d": {} }), 5).await }
    });

    let nonce = match h.worker(1).recv().await.unwrap() {
        ClusterMessage::SendPayload { nonce, shard_id, .. } => {
            assert_eq!(shard_id, 5);
            assert_eq!(nonce.len(), 36);
            nonce
        }
        other => panic!("expected send_payload, got {other:?}"),
    };
    assert_eq!(h.cluster.pending_requests(), 1);

    h.from_worker(1, WorkerMessage::Ack { nonce }).unwrap();
    assert!(send.await.unwrap().unwrap());
    assert_eq!(h.cluster.pending_requests(), 0);
}

#[tokio::test]
async fn unowned_shard_fails_without_pending_entry() {
    let h = Harness::new(ten_shards_four_per_worker(), 1);

    let result = h.cluster.send(json!({}), 12).await;
    assert!(matches!(result, Err(ClusterError::ShardOutOfRange { shard_id: 12, .. })));
    assert_eq!(h.cluster.pending_requests(), 0);
}

#[tokio::test]
async fn missing_worker_fails_without_pending_entry() {
    let h = Harness::new(
        ClusterOptions {
            respawn: false,
            ..ten_shards_four_per_worker()
        },
        1,
    );
    h.cluster.handle_inbound(Inbound::Exited { worker_id: 2 }).unwrap();

    let result = h.cluster.send(json!({}), 9).await;
    assert!(matches!(result, Err(ClusterError::WorkerNotFound { worker_id: 2 })));
    assert!(matches!(
        h.cluster.get_worker_info(7).await,
        Err(ClusterError::WorkerNotFound { worker_id: 7 })
    ));
    assert_eq!(h.cluster.pending_requests(), 0);
}

#[tokio::test]
async fn shard_info_uses_short_nonce() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);
    let info = tokio::spawn({
        let cluster = h.cluster.clone();
        async move { cluster.get_shard_info(8).await }
    });

    let nonce = match h.worker(2).recv().await.unwrap() {
        ClusterMessage::ShardInfoRequest { nonce, shard_id: 8 } => nonce,
        other => panic!("expected shard_info_request, got {other:?}"),
    };
    assert_eq!(nonce.len(), 8);

    h.from_worker(
        2,
        WorkerMessage::ShardInfo {
            nonce,
            data: json!({ "ping": 41 }),
        },
    )
    .unwrap();
    assert_eq!(info.await.unwrap().unwrap(), json!({ "ping": 41 }));
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out_and_late_reply_is_dropped() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);
    let started = Instant::now();
    let info = tokio::spawn({
        let cluster = h.cluster.clone();
        async move { cluster.get_worker_info(0).await }
    });

    let nonce = match h.worker(0).recv().await.unwrap() {
        ClusterMessage::WorkerInfoRequest { nonce } => nonce,
        other => panic!("expected worker_info_request, got {other:?}"),
    };

    let err = info.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() >= Duration::from_secs(60));
    assert_eq!(h.cluster.pending_requests(), 0);

    h.from_worker(0, WorkerMessage::WorkerInfo { nonce, data: json!({}) })
        .unwrap();
    assert_eq!(h.cluster.pending_requests(), 0);
}

#[tokio::test]
async fn stale_ack_is_ignored() {
    let h = Harness::new(ten_shards_four_per_worker(), 1);
    h.from_worker(
        0,
        WorkerMessage::Ack {
            nonce: "never-issued".to_string(),
        },
    )
    .unwrap();
    assert_eq!(h.cluster.pending_requests(), 0);
}

#[tokio::test]
async fn ready_barrier_signals_lowest_worker_once() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);

    h.from_worker(2, WorkerMessage::Ready).unwrap();
    h.from_worker(0, WorkerMessage::Ready).unwrap();
    assert_eq!(h.cluster.worker_state(0), Some(WorkerState::Ready));
    assert!(!h.cluster.state().is_cluster_ready());
    assert!(h.worker(0).try_recv().is_err());

    h.from_worker(1, WorkerMessage::Ready).unwrap();
    assert_eq!(h.worker(0).try_recv().unwrap(), ClusterMessage::ClusterReady);
    assert!(h.worker(1).try_recv().is_err());
    assert!(h.worker(2).try_recv().is_err());
    assert!(h.cluster.state().is_cluster_ready());
    assert_eq!(h.cluster.ready_broadcasts(), 1);

    // flags were reset; a duplicate starts a new cohort
    assert_eq!(h.cluster.worker_state(1), Some(WorkerState::Spawned));
    h.from_worker(1, WorkerMessage::Ready).unwrap();
    assert!(h.worker(0).try_recv().is_err());
    assert_eq!(h.cluster.ready_broadcasts(), 1);
}

#[tokio::test]
async fn messages_from_unknown_workers_are_protocol_errors() {
    let h = Harness::new(ten_shards_four_per_worker(), 1);

    assert!(matches!(
        h.from_worker(7, WorkerMessage::Ready),
        Err(ClusterError::UnknownWorker { worker_id: 7, .. })
    ));
    assert!(matches!(
        h.from_worker(
            7,
            WorkerMessage::CacheRequest {
                nonce: "c".to_string(),
                method: "get".to_string(),
                args: vec![json!("k")],
            }
        ),
        Err(ClusterError::UnknownWorker {
            worker_id: 7,
            kind: "cache_request"
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn admissions_are_spaced_by_the_interval() {
    let mut h = Harness::with_collab(ten_shards_four_per_worker(), 1, |collab| {
        collab.with_presence(Arc::new(|shard_id: ShardId, _: WorkerId| Some(json!({ "shard": shard_id }))))
    });
    let started = Instant::now();

    for shard_id in [0, 1, 2] {
        h.from_worker(0, WorkerMessage::AdmissionRequest { shard_id }).unwrap();
    }

    for (shard_id, expected_ms) in [(0, 0), (1, 5500), (2, 11_000)] {
        match h.worker(0).recv().await.unwrap() {
            ClusterMessage::AllowConnect { shard_id: admitted, presence } => {
                assert_eq!(admitted, shard_id);
                assert_eq!(presence, Some(json!({ "shard": shard_id })));
            }
            other => panic!("expected allow_connect, got {other:?}"),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(expected_ms), "shard {shard_id} admitted at {elapsed:?}");
        assert!(elapsed < Duration::from_millis(expected_ms + 100), "shard {shard_id} admitted at {elapsed:?}");
    }

    assert_eq!(h.cluster.state().admissions_total(), 3);
    assert_eq!(h.cluster.queued_admissions(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrency_admits_in_bursts() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 2);
    let started = Instant::now();

    for shard_id in [4, 5, 6] {
        h.from_worker(1, WorkerMessage::AdmissionRequest { shard_id }).unwrap();
    }

    for expected_ms in [0, 0, 5500] {
        assert!(matches!(
            h.worker(1).recv().await.unwrap(),
            ClusterMessage::AllowConnect { .. }
        ));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(expected_ms));
        assert!(elapsed < Duration::from_millis(expected_ms + 100));
    }
}

#[tokio::test]
async fn cache_calls_are_relayed() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);

    h.from_worker(
        1,
        WorkerMessage::CacheRequest {
            nonce: "c1".to_string(),
            method: "set".to_string(),
            args: vec![json!("guild:1"), json!({ "name": "test" })],
        },
    )
    .unwrap();
    assert_eq!(
        h.worker(1).recv().await.unwrap(),
        ClusterMessage::CacheResult {
            nonce: "c1".to_string(),
            result: Some(json!(true)),
            error: None,
        }
    );

    h.from_worker(
        2,
        WorkerMessage::CacheRequest {
            nonce: "c2".to_string(),
            method: "get".to_string(),
            args: vec![json!("guild:1")],
        },
    )
    .unwrap();
    assert_eq!(
        h.worker(2).recv().await.unwrap(),
        ClusterMessage::CacheResult {
            nonce: "c2".to_string(),
            result: Some(json!({ "name": "test" })),
            error: None,
        }
    );

    h.from_worker(
        2,
        WorkerMessage::CacheRequest {
            nonce: "c3".to_string(),
            method: "explode".to_string(),
            args: vec![],
        },
    )
    .unwrap();
    match h.worker(2).recv().await.unwrap() {
        ClusterMessage::CacheResult { nonce, result, error } => {
            assert_eq!(nonce, "c3");
            assert_eq!(result, None);
            assert!(error.is_some());
        }
        other => panic!("expected cache_result, got {other:?}"),
    }
}

#[tokio::test]
async fn api_calls_are_relayed() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);

    h.from_worker(
        0,
        WorkerMessage::ApiRequest {
            nonce: "a1".to_string(),
            method: "GET".to_string(),
            url: "/users/@me".to_string(),
            options: json!({ "query": { "with_counts": "true" } }),
        },
    )
    .unwrap();
    assert_eq!(
        h.worker(0).recv().await.unwrap(),
        ClusterMessage::ApiResponse {
            nonce: "a1".to_string(),
            response: Some(json!({ "id": "42" })),
            error: None,
        }
    );

    h.from_worker(
        0,
        WorkerMessage::ApiRequest {
            nonce: "a2".to_string(),
            method: "GET".to_string(),
            url: "/missing".to_string(),
            options: Value::Null,
        },
    )
    .unwrap();
    match h.worker(0).recv().await.unwrap() {
        ClusterMessage::ApiResponse { nonce, error, .. } => {
            assert_eq!(nonce, "a2");
            assert!(error.unwrap().contains("404"));
        }
        other => panic!("expected api_response, got {other:?}"),
    }

    let calls = h.rest.calls.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, "GET");
    assert_eq!(calls[0].1, "/users/@me");
}

#[tokio::test]
async fn evaluation_is_relayed_under_a_fresh_nonce() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);

    h.from_worker(
        1,
        WorkerMessage::EvaluationRequest {
            nonce: "outer".to_string(),
            script: "this.guilds.size".to_string(),
            target_worker: 2,
        },
    )
    .unwrap();

    let inner = match h.worker(2).recv().await.unwrap() {
        ClusterMessage::ExecuteEvaluation {
            nonce,
            script,
            target_worker,
        } => {
            assert_eq!(script, "this.guilds.size");
            assert_eq!(target_worker, 2);
            nonce
        }
        other => panic!("expected execute_evaluation, got {other:?}"),
    };
    assert_ne!(inner, "outer");

    h.from_worker(
        2,
        WorkerMessage::EvaluationReply {
            nonce: inner,
            response: json!(17),
            error: None,
        },
    )
    .unwrap();

    assert_eq!(
        h.worker(1).recv().await.unwrap(),
        ClusterMessage::EvaluationResponse {
            nonce: "outer".to_string(),
            response: Some(json!(17)),
            error: None,
        }
    );
}

#[tokio::test]
async fn failed_evaluation_reports_the_error() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);

    h.from_worker(
        0,
        WorkerMessage::EvaluationRequest {
            nonce: "missing-target".to_string(),
            script: "1".to_string(),
            target_worker: 9,
        },
    )
    .unwrap();
    match h.worker(0).recv().await.unwrap() {
        ClusterMessage::EvaluationResponse { nonce, response, error } => {
            assert_eq!(nonce, "missing-target");
            assert_eq!(response, None);
            assert!(error.unwrap().contains("worker 9"));
        }
        other => panic!("expected evaluation_response, got {other:?}"),
    }

    h.from_worker(
        0,
        WorkerMessage::EvaluationRequest {
            nonce: "throws".to_string(),
            script: "throw 1".to_string(),
            target_worker: 1,
        },
    )
    .unwrap();
    let inner = match h.worker(1).recv().await.unwrap() {
        ClusterMessage::ExecuteEvaluation { nonce, .. } => nonce,
        other => panic!("expected execute_evaluation, got {other:?}"),
    };
    h.from_worker(
        1,
        WorkerMessage::EvaluationReply {
            nonce: inner,
            response: Value::Null,
            error: Some("Uncaught 1".to_string()),
        },
    )
    .unwrap();
    match h.worker(0).recv().await.unwrap() {
        ClusterMessage::EvaluationResponse { nonce, error, .. } => {
            assert_eq!(nonce, "throws");
            assert!(error.unwrap().contains("Uncaught 1"));
        }
        other => panic!("expected evaluation_response, got {other:?}"),
    }

    // A requester that hung up still leaves the router healthy.
    drop(h.workers.remove(&2));
    h.from_worker(
        2,
        WorkerMessage::EvaluationRequest {
            nonce: "nobody-listening".to_string(),
            script: "1".to_string(),
            target_worker: 9,
        },
    )
    .unwrap();
    assert_eq!(h.cluster.pending_requests(), 0);
}

#[tokio::test]
async fn filters_veto_payload_delivery() {
    let veto: Arc<dyn EventFilter> = Arc::new(|_: ShardId, _: WorkerId, payload: &Value| {
        payload["d"]["guild_id"] != json!("blocked")
    });
    let h = Harness::with_collab(ten_shards_four_per_worker(), 1, |collab| {
        collab.with_filter("MESSAGE_CREATE", veto)
    });

    let blocked = json!({ "t": "MESSAGE_CREATE", "d": { "guild_id": "blocked" } });
    let allowed = json!({ "t": "MESSAGE_CREATE", "d": { "guild_id": "1" } });
    let unfiltered = json!({ "t": "GUILD_CREATE", "d": { "id": "blocked" } });

    for payload in [blocked, allowed.clone(), unfiltered.clone()] {
        h.from_worker(1, WorkerMessage::Payload { shard_id: 6, payload }).unwrap();
    }

    let delivered = h.sink.delivered.lock();
    assert_eq!(*delivered, vec![(6, 1, allowed), (6, 1, unfiltered)]);
}

#[tokio::test(start_paused = true)]
async fn exited_worker_is_respawned_with_its_group() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);
    h.from_worker(0, WorkerMessage::Ready).unwrap();
    h.from_worker(2, WorkerMessage::Ready).unwrap();

    h.cluster.handle_inbound(Inbound::Exited { worker_id: 1 }).unwrap();
    assert_eq!(h.cluster.worker_ids(), vec![0, 2]);
    assert_eq!(h.cluster.state().get_health(1), Some(WorkerHealth::Exited));
    // the slot is held, so the survivors alone never satisfy the barrier
    assert_eq!(h.cluster.worker_state(1), Some(WorkerState::Spawned));
    assert!(h.worker(0).try_recv().is_err());
    assert!(!h.cluster.state().is_cluster_ready());

    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(h.spawner.spawns(), 4);
    match h.spawner.take(1).try_recv().unwrap() {
        ClusterMessage::SpawnShards { shards, .. } => assert_eq!(shards, vec![4, 5, 6, 7]),
        other => panic!("expected spawn_shards, got {other:?}"),
    }
    assert_eq!(h.cluster.worker_ids(), vec![0, 1, 2]);
    assert_eq!(h.cluster.state().get_health(1), Some(WorkerHealth::Spawned));

    h.from_worker(1, WorkerMessage::Ready).unwrap();
    assert_eq!(h.worker(0).try_recv().unwrap(), ClusterMessage::ClusterReady);
    assert!(h.cluster.state().is_cluster_ready());
}

#[tokio::test(start_paused = true)]
async fn crash_looping_worker_backs_off_then_gives_up() {
    let h = Harness::new(
        ClusterOptions {
            respawn_backoff: Duration::from_secs(1),
            respawn_limit: 3,
            ..ten_shards_four_per_worker()
        },
        1,
    );

    // Each quick exit doubles the wait: 1s, 2s, 4s.
    for (respawns, delay) in [(1, 1000), (2, 2000), (3, 4000)] {
        h.cluster.handle_inbound(Inbound::Exited { worker_id: 1 }).unwrap();

        tokio::time::sleep(Duration::from_millis(delay - 1)).await;
        assert_eq!(h.spawner.spawns(), 2 + respawns);
        assert!(!h.cluster.worker_ids().contains(&1));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(h.spawner.spawns(), 3 + respawns);
        assert!(h.cluster.worker_ids().contains(&1));
    }

    let result = h.cluster.handle_inbound(Inbound::Exited { worker_id: 1 });
    assert!(matches!(
        result,
        Err(ClusterError::RespawnLimit {
            worker_id: 1,
            attempts: 4,
            max: 3
        })
    ));
    assert_eq!(result.unwrap_err().error_type_label(), "respawn_limit");

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.spawner.spawns(), 6);
    assert_eq!(h.cluster.worker_ids(), vec![0, 2]);
    assert_eq!(h.cluster.worker_state(1), None);
}

#[tokio::test(start_paused = true)]
async fn stable_worker_starts_backoff_over() {
    let h = Harness::new(
        ClusterOptions {
            respawn_backoff: Duration::from_secs(1),
            ..ten_shards_four_per_worker()
        },
        1,
    );

    h.cluster.handle_inbound(Inbound::Exited { worker_id: 0 }).unwrap();
    tokio::time::sleep(Duration::from_millis(1001)).await;
    h.cluster.handle_inbound(Inbound::Exited { worker_id: 0 }).unwrap();
    tokio::time::sleep(Duration::from_millis(2001)).await;
    assert_eq!(h.spawner.spawns(), 5);

    // Stayed up long enough: the next exit waits the base delay again.
    tokio::time::sleep(STABLE_UPTIME).await;
    h.cluster.handle_inbound(Inbound::Exited { worker_id: 0 }).unwrap();
    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(h.spawner.spawns(), 6);
}

#[tokio::test]
async fn exited_worker_leaves_the_barrier_when_not_respawned() {
    let mut h = Harness::new(
        ClusterOptions {
            respawn: false,
            ..ten_shards_four_per_worker()
        },
        1,
    );

    h.cluster.handle_inbound(Inbound::Exited { worker_id: 2 }).unwrap();
    assert_eq!(h.cluster.worker_ids(), vec![0, 1]);
    assert_eq!(h.cluster.state().get_health(2), Some(WorkerHealth::Exited));

    h.from_worker(0, WorkerMessage::Ready).unwrap();
    h.from_worker(1, WorkerMessage::Ready).unwrap();
    assert_eq!(h.worker(0).try_recv().unwrap(), ClusterMessage::ClusterReady);
}

#[tokio::test]
async fn last_unready_worker_exiting_completes_the_barrier() {
    let mut h = Harness::new(
        ClusterOptions {
            respawn: false,
            ..ten_shards_four_per_worker()
        },
        1,
    );

    h.from_worker(0, WorkerMessage::Ready).unwrap();
    h.from_worker(1, WorkerMessage::Ready).unwrap();
    assert!(!h.cluster.state().is_cluster_ready());

    h.cluster.handle_inbound(Inbound::Exited { worker_id: 2 }).unwrap();
    assert_eq!(h.worker(0).try_recv().unwrap(), ClusterMessage::ClusterReady);
    assert!(h.worker(1).try_recv().is_err());
    assert!(h.cluster.state().is_cluster_ready());
    assert_eq!(h.cluster.ready_broadcasts(), 1);
}

#[tokio::test]
async fn ready_gauge_follows_worker_health() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let h = Harness::new(
        ClusterOptions {
            respawn: false,
            ..ten_shards_four_per_worker()
        },
        1,
    );

    metrics::with_local_recorder(&recorder, || {
        for worker_id in [0, 1, 2] {
            h.from_worker(worker_id, WorkerMessage::Ready).unwrap();
        }
    });
    assert_eq!(h.cluster.ready_broadcasts(), 1);
    assert_eq!(h.cluster.state().ready_workers(), 3);
    assert!(handle.render().contains("cluster_workers_ready 3"));

    metrics::with_local_recorder(&recorder, || {
        h.cluster.handle_inbound(Inbound::Exited { worker_id: 1 }).unwrap();
    });
    assert_eq!(h.cluster.state().ready_workers(), 2);
    assert!(handle.render().contains("cluster_workers_ready 2"));
}

#[tokio::test]
async fn run_routes_inbound_until_shutdown() {
    let mut h = Harness::new(ten_shards_four_per_worker(), 1);
    let router = tokio::spawn({
        let cluster = h.cluster.clone();
        async move { cluster.run().await }
    });

    let inbound = h.cluster.inbound();
    for worker_id in [0, 1, 2] {
        inbound
            .send(Inbound::Message(Envelope {
                worker_id,
                message: WorkerMessage::Ready,
            }))
            .unwrap();
    }
    assert_eq!(h.worker(0).recv().await.unwrap(), ClusterMessage::ClusterReady);

    h.cluster.shutdown();
    router.await.unwrap().unwrap();

    for worker_id in [0, 1, 2] {
        assert_eq!(h.worker(worker_id).recv().await.unwrap(), ClusterMessage::Shutdown);
    }
    assert!(h.cluster.worker_ids().is_empty());
    assert!(matches!(h.cluster.run().await, Err(ClusterError::AlreadyRunning)));
}
