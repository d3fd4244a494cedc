//! Health check endpoints

use crate::cluster::{ClusterState, WorkerSnapshot};
use crate::metrics::ClusterMetrics;
use crate::nats::NatsSink;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub total_shards: u32,
    pub worker_count: u32,
}

/// Readiness check response
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub workers_total: u32,
    pub workers_live: usize,
    pub workers_ready: usize,
    pub ready_broadcasts: u64,
    pub nats_connected: bool,
    pub workers: Vec<WorkerSnapshot>,
}

/// Application state for health endpoints
#[derive(Clone)]
pub struct AppState {
    pub cluster_state: ClusterState,
    pub nats: Option<NatsSink>,
    pub metrics: ClusterMetrics,
}

/// Create the health check router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Health endpoint - always returns 200 if process is running
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        total_shards: state.cluster_state.total_shards(),
        worker_count: state.cluster_state.worker_count(),
    })
}

/// Readiness endpoint - 200 once the cluster-ready signal went out and no
/// worker has exited since
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let nats_connected = state.nats.as_ref().map_or(true, NatsSink::is_connected);
    let is_ready = state.cluster_state.is_cluster_ready() && nats_connected;

    let response = ReadyResponse {
        ready: is_ready,
        workers_total: state.cluster_state.worker_count(),
        workers_live: state.cluster_state.live_workers(),
        workers_ready: state.cluster_state.ready_workers(),
        ready_broadcasts: state.cluster_state.ready_broadcasts(),
        nats_connected,
        workers: state.cluster_state.snapshot(),
    };

    if is_ready {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

/// Metrics endpoint - returns Prometheus format metrics
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_serialization() {
        let response = HealthResponse {
            status: "healthy",
            version: "0.2.0",
            total_shards: 10,
            worker_count: 3,
        };

        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("healthy"));
        assert!(json.contains("\"worker_count\":3"));
    }

    #[test]
    fn ready_response_lists_workers() {
        let state = ClusterState::new(10, 3);
        state.register_worker(0, vec![0, 1, 2, 3]);

        let response = ReadyResponse {
            ready: false,
            workers_total: state.worker_count(),
            workers_live: state.live_workers(),
            workers_ready: state.ready_workers(),
            ready_broadcasts: state.ready_broadcasts(),
            nats_connected: true,
            workers: state.snapshot(),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["ready"], false);
        assert_eq!(json["workers_live"], 1);
        assert_eq!(json["workers"][0]["health"], "spawned");
        assert_eq!(json["workers"][0]["shards"], serde_json::json!([0, 1, 2, 3]));
    }
}
