//! Prometheus metrics module
//!
//! The facade records through the global `metrics` recorder. Without an
//! installed recorder (tests, embedded use) every call is a no-op.

use crate::error::ClusterError;
use crate::shard::WorkerId;
use metrics::{counter, describe_counter, describe_gauge, gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Cluster metrics collector
#[derive(Clone, Default)]
pub struct ClusterMetrics {
    handle: Option<Arc<PrometheusHandle>>,
}

impl ClusterMetrics {
    /// Install the Prometheus recorder and register metric descriptions
    pub fn install() -> Result<Self, ClusterError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| ClusterError::Config(format!("failed to install Prometheus recorder: {e}")))?;

        Self::register_metrics();

        Ok(Self {
            handle: Some(Arc::new(handle)),
        })
    }

    /// Register metric descriptions
    fn register_metrics() {
        describe_counter!(
            "cluster_worker_messages_total",
            Unit::Count,
            "Messages received from workers, by kind"
        );
        describe_counter!(
            "cluster_admissions_total",
            Unit::Count,
            "Shard admissions granted by the admission queue"
        );
        describe_counter!(
            "cluster_requests_timed_out_total",
            Unit::Count,
            "Correlated requests that expired without a reply"
        );
        describe_counter!(
            "cluster_stale_replies_total",
            Unit::Count,
            "Replies whose nonce had no pending request"
        );
        describe_counter!(
            "cluster_payloads_vetoed_total",
            Unit::Count,
            "Inbound payloads dropped by an event filter"
        );
        describe_counter!("cluster_errors_total", Unit::Count, "Total cluster errors");
        describe_counter!(
            "cluster_ready_broadcasts_total",
            Unit::Count,
            "Cluster-ready broadcasts sent"
        );

        describe_gauge!(
            "cluster_workers_ready",
            Unit::Count,
            "Workers that reported ready since their last spawn"
        );
        describe_gauge!(
            "cluster_pending_requests",
            Unit::Count,
            "Requests awaiting a correlated reply"
        );
    }

    /// Record an inbound worker message
    pub fn record_message(&self, kind: &'static str) {
        counter!("cluster_worker_messages_total", "kind" => kind).increment(1);
    }

    /// Record an admission grant
    pub fn record_admission(&self, worker_id: WorkerId) {
        counter!(
            "cluster_admissions_total",
            "worker_id" => worker_id.to_string()
        )
        .increment(1);
    }

    pub fn record_timeout(&self) {
        counter!("cluster_requests_timed_out_total").increment(1);
    }

    pub fn record_stale_reply(&self) {
        counter!("cluster_stale_replies_total").increment(1);
    }

    pub fn record_vetoed(&self, event_type: &str) {
        counter!(
            "cluster_payloads_vetoed_total",
            "event_type" => event_type.to_string()
        )
        .increment(1);
    }

    /// Record cluster error by `ClusterError::error_type_label`
    pub fn record_error(&self, error_type: &'static str) {
        counter!("cluster_errors_total", "error_type" => error_type).increment(1);
    }

    pub fn record_ready_broadcast(&self) {
        counter!("cluster_ready_broadcasts_total").increment(1);
    }

    pub fn set_workers_ready(&self, count: usize) {
        gauge!("cluster_workers_ready").set(count as f64);
    }

    pub fn set_pending_requests(&self, count: usize) {
        gauge!("cluster_pending_requests").set(count as f64);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle
            .as_ref()
            .map(|handle| handle.render())
            .unwrap_or_default()
    }
}
