//! NATS dispatch sink
//!
//! Publishes enveloped gateway dispatches to NATS. Payloads are queued from
//! the router's inbound loop and published in arrival order by a single
//! background task.

use crate::collab::DispatchSink;
use crate::error::ClusterError;
use crate::events::serialize::{envelope, DispatchEnvelope};
use crate::shard::{ShardId, WorkerId};
use async_nats::Client;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Subject prefixes for routing
pub mod subjects {
    /// Interactions: commands.interaction
    pub const INTERACTION: &str = "commands.interaction";
    /// Guild events: events.guild.{event_type}
    pub const GUILD_EVENTS: &str = "events.guild";
    /// Member events: events.member.{event_type}
    pub const MEMBER_EVENTS: &str = "events.member";
    /// Everything else: events.{event_type}
    pub const EVENTS: &str = "events";
}

/// Route an envelope event type to its subject
pub fn route_subject(event_type: &str) -> String {
    if event_type == "interaction.create" {
        return subjects::INTERACTION.to_string();
    }
    if let Some(rest) = event_type.strip_prefix("guild.member.") {
        return format!("{}.{rest}", subjects::MEMBER_EVENTS);
    }
    if let Some(rest) = event_type.strip_prefix("guild.") {
        return format!("{}.{rest}", subjects::GUILD_EVENTS);
    }
    format!("{}.{event_type}", subjects::EVENTS)
}

#[derive(Debug, Default)]
struct PublishStats {
    connected: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

/// Dispatch sink publishing to NATS
#[derive(Clone)]
pub struct NatsSink {
    client: Client,
    queue: mpsc::UnboundedSender<DispatchEnvelope>,
    stats: Arc<PublishStats>,
}

impl NatsSink {
    /// Connect to NATS server(s) and start the publish task
    pub async fn connect(servers: &str) -> Result<Self, ClusterError> {
        info!(servers, "Connecting to NATS");

        let client = async_nats::connect(servers)
            .await
            .map_err(|e| ClusterError::NatsConnectionFailed(Box::new(e)))?;

        let stats = Arc::new(PublishStats::default());
        stats.connected.store(true, Ordering::SeqCst);

        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(publish_loop(client.clone(), rx, Arc::clone(&stats)));

        info!("Connected to NATS");
        Ok(Self { client, queue, stats })
    }

    pub fn is_connected(&self) -> bool {
        self.stats.connected.load(Ordering::SeqCst)
    }

    pub fn messages_published(&self) -> u64 {
        self.stats.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.stats.publish_failures.load(Ordering::Relaxed)
    }

    /// Flush pending publishes and mark the sink closed
    pub async fn close(&self) {
        info!("Closing NATS connection");
        if let Err(e) = self.client.flush().await {
            warn!(error = %e, "Failed to flush NATS connection");
        }
        self.stats.connected.store(false, Ordering::SeqCst);
    }
}

impl DispatchSink for NatsSink {
    fn deliver(&self, shard_id: ShardId, worker_id: WorkerId, payload: Value) {
        let Some(event) = envelope(shard_id, worker_id, &payload) else {
            return;
        };
        if self.queue.send(event).is_err() {
            self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(shard_id, worker_id, "NATS publish task stopped, dropping event");
        }
    }
}

async fn publish_loop(
    client: Client,
    mut rx: mpsc::UnboundedReceiver<DispatchEnvelope>,
    stats: Arc<PublishStats>,
) {
    while let Some(event) = rx.recv().await {
        let subject = route_subject(&event.event_type);
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(event_type = %event.event_type, error = %e, "Failed to serialize event");
                continue;
            }
        };

        match client.publish(subject.clone(), payload.into()).await {
            Ok(()) => {
                stats.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!(subject = %subject, event_id = %event.event_id, shard_id = event.shard_id, "Event published");
            }
            Err(e) => {
                stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                warn!(subject = %subject, error = %e, "Failed to publish event");
            }
        }
    }
}
