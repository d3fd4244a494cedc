//! Pending-request table
//!
//! Maps a correlation nonce to the task waiting for its reply. Each entry is
//! removed by exactly one of: a matching reply, an explicit reject, or its
//! deadline timer. Removal from the map is the single point of arbitration,
//! so a late reply after a timeout (or a timer after a reply) finds nothing.

use crate::error::ClusterError;
use crate::metrics::ClusterMetrics;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Default reply deadline
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts before `open` gives up on finding an unused nonce
pub const MAX_NONCE_ATTEMPTS: usize = 16;

/// Nonce length class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    /// Full hyphenated v4 UUID
    Long,
    /// First 8 characters of a v4 UUID, for high-frequency requests
    Short,
}

/// Produces candidate nonces; swapped out in tests to force collisions
pub type NonceSource = Arc<dyn Fn(NonceKind) -> String + Send + Sync>;

/// Random UUID-based nonce
pub fn uuid_nonce(kind: NonceKind) -> String {
    let id = Uuid::new_v4().to_string();
    match kind {
        NonceKind::Long => id,
        NonceKind::Short => id[..8].to_string(),
    }
}

type Outcome = Result<Value, ClusterError>;

struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    timer: AbortHandle,
}

/// Table of requests awaiting a correlated reply
#[derive(Clone)]
pub struct PendingTable {
    entries: Arc<DashMap<String, PendingEntry>>,
    timeout: Duration,
    source: NonceSource,
    metrics: ClusterMetrics,
}

impl PendingTable {
    pub fn new(timeout: Duration, metrics: ClusterMetrics) -> Self {
        Self::with_nonce_source(timeout, metrics, Arc::new(uuid_nonce))
    }

    pub fn with_nonce_source(timeout: Duration, metrics: ClusterMetrics, source: NonceSource) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            timeout,
            source,
            metrics,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mint a nonce that is not currently pending and register a waiter for it.
    ///
    /// The deadline timer starts immediately. Must be called inside a Tokio
    /// runtime.
    pub fn open(&self, kind: NonceKind) -> Result<PendingReply, ClusterError> {
        for _ in 0..MAX_NONCE_ATTEMPTS {
            let candidate = (self.source)(kind);

            // The vacant-entry guard holds the shard lock until insert, so the
            // timer cannot observe the map before the entry exists.
            let Entry::Vacant(slot) = self.entries.entry(candidate) else {
                continue;
            };
            let nonce = slot.key().clone();
            let (tx, rx) = oneshot::channel();
            let timer = self.spawn_timer(nonce.clone());
            slot.insert(PendingEntry { tx, timer });

            self.metrics.set_pending_requests(self.entries.len());
            return Ok(PendingReply { nonce, rx });
        }

        Err(ClusterError::NonceExhausted {
            attempts: MAX_NONCE_ATTEMPTS,
        })
    }

    fn spawn_timer(&self, nonce: String) -> AbortHandle {
        let entries = Arc::clone(&self.entries);
        let metrics = self.metrics.clone();
        let after = self.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some((nonce, entry)) = entries.remove(&nonce) {
                warn!(nonce = %nonce, ?after, "Request timed out");
                metrics.record_timeout();
                metrics.set_pending_requests(entries.len());
                let _ = entry.tx.send(Err(ClusterError::Timeout { nonce, after }));
            }
        })
        .abort_handle()
    }

    /// Resolve the waiter for `nonce`. Returns false for a stale reply.
    pub fn resolve(&self, nonce: &str, value: Value) -> bool {
        self.complete(nonce, Ok(value))
    }

    /// Fail the waiter for `nonce`. Returns false if nothing was pending.
    pub fn reject(&self, nonce: &str, error: ClusterError) -> bool {
        self.complete(nonce, Err(error))
    }

    fn complete(&self, nonce: &str, outcome: Outcome) -> bool {
        let Some((_, entry)) = self.entries.remove(nonce) else {
            debug!(nonce, "Dropping reply with no pending request");
            self.metrics.record_stale_reply();
            return false;
        };

        entry.timer.abort();
        self.metrics.set_pending_requests(self.entries.len());
        // Waiter may already be gone.
        let _ = entry.tx.send(outcome);
        true
    }

    pub fn contains(&self, nonce: &str) -> bool {
        self.entries.contains_key(nonce)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Future resolving to the correlated reply, or a timeout error
#[derive(Debug)]
pub struct PendingReply {
    nonce: String,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingReply {
    pub fn nonce(&self) -> &str {
        &self.nonce
    }
}

impl Future for PendingReply {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClusterError::ReplyDropped {
                nonce: this.nonce.clone(),
            })),
        }
    }
}
