//! Rate-limited admission queue
//!
//! Actions run in push order. At most `max_concurrency` actions start inside
//! any window of `interval`; once the window is full the next action waits
//! until the oldest start in it is `interval` old. With `max_concurrency = 1`
//! successive starts are exactly `interval` apart.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Required spacing between identify bursts
pub const DEFAULT_ADMISSION_INTERVAL: Duration = Duration::from_millis(5500);

/// A queued admission, run exactly once
pub type AdmissionAction = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the admission scheduler. Cheap to clone, safe to push from
/// many tasks at once.
#[derive(Clone)]
pub struct AdmissionQueue {
    tx: mpsc::UnboundedSender<AdmissionAction>,
    queued: Arc<AtomicUsize>,
    max_concurrency: u32,
    interval: Duration,
}

impl AdmissionQueue {
    /// Start the scheduler task. Must be called inside a Tokio runtime.
    pub fn new(max_concurrency: u32, interval: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));

        tokio::spawn(drain(rx, Arc::clone(&queued), max_concurrency as usize, interval));

        Self {
            tx,
            queued,
            max_concurrency,
            interval,
        }
    }

    /// Append an action. Never blocks; the action runs when the rate limit
    /// allows.
    pub fn push<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Box::new(action)).is_err() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            warn!("Admission scheduler stopped, dropping action");
        }
    }

    /// Actions pushed but not yet started
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_concurrency(&self) -> u32 {
        self.max_concurrency
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<AdmissionAction>,
    queued: Arc<AtomicUsize>,
    max_concurrency: usize,
    interval: Duration,
) {
    // Start instants of the most recent `max_concurrency` actions
    let mut window: VecDeque<Instant> = VecDeque::with_capacity(max_concurrency);

    while let Some(action) = rx.recv().await {
        if window.len() >= max_concurrency {
            if let Some(oldest) = window.pop_front() {
                let release_at = oldest + interval;
                if release_at > Instant::now() {
                    debug!(wait = ?(release_at - Instant::now()), "Admission window full");
                    tokio::time::sleep_until(release_at).await;
                }
            }
        }

        window.push_back(Instant::now());
        queued.fetch_sub(1, Ordering::SeqCst);
        action();
    }

    debug!("Admission scheduler stopped");
}
