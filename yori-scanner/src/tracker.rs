//! Bookkeeping for asynchronous page operations reported by the probe.

use crate::request::PendingRequest;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DRAIN_INTERVAL: Duration = Duration::from_millis(50);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default)]
pub struct PendingRequestTracker {
    pending: Arc<Mutex<Vec<PendingRequest>>>,
}

impl PendingRequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, request: PendingRequest) {
        self.lock().push(request);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Empty the list on a fixed period until `cancel` fires.
    ///
    /// Entries are not matched against completions: every tick drops all of
    /// them, so a request is considered settled at most one period after it
    /// was reported.
    pub fn spawn_drain(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        tokio::spawn(async move {
            let mut ticker = interval(DRAIN_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let mut list = pending.lock().unwrap_or_else(PoisonError::into_inner);
                        if !list.is_empty() {
                            debug!("Draining {} pending request(s)", list.len());
                            list.clear();
                        }
                    }
                }
            }
        })
    }

    /// Poll until no request is pending or `timeout` elapses. Returns whether
    /// the page settled in time; a timeout is not an error.
    pub async fn wait_for_quiescence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                debug!(
                    "Timed out after {:?} with {} request(s) pending",
                    timeout,
                    self.len()
                );
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
