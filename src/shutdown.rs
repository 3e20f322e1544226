//! Graceful-shutdown coordination for active SSE streams.
//!
//! On SIGTERM / ctrl-c every open stream receives a `server_shutdown`
//! event so clients can show a "reconnecting" state instead of a raw
//! network error, then the process drains for a bounded grace period.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// How long streams get to drain after the shutdown signal.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared shutdown state. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    signal: watch::Sender<bool>,
    active_streams: Arc<AtomicUsize>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            signal,
            active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.signal.borrow()
    }

    pub fn active_stream_count(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Signal all active streams that the server is going down.
    pub fn initiate(&self) {
        tracing::info!(
            active_streams = self.active_stream_count(),
            "shutdown initiated"
        );
        self.signal.send_replace(true);
    }

    /// A receiver that resolves when shutdown is initiated.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Track one SSE stream for the duration of the returned guard.
    pub fn register_stream(&self) -> StreamGuard {
        self.active_streams.fetch_add(1, Ordering::SeqCst);
        StreamGuard {
            active_streams: self.active_streams.clone(),
        }
    }

    /// Wait until all streams have drained or the grace period elapses.
    pub async fn drain(&self, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_stream_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::info!(
            remaining_streams = self.active_stream_count(),
            "shutdown drain finished"
        );
    }
}

/// Decrements the active-stream count on drop.
pub struct StreamGuard {
    active_streams: Arc<AtomicUsize>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
}
