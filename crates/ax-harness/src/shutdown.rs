use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tracing::{info, trace, warn};

// ---------------------------------------------------------------------------
// ShutdownSignal — two-phase graceful teardown
// ---------------------------------------------------------------------------

/// Coordinates teardown across the producer's long-lived parts.
///
/// Phase one: [`initiate`](ShutdownSignal::initiate) wakes every subscriber
/// (accept loop, cron registry, sweepers) so they stop taking new work.
/// Phase two: [`wait_drained`](ShutdownSignal::wait_drained) blocks until
/// every outstanding [`DrainGuard`] — one per unit of in-flight background
/// work, such as a detached ingest cache batch — has been dropped, or the
/// deadline passes.
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    wake: broadcast::Sender<()>,
    stopping: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (wake, _) = broadcast::channel(4);
        Self {
            inner: Arc::new(SignalInner {
                wake,
                stopping: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
        }
    }

    /// Receiver that fires once teardown begins.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.wake.subscribe()
    }

    /// Cheap poll for components that cannot hold a receiver.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.stopping.load(Ordering::Relaxed)
    }

    /// Begin teardown and wake all subscribers. Later calls are no-ops.
    pub fn initiate(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(
            in_flight = self.inner.in_flight.load(Ordering::Acquire),
            "graceful teardown started"
        );
        let _ = self.inner.wake.send(());
    }

    /// Track one unit of in-flight background work until the returned
    /// guard drops.
    pub fn register(&self, task: &'static str) -> DrainGuard {
        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        DrainGuard {
            inner: Arc::clone(&self.inner),
            task,
        }
    }

    /// Number of live drain guards.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Wait until all registered work has drained.
    ///
    /// Returns `false` when the deadline passes first; the leftover count
    /// is logged so operators can see what was abandoned.
    pub async fn wait_drained(&self, deadline: Duration) -> bool {
        let drained = async {
            loop {
                // Arm the notifier before the check so a guard dropping
                // in between cannot be missed.
                let idle = self.inner.idle.notified();
                if self.inner.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                idle.await;
            }
        };
        match tokio::time::timeout(deadline, drained).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    abandoned = self.inner.in_flight.load(Ordering::Acquire),
                    "teardown deadline passed with background work still in flight"
                );
                false
            }
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// DrainGuard
// ---------------------------------------------------------------------------

/// Handle for one unit of in-flight work; dropping it confirms the drain.
pub struct DrainGuard {
    inner: Arc<SignalInner>,
    task: &'static str,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        trace!(task = self.task, "background work drained");
        if self.inner.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_wake_on_initiate() {
        let signal = ShutdownSignal::new();
        let mut rx1 = signal.subscribe();
        let mut rx2 = signal.subscribe();

        assert!(!signal.is_shutting_down());
        signal.initiate();
        assert!(signal.is_shutting_down());

        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();
    }

    #[tokio::test]
    async fn repeated_initiate_is_harmless() {
        let signal = ShutdownSignal::new();
        signal.initiate();
        signal.initiate();
        assert!(signal.is_shutting_down());
    }

    #[tokio::test]
    async fn drains_immediately_with_no_registered_work() {
        let signal = ShutdownSignal::new();
        assert_eq!(signal.in_flight(), 0);
        assert!(signal.wait_drained(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn wait_drained_blocks_until_guards_drop() {
        let signal = ShutdownSignal::new();
        let g1 = signal.register("batch-a");
        let g2 = signal.register("batch-b");
        assert_eq!(signal.in_flight(), 2);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(g1);
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(g2);
        });

        assert!(signal.wait_drained(Duration::from_secs(2)).await);
        assert_eq!(signal.in_flight(), 0);
    }

    #[tokio::test]
    async fn wait_drained_reports_deadline_miss() {
        let signal = ShutdownSignal::new();
        let _held = signal.register("stuck-batch");
        assert!(!signal.wait_drained(Duration::from_millis(40)).await);
        assert_eq!(signal.in_flight(), 1);
    }

    #[tokio::test]
    async fn guard_dropped_inside_spawned_task_counts_down() {
        let signal = ShutdownSignal::new();
        let guard = signal.register("detached");
        let handle = tokio::spawn(async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_millis(10)).await;
        });
        handle.await.unwrap();
        assert_eq!(signal.in_flight(), 0);
    }
}
