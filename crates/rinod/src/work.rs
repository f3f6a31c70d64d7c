//! In-flight work tracking.
//!
//! Every concurrent unit the daemon starts (accept loops, connection
//! handlers, notifier dispatches) is spawned through [`InFlightWork`].
//! Shutdown closes the tracker and waits until the count reaches zero.
//!
//! The count is maintained by `tokio_util`'s `TaskTracker`: a unit is
//! counted from the moment it is spawned until its future completes (or
//! panics), so an increment can never be lost or doubled.

use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Shared counter of outstanding asynchronous work.
///
/// Cheap to clone; all clones observe the same count.
#[derive(Debug, Clone, Default)]
pub struct InFlightWork {
    tracker: TaskTracker,
}

impl InFlightWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `future` on the runtime as one tracked unit of work.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    /// Number of units currently in flight.
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Returns true when nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Marks the tracker as closed so [`drained`](Self::drained) can resolve.
    ///
    /// Units spawned after closing are still counted. Returns `true` only
    /// for the call that actually closed it.
    pub fn close(&self) -> bool {
        self.tracker.close()
    }

    pub fn is_closed(&self) -> bool {
        self.tracker.is_closed()
    }

    /// Resolves once the tracker is closed and the count is zero.
    pub async fn drained(&self) {
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_counts_spawned_units() {
        let work = InFlightWork::new();
        let (tx, rx) = oneshot::channel::<()>();

        work.spawn(async move {
            let _ = rx.await;
        });
        assert_eq!(work.len(), 1);

        tx.send(()).unwrap();
        work.close();
        timeout(Duration::from_secs(1), work.drained())
            .await
            .expect("drained after unit completes");
        assert!(work.is_empty());
    }

    #[tokio::test]
    async fn test_not_drained_until_closed() {
        let work = InFlightWork::new();
        assert!(work.is_empty());
        assert!(timeout(Duration::from_millis(50), work.drained())
            .await
            .is_err());

        work.close();
        timeout(Duration::from_millis(50), work.drained())
            .await
            .expect("empty closed tracker is drained");
    }

    #[tokio::test]
    async fn test_nested_spawn_after_close_is_awaited() {
        let work = InFlightWork::new();
        let (done_tx, done_rx) = oneshot::channel();

        let inner = work.clone();
        work.spawn(async move {
            // Spawned by a tracked unit, after close: still counted
            tokio::time::sleep(Duration::from_millis(20)).await;
            inner.spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let _ = done_tx.send(());
            });
        });

        work.close();
        timeout(Duration::from_secs(1), work.drained())
            .await
            .expect("drained");
        assert!(done_rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let work = InFlightWork::new();
        assert!(work.close());
        assert!(!work.close());
        assert!(work.is_closed());
    }
}
