//! Outstanding dispatch attempt counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::telemetry::counters;

/// Count of dispatch attempts submitted but not yet through a callback path.
///
/// Cloning shares the counter. Every submission holds one [`InFlightPermit`];
/// dropping it is the decrement, so each completion path releases exactly once.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one outstanding attempt.
    pub fn acquire(&self) -> InFlightPermit {
        let now = self.inner.count.fetch_add(1, Ordering::AcqRel) + 1;
        counters::in_flight_set(now);
        InFlightPermit {
            inner: self.inner.clone(),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Resolve once no attempt is outstanding.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Held by one dispatch attempt; releases the slot on drop.
#[derive(Debug)]
pub struct InFlightPermit {
    inner: Arc<Inner>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let now = self.inner.count.fetch_sub(1, Ordering::AcqRel) - 1;
        counters::in_flight_set(now);
        if now == 0 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_permit_counts() {
        let tracker = InFlightTracker::new();
        let a = tracker.acquire();
        let b = tracker.acquire();
        assert_eq!(tracker.count(), 2);
        drop(a);
        assert_eq!(tracker.count(), 1);
        drop(b);
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn test_clones_share_counter() {
        let tracker = InFlightTracker::new();
        let other = tracker.clone();
        let _permit = other.acquire();
        assert_eq!(tracker.count(), 1);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let tracker = InFlightTracker::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_resolves_after_last_release() {
        let tracker = InFlightTracker::new();
        let permit = tracker.acquire();

        let waiter = tokio::spawn({
            let tracker = tracker.clone();
            async move { tracker.wait_idle().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(permit);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
