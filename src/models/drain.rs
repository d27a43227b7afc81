//! In-flight request tracking for drain coordination.
//!
//! Counts outstanding leases per model id so a graceful hot reload can wait
//! for every user of the old handle to finish before swapping it out.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DrainError {
    #[error("Drain timed out with {remaining} request(s) still in flight")]
    Timeout { remaining: u32 },
}

/// Tracks in-flight requests per model id.
#[derive(Default)]
pub struct FlightTracker {
    in_flight: DashMap<String, Arc<AtomicU32>>,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the in-flight count for a model (returns RAII guard).
    pub fn track(&self, model_id: &str) -> FlightGuard {
        let counter = self
            .in_flight
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();

        counter.fetch_add(1, Ordering::SeqCst);

        FlightGuard { counter }
    }

    pub fn in_flight_count(&self, model_id: &str) -> u32 {
        self.in_flight
            .get(model_id)
            .map(|c| c.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Wait until the in-flight count reaches zero (with timeout).
    pub async fn drain(&self, model_id: &str, timeout: Duration) -> Result<(), DrainError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let poll_interval = Duration::from_millis(10);

        loop {
            let count = self.in_flight_count(model_id);
            if count == 0 {
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(DrainError::Timeout { remaining: count });
            }

            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Drop the counter for a model once nothing references it.
    pub fn remove(&self, model_id: &str) {
        self.in_flight
            .remove_if(model_id, |_, c| c.load(Ordering::SeqCst) == 0);
    }
}

/// RAII guard that decrements the in-flight count on drop.
pub struct FlightGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let tracker = Arc::new(FlightTracker::new());
        let guard = tracker.track("m");
        assert_eq!(tracker.in_flight_count("m"), 1);

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        tracker.drain("m", Duration::from_secs(2)).await.unwrap();
        release.await.unwrap();
        assert_eq!(tracker.in_flight_count("m"), 0);
    }

    #[tokio::test]
    async fn drain_times_out_with_remaining_count() {
        let tracker = FlightTracker::new();
        let _a = tracker.track("m");
        let _b = tracker.track("m");

        let err = tracker.drain("m", Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, DrainError::Timeout { remaining: 2 });
    }

    #[test]
    fn idle_model_drains_immediately() {
        let tracker = FlightTracker::new();
        drop(tracker.track("m"));
        tokio_test::assert_ok!(tokio_test::block_on(tracker.drain("m", Duration::ZERO)));
        tokio_test::assert_ok!(tokio_test::block_on(tracker.drain("unknown", Duration::ZERO)));
    }

    #[test]
    fn remove_keeps_busy_counters() {
        let tracker = FlightTracker::new();
        let guard = tracker.track("m");
        tracker.remove("m");
        assert_eq!(tracker.in_flight_count("m"), 1);
        drop(guard);
        tracker.remove("m");
        assert_eq!(tracker.in_flight_count("m"), 0);
    }
}
