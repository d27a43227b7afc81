//! Periodic statistics snapshots.
//!
//! A [`StatsExporter`] samples the cache, arena and session tracker on an
//! interval, keeps a bounded history, and republishes each sample as gauges.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::memory::{ArenaStats, SessionManager, SessionStats};
use crate::models::{ModelCache, ModelCacheStats};

/// One sample of every component's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub taken_at: DateTime<Utc>,
    pub cache: ModelCacheStats,
    /// Present when the cache is backed by an arena.
    pub arena: Option<ArenaStats>,
    pub sessions: SessionStats,
}

pub struct StatsExporter {
    cache: ModelCache,
    sessions: Arc<SessionManager>,
    history: Mutex<VecDeque<StatsSnapshot>>,
    history_limit: usize,
}

impl StatsExporter {
    pub fn new(cache: ModelCache, sessions: Arc<SessionManager>, history_limit: usize) -> Self {
        Self {
            cache,
            sessions,
            history: Mutex::new(VecDeque::new()),
            history_limit: history_limit.max(1),
        }
    }

    /// Sample now without recording.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            taken_at: Utc::now(),
            cache: self.cache.stats(),
            arena: self.cache.arena().map(|arena| arena.stats()),
            sessions: self.sessions.stats(),
        }
    }

    /// Sample, publish as gauges and append to the history.
    pub fn record_snapshot(&self) -> StatsSnapshot {
        let snapshot = self.snapshot();
        super::metrics::record_snapshot(&snapshot);

        let mut history = self.history.lock();
        if history.len() == self.history_limit {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    /// Recorded snapshots, oldest first.
    pub fn history(&self) -> Vec<StatsSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<StatsSnapshot> {
        self.history.lock().back().cloned()
    }

    /// Recorded history as a JSON array.
    pub fn to_json(&self) -> serde_json::Result<String> {
        let history = self.history.lock();
        serde_json::to_string(&*history)
    }

    /// Record a snapshot every `interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        tracing::debug!("stats exporter: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        let snapshot = self.record_snapshot();
                        tracing::debug!(
                            used_mb = snapshot.cache.used_mb,
                            loaded = snapshot.cache.loaded_models,
                            sessions = snapshot.sessions.total_sessions,
                            "stats snapshot"
                        );
                    }
                }
            }
        })
    }
}

/// Mean of `count` samples summing to `total`, zero when there are none.
pub(crate) fn mean_duration(total: Duration, count: u64) -> Duration {
    match u32::try_from(count) {
        Ok(0) => Duration::ZERO,
        Ok(n) => total / n,
        Err(_) => total.div_f64(count as f64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_duration_handles_empty_and_small_counts() {
        assert_eq!(mean_duration(Duration::from_secs(10), 0), Duration::ZERO);
        assert_eq!(mean_duration(Duration::from_secs(10), 4), Duration::from_millis(2500));
    }

    #[test]
    fn mean_duration_does_not_truncate_large_counts() {
        // 2^32 samples of 1 ms each; a u32 cast would wrap the count to zero.
        let count = 1u64 << 32;
        let total = Duration::from_millis(count);
        let mean = mean_duration(total, count);
        assert!((mean.as_secs_f64() - 0.001).abs() < 1e-9, "mean was {mean:?}");
    }
}
