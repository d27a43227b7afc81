//! Demand-anticipating preloader.
//!
//! Keeps a prioritised candidate list and, on each tick, asks the cache to
//! load the candidates that are not yet resident. Preloads go through the
//! cache's normal admission path, so they never bypass the budget.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cache::{CacheError, ModelCache, TimeoutBehavior};
use super::eviction::predict_usage_probability;
use crate::telemetry::mean_duration;

/// How eagerly usage predictions turn into preloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreloadStrategy {
    Aggressive,
    #[default]
    Moderate,
    Conservative,
}

impl PreloadStrategy {
    /// Minimum predicted usage probability for `analyze_and_preload`.
    pub fn threshold(self) -> f64 {
        match self {
            Self::Aggressive => 0.1,
            Self::Moderate => 0.4,
            Self::Conservative => 0.7,
        }
    }

    /// Most loads started per tick.
    pub fn max_per_tick(self) -> usize {
        match self {
            Self::Aggressive => 8,
            Self::Moderate => 4,
            Self::Conservative => 2,
        }
    }
}

impl std::str::FromStr for PreloadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aggressive" => Ok(Self::Aggressive),
            "moderate" => Ok(Self::Moderate),
            "conservative" => Ok(Self::Conservative),
            other => Err(format!("unknown preload strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PreloadStats {
    pub preload_requests: u64,
    pub successful_preloads: u64,
    pub failed_preloads: u64,
    pub cache_hits_from_preload: u64,
    /// Preload hits per successful preload, capped at 1.
    pub preload_effectiveness: f64,
    pub avg_preload_time: Duration,
}

/// Outcome of one tick.
#[derive(Debug, Default)]
pub struct PreloadReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, CacheError)>,
    /// Candidates not started this tick: resident, unknown, or over the cap.
    pub skipped: usize,
}

struct PreloadState {
    candidates: HashMap<String, f64>,
    strategy: PreloadStrategy,
    requests: u64,
    successes: u64,
    failures: u64,
    total_time: Duration,
}

pub struct ModelPreloader {
    cache: ModelCache,
    state: Mutex<PreloadState>,
    service: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ModelPreloader {
    pub fn new(cache: ModelCache, strategy: PreloadStrategy) -> Self {
        Self {
            cache,
            state: Mutex::new(PreloadState {
                candidates: HashMap::new(),
                strategy,
                requests: 0,
                successes: 0,
                failures: 0,
                total_time: Duration::ZERO,
            }),
            service: Mutex::new(None),
        }
    }

    /// Add or re-prioritise a candidate. Priority is clamped to `[0, 1]`.
    pub fn add_preload_candidate(&self, model_id: &str, priority: f64) {
        let priority = if priority.is_nan() { 0.0 } else { priority.clamp(0.0, 1.0) };
        self.state.lock().candidates.insert(model_id.to_string(), priority);
    }

    pub fn remove_preload_candidate(&self, model_id: &str) -> bool {
        self.state.lock().candidates.remove(model_id).is_some()
    }

    /// Candidates, highest priority first.
    pub fn candidates(&self) -> Vec<(String, f64)> {
        let state = self.state.lock();
        let mut list: Vec<(String, f64)> = state
            .candidates
            .iter()
            .map(|(id, p)| (id.clone(), *p))
            .collect();
        list.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        list
    }

    pub fn set_preload_strategy(&self, strategy: PreloadStrategy) {
        self.state.lock().strategy = strategy;
    }

    pub fn strategy(&self) -> PreloadStrategy {
        self.state.lock().strategy
    }

    /// Load up to the strategy's per-tick cap of non-resident candidates.
    ///
    /// Each load is awaited for at most the cache's load timeout; one that
    /// runs longer is reported as failed with `LoadTimedOut`.
    pub async fn preload_tick(&self) -> PreloadReport {
        let (wanted, limit) = {
            let state = self.state.lock();
            (state.candidates.len(), state.strategy.max_per_tick())
        };
        let ids: Vec<String> = self
            .candidates()
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| !self.cache.is_cached(id))
            .take(limit)
            .collect();

        let started = Instant::now();
        let pending = self.cache.preload(&ids);
        let config = self.cache.config();
        let outcomes = join_all(pending.iter().map(|p| async move {
            let outcome = p.wait_timeout(config.load_timeout).await;
            if matches!(outcome, Err(CacheError::LoadTimedOut { .. }))
                && config.timeout_behavior == TimeoutBehavior::Cancel
            {
                p.cancel();
            }
            outcome
        }))
        .await;
        let elapsed = started.elapsed();

        let mut report = PreloadReport {
            skipped: wanted.saturating_sub(pending.len()),
            ..PreloadReport::default()
        };
        for (load, outcome) in pending.iter().zip(outcomes) {
            match outcome {
                Ok(_) => report.loaded.push(load.model_id().to_string()),
                Err(e) => report.failed.push((load.model_id().to_string(), e)),
            }
        }

        {
            let mut state = self.state.lock();
            state.requests += pending.len() as u64;
            state.successes += report.loaded.len() as u64;
            state.failures += report.failed.len() as u64;
            if !pending.is_empty() {
                state.total_time += elapsed;
            }
        }

        if !pending.is_empty() {
            tracing::info!(
                loaded = report.loaded.len(),
                failed = report.failed.len(),
                elapsed_ms = elapsed.as_millis() as u64,
                "preload tick"
            );
        }
        report
    }

    /// Promote known, non-resident models whose predicted usage passes the
    /// strategy threshold to candidates, then run a tick.
    pub async fn analyze_and_preload(&self) -> PreloadReport {
        let threshold = self.strategy().threshold();
        let now = Instant::now();
        for info in self.cache.cached_models() {
            if info.is_loaded {
                continue;
            }
            let probability = predict_usage_probability(&info, now);
            if probability >= threshold {
                tracing::debug!(model_id = %info.model_id, probability, "preload candidate");
                let mut state = self.state.lock();
                let slot = state.candidates.entry(info.model_id.clone()).or_insert(0.0);
                *slot = slot.max(probability);
            }
        }
        self.preload_tick().await
    }

    /// Run `analyze_and_preload` every `interval` until stopped.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let mut service = self.service.lock();
        if service.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let preloader = Arc::clone(self);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        tracing::debug!("preloader: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        tokio::select! {
                            biased;
                            () = token.cancelled() => {
                                tracing::debug!("preloader: shutdown signal received during tick");
                                break;
                            }
                            _ = preloader.analyze_and_preload() => {}
                        }
                    }
                }
            }
        });
        *service = Some((shutdown, handle));
    }

    /// Stop the background service and wait for it to exit.
    pub async fn stop(&self) {
        let service = self.service.lock().take();
        if let Some((shutdown, handle)) = service {
            shutdown.cancel();
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.service.lock().is_some()
    }

    pub fn stats(&self) -> PreloadStats {
        let cache_hits_from_preload = self.cache.stats().preload_hits;
        let state = self.state.lock();
        PreloadStats {
            preload_requests: state.requests,
            successful_preloads: state.successes,
            failed_preloads: state.failures,
            cache_hits_from_preload,
            preload_effectiveness: if state.successes > 0 {
                (cache_hits_from_preload as f64 / state.successes as f64).min(1.0)
            } else {
                0.0
            },
            avg_preload_time: mean_duration(state.total_time, state.requests),
        }
    }
}
