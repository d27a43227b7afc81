//! Hot reload: swap a resident model for its newly activated revision.
//!
//! Every strategy funnels through the cache's `evict` and `load_sync`
//! primitives. Graceful reloads first close a [`DrainGate`] on the entry and
//! wait, bounded, for outstanding leases to drop; new callers queue behind
//! the gate until the swap is done. Immediate reloads skip the wait.
//!
//! [`DrainGate`]: super::cache::DrainGate

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::cache::{CacheError, ModelCache};
use super::version::{sha256_file, ModelVersion, VersionManager};
use crate::telemetry::{mean_duration, metrics};

#[derive(Error, Debug)]
pub enum ReloadError {
    #[error("No active version registered for {0}")]
    NoActiveVersion(String),

    #[error("Reload already in progress for {0}")]
    ReloadInProgress(String),

    #[error("Timed out draining in-flight requests for {0}")]
    DrainTimeout(String),

    #[error("Checksum mismatch for {model_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        model_id: String,
        expected: String,
        actual: String,
    },

    #[error("Reload window for {0} has passed")]
    WindowExpired(String),

    #[error("No reload window scheduled for {0}")]
    NotScheduled(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HotReloadStrategy {
    /// Evict and reload now; outstanding leases keep the old handle alive.
    Immediate,
    /// Drain outstanding leases (bounded) before swapping.
    #[default]
    Graceful,
    /// Swap gracefully inside a caller-supplied window.
    Scheduled,
}

impl std::str::FromStr for HotReloadStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "immediate" => Ok(Self::Immediate),
            "graceful" => Ok(Self::Graceful),
            "scheduled" => Ok(Self::Scheduled),
            other => Err(format!("unknown hot reload strategy: {other}")),
        }
    }
}

/// Half-open window `[start, end)` in which a scheduled reload may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl ReloadWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// A window opening now and lasting `length`.
    pub fn starting_now(length: Duration) -> Self {
        let start = Utc::now();
        let length = chrono::Duration::from_std(length).unwrap_or(chrono::Duration::MAX);
        Self {
            start,
            end: start.checked_add_signed(length).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    pub fn has_passed(&self, at: DateTime<Utc>) -> bool {
        at >= self.end
    }
}

#[derive(Debug, Clone)]
pub struct HotReloadConfig {
    pub strategy: HotReloadStrategy,
    /// Longest a graceful reload waits for leases to drop.
    pub drain_timeout: Duration,
    pub poll_interval: Duration,
    /// Compare the new revision's file against its recorded checksum first.
    pub verify_checksums: bool,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            strategy: HotReloadStrategy::Graceful,
            drain_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(10),
            verify_checksums: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The resident entry now holds `version`.
    Reloaded { version: String, drain_wait: Duration },
    /// The model was not resident; only its known path changed.
    PathUpdated { version: String },
    /// Deferred to the scheduled window.
    Scheduled { window: ReloadWindow },
}

#[derive(Debug, Clone, Serialize)]
pub struct HotReloadStats {
    pub total_reload_attempts: u64,
    pub successful_reloads: u64,
    pub failed_reloads: u64,
    pub avg_reload_time: Duration,
    pub monitored_models: usize,
    pub pending_scheduled: usize,
}

pub type HotReloadCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

struct ReloadState {
    config: HotReloadConfig,
    /// Watched ids and the version last applied to each.
    watched: HashMap<String, Option<String>>,
    scheduled: HashMap<String, ReloadWindow>,
    in_progress: HashSet<String>,
    attempts: u64,
    successes: u64,
    failures: u64,
    total_time: Duration,
}

/// Clears the in-progress mark on drop.
struct ReloadSlot<'a> {
    reloader: &'a HotReloader,
    model_id: String,
}

impl Drop for ReloadSlot<'_> {
    fn drop(&mut self) {
        self.reloader.state.lock().in_progress.remove(&self.model_id);
    }
}

pub struct HotReloader {
    cache: ModelCache,
    versions: Arc<VersionManager>,
    state: Mutex<ReloadState>,
    callbacks: RwLock<Vec<(String, HotReloadCallback)>>,
    monitor: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HotReloader {
    pub fn new(cache: ModelCache, versions: Arc<VersionManager>, config: HotReloadConfig) -> Self {
        Self {
            cache,
            versions,
            state: Mutex::new(ReloadState {
                config,
                watched: HashMap::new(),
                scheduled: HashMap::new(),
                in_progress: HashSet::new(),
                attempts: 0,
                successes: 0,
                failures: 0,
                total_time: Duration::ZERO,
            }),
            callbacks: RwLock::new(Vec::new()),
            monitor: Mutex::new(None),
        }
    }

    pub fn set_hot_reload_strategy(&self, strategy: HotReloadStrategy) {
        self.state.lock().config.strategy = strategy;
    }

    pub fn strategy(&self) -> HotReloadStrategy {
        self.state.lock().config.strategy
    }

    /// Register a callback run after every reload attempt. A callback with
    /// the same name is replaced.
    pub fn register_hot_reload_callback<F>(&self, name: &str, callback: F)
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        let mut callbacks = self.callbacks.write();
        callbacks.retain(|(n, _)| n != name);
        callbacks.push((name.to_string(), Arc::new(callback)));
    }

    pub fn unregister_hot_reload_callback(&self, name: &str) -> bool {
        let mut callbacks = self.callbacks.write();
        let before = callbacks.len();
        callbacks.retain(|(n, _)| n != name);
        callbacks.len() != before
    }

    /// Watch a model for activation of a new version. The currently active
    /// version counts as already applied.
    pub fn watch(&self, model_id: &str) {
        let current = self.versions.get_active_version(model_id).map(|v| v.version);
        self.state.lock().watched.insert(model_id.to_string(), current);
    }

    pub fn unwatch(&self, model_id: &str) -> bool {
        self.state.lock().watched.remove(model_id).is_some()
    }

    /// Allow a scheduled reload of `model_id` inside `window`.
    pub fn schedule(&self, model_id: &str, window: ReloadWindow) {
        tracing::debug!(model_id, start = %window.start, end = %window.end, "reload scheduled");
        self.state.lock().scheduled.insert(model_id.to_string(), window);
    }

    /// Reload `model_id` to its active version using the current strategy.
    pub async fn trigger_hot_reload(&self, model_id: &str) -> Result<ReloadOutcome, ReloadError> {
        let strategy = self.strategy();
        if strategy != HotReloadStrategy::Scheduled {
            return self.reload_now(model_id, strategy).await;
        }

        let window = self.state.lock().scheduled.get(model_id).copied();
        let Some(window) = window else {
            return Err(ReloadError::NotScheduled(model_id.to_string()));
        };
        let now = Utc::now();
        if window.has_passed(now) {
            self.state.lock().scheduled.remove(model_id);
            return Err(ReloadError::WindowExpired(model_id.to_string()));
        }
        if !window.contains(now) {
            return Ok(ReloadOutcome::Scheduled { window });
        }
        self.state.lock().scheduled.remove(model_id);
        self.reload_now(model_id, HotReloadStrategy::Graceful).await
    }

    /// One watch-loop pass.
    ///
    /// Runs scheduled reloads whose window is open, drops windows that have
    /// passed, and reloads watched models whose active version changed.
    /// Under the scheduled strategy changed models wait for their window.
    pub async fn run_once(&self) -> Vec<(String, Result<ReloadOutcome, ReloadError>)> {
        let now = Utc::now();
        let (due, expired, changed) = {
            let mut state = self.state.lock();
            let due: Vec<String> = state
                .scheduled
                .iter()
                .filter(|(_, w)| w.contains(now))
                .map(|(id, _)| id.clone())
                .collect();
            let expired: Vec<String> = state
                .scheduled
                .iter()
                .filter(|(_, w)| w.has_passed(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired {
                state.scheduled.remove(id);
            }

            let changed: Vec<String> = if state.config.strategy == HotReloadStrategy::Scheduled {
                Vec::new()
            } else {
                state
                    .watched
                    .iter()
                    .filter(|(id, applied)| {
                        let active = self.versions.get_active_version(id).map(|v| v.version);
                        active.is_some() && active != **applied && !due.contains(id)
                    })
                    .map(|(id, _)| id.clone())
                    .collect()
            };
            (due, expired, changed)
        };

        let mut results = Vec::new();
        for id in expired {
            tracing::warn!(model_id = %id, "reload window passed before the reload ran");
            results.push((id.clone(), Err(ReloadError::WindowExpired(id))));
        }
        for id in due {
            self.state.lock().scheduled.remove(&id);
            let outcome = self.reload_now(&id, HotReloadStrategy::Graceful).await;
            results.push((id, outcome));
        }
        for id in changed {
            let outcome = self.trigger_hot_reload(&id).await;
            results.push((id, outcome));
        }
        results
    }

    /// Poll every `interval` until `stop_monitoring`.
    pub fn start_monitoring(self: &Arc<Self>, interval: Duration) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let reloader = Arc::clone(self);
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        tracing::debug!("hot reload monitor: shutdown signal received");
                        break;
                    }
                    _ = ticker.tick() => {
                        reloader.run_once().await;
                    }
                }
            }
        });
        *monitor = Some((shutdown, handle));
        tracing::info!(interval_ms = interval.as_millis() as u64, "hot reload monitoring started");
    }

    pub async fn stop_monitoring(&self) {
        let monitor = self.monitor.lock().take();
        if let Some((shutdown, handle)) = monitor {
            shutdown.cancel();
            let _ = handle.await;
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    pub fn stats(&self) -> HotReloadStats {
        let state = self.state.lock();
        HotReloadStats {
            total_reload_attempts: state.attempts,
            successful_reloads: state.successes,
            failed_reloads: state.failures,
            avg_reload_time: mean_duration(state.total_time, state.attempts),
            monitored_models: state.watched.len(),
            pending_scheduled: state.scheduled.len(),
        }
    }

    async fn reload_now(
        &self,
        model_id: &str,
        strategy: HotReloadStrategy,
    ) -> Result<ReloadOutcome, ReloadError> {
        let _slot = self.claim(model_id)?;
        let started = Instant::now();

        let result = match self.versions.get_active_version(model_id) {
            Some(version) => self.swap(model_id, &version, strategy).await,
            None => Err(ReloadError::NoActiveVersion(model_id.to_string())),
        };
        let elapsed = started.elapsed();

        {
            let mut state = self.state.lock();
            state.attempts += 1;
            state.total_time += elapsed;
            match &result {
                Ok(_) => state.successes += 1,
                Err(_) => state.failures += 1,
            }
        }
        metrics::record_reload(result.is_ok());
        match &result {
            Ok(outcome) => tracing::info!(model_id, ?outcome, elapsed_ms = elapsed.as_millis() as u64, "hot reload finished"),
            Err(e) => tracing::warn!(model_id, error = %e, "hot reload failed"),
        }

        let callbacks: Vec<HotReloadCallback> =
            self.callbacks.read().iter().map(|(_, cb)| Arc::clone(cb)).collect();
        for callback in callbacks {
            callback(model_id, result.is_ok());
        }
        result
    }

    fn claim(&self, model_id: &str) -> Result<ReloadSlot<'_>, ReloadError> {
        let mut state = self.state.lock();
        if !state.in_progress.insert(model_id.to_string()) {
            return Err(ReloadError::ReloadInProgress(model_id.to_string()));
        }
        Ok(ReloadSlot {
            reloader: self,
            model_id: model_id.to_string(),
        })
    }

    async fn swap(
        &self,
        model_id: &str,
        version: &ModelVersion,
        strategy: HotReloadStrategy,
    ) -> Result<ReloadOutcome, ReloadError> {
        let (verify, drain_timeout) = {
            let state = self.state.lock();
            (state.config.verify_checksums, state.config.drain_timeout)
        };
        if verify && !version.checksum.is_empty() {
            self.verify_checksum(model_id, version).await?;
        }

        if !self.cache.is_cached(model_id) {
            self.cache.register(model_id, &version.model_path);
            self.mark_applied(model_id, &version.version);
            return Ok(ReloadOutcome::PathUpdated {
                version: version.version.clone(),
            });
        }

        let mut drain_wait = Duration::ZERO;
        let gate = match strategy {
            HotReloadStrategy::Immediate => None,
            HotReloadStrategy::Graceful | HotReloadStrategy::Scheduled => {
                let gate = self.cache.begin_drain(model_id)?;
                let wait_started = Instant::now();
                if gate.wait_idle(drain_timeout).await.is_err() {
                    return Err(ReloadError::DrainTimeout(model_id.to_string()));
                }
                drain_wait = wait_started.elapsed();
                Some(gate)
            }
        };

        match self.cache.evict(model_id) {
            Ok(()) | Err(CacheError::NotCached(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.cache.load_sync(model_id, &version.model_path).await?;
        drop(gate);

        self.mark_applied(model_id, &version.version);
        Ok(ReloadOutcome::Reloaded {
            version: version.version.clone(),
            drain_wait,
        })
    }

    async fn verify_checksum(&self, model_id: &str, version: &ModelVersion) -> Result<(), ReloadError> {
        let path = version.model_path.clone();
        let actual = tokio::task::spawn_blocking(move || sha256_file(path))
            .await
            .map_err(|e| std::io::Error::other(e.to_string()))??;
        if !actual.eq_ignore_ascii_case(&version.checksum) {
            return Err(ReloadError::ChecksumMismatch {
                model_id: model_id.to_string(),
                expected: version.checksum.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn mark_applied(&self, model_id: &str, version: &str) {
        let mut state = self.state.lock();
        if let Some(applied) = state.watched.get_mut(model_id) {
            *applied = Some(version.to_string());
        }
    }
}
