//! Model cache: maps model ids to loaded handles under a megabyte budget.
//!
//! All entry state sits behind one `parking_lot::RwLock`. A load reserves
//! budget and marks its entry loading under the write lock, runs the loader
//! with the lock released, then re-takes the lock to commit or roll back.
//! Requests for an id that is already loading share its [`PendingLoad`], so
//! the loader runs at most once per id at a time.
//!
//! Victim selection, eviction and reservation happen in a single critical
//! section; a competing load cannot claim the space freed for another.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::drain::{FlightGuard, FlightTracker};
use super::eviction::EvictionPolicy;
use super::loader::{LoadError, ModelDescriptor, ModelHandle, ModelLoader, ModelType};
use crate::memory::{Allocation, Arena};
use crate::telemetry::{mean_duration, metrics};

const MB: usize = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Insufficient cache space: {required_mb} MB required, capacity {capacity_mb} MB")]
    InsufficientCacheSpace { required_mb: u64, capacity_mb: u64 },

    #[error("Load of {model_id} timed out after {timeout_ms} ms")]
    LoadTimedOut { model_id: String, timeout_ms: u64 },

    #[error("Loader failed for {model_id}: {reason}")]
    LoaderFailed { model_id: String, reason: String },

    #[error("Load cancelled: {0}")]
    LoadCancelled(String),

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Model not resident: {0}")]
    NotCached(String),

    #[error("Arena allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Drain already in progress: {0}")]
    DrainInProgress(String),

    #[error("Drain timed out: {0}")]
    DrainTimeout(String),
}

fn loader_failed(model_id: &str, error: LoadError) -> CacheError {
    CacheError::LoaderFailed {
        model_id: model_id.to_string(),
        reason: error.to_string(),
    }
}

/// What happens to the background load when a waiter times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutBehavior {
    /// Keep loading; a later lookup finds the model resident.
    #[default]
    Continue,
    /// Cancel the load and release its reservation.
    Cancel,
}

impl std::str::FromStr for TimeoutBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "cancel" => Ok(Self::Cancel),
            other => Err(format!("unknown timeout behavior: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity_mb: u64,
    /// Bound on how long `load_sync`, `get_or_load` and preload ticks wait for a load.
    pub load_timeout: Duration,
    pub timeout_behavior: TimeoutBehavior,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_mb: 4096,
            load_timeout: Duration::from_secs(300),
            timeout_behavior: TimeoutBehavior::Continue,
        }
    }
}

/// Per-entry metadata. An entry with `is_loaded == false` is known but evicted.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_id: String,
    pub model_path: String,
    pub model_type: ModelType,
    pub size_mb: u64,
    pub memory_requirement_mb: u64,
    /// When the current residency began.
    pub load_time: Option<Instant>,
    pub last_access: Instant,
    /// Monotonic tie-breaker for `last_access`.
    pub last_access_seq: u64,
    pub access_count: u64,
    pub is_loaded: bool,
    pub is_preloaded: bool,
    pub is_draining: bool,
    /// Caller-assigned priority in `[0, 1]`.
    pub priority: f64,
    /// How long the most recent load took.
    pub load_duration: Duration,
}

impl ModelInfo {
    pub fn new(model_id: &str, model_path: &str) -> Self {
        Self {
            model_id: model_id.to_string(),
            model_path: model_path.to_string(),
            model_type: ModelType::default(),
            size_mb: 0,
            memory_requirement_mb: 0,
            load_time: None,
            last_access: Instant::now(),
            last_access_seq: 0,
            access_count: 0,
            is_loaded: false,
            is_preloaded: false,
            is_draining: false,
            priority: 0.5,
            load_duration: Duration::ZERO,
        }
    }
}

/// Cache counters and occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct ModelCacheStats {
    pub total_models: usize,
    pub loaded_models: usize,
    pub loading_models: usize,
    pub capacity_mb: u64,
    pub used_mb: u64,
    /// Budget held by loads that have been admitted but not committed.
    pub reserved_mb: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hit_ratio: f64,
    pub evictions: u64,
    pub loads_completed: u64,
    pub loads_failed: u64,
    pub preload_hits: u64,
    pub avg_load_time: Duration,
    pub eviction_policy: String,
}

type LoadResult = Result<ModelHandle, CacheError>;

/// Observable state of a pending load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Loaded,
    Failed(CacheError),
}

/// Shared handle to one load attempt.
///
/// Every caller that asks for an id while it is loading receives a clone of
/// the same `PendingLoad`. Cancelling it cancels the load for all of them.
#[derive(Clone)]
pub struct PendingLoad {
    model_id: String,
    load_id: Uuid,
    result: watch::Receiver<Option<LoadResult>>,
    cancel: CancellationToken,
}

impl PendingLoad {
    fn ready(model_id: &str, handle: ModelHandle) -> Self {
        let (_tx, result) = watch::channel(Some(Ok(handle)));
        Self {
            model_id: model_id.to_string(),
            load_id: Uuid::nil(),
            result,
            cancel: CancellationToken::new(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn load_id(&self) -> Uuid {
        self.load_id
    }

    pub fn status(&self) -> LoadState {
        match &*self.result.borrow() {
            None => LoadState::Pending,
            Some(Ok(_)) => LoadState::Loaded,
            Some(Err(e)) => LoadState::Failed(e.clone()),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.result.borrow().is_some()
    }

    /// Wait for the load to finish.
    pub async fn wait(&self) -> LoadResult {
        let mut result = self.result.clone();
        let outcome = result
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|value| (*value).clone());
        // A closed channel without a result means the load task went away.
        outcome.unwrap_or_else(|| Err(CacheError::LoadCancelled(self.model_id.clone())))
    }

    /// Wait at most `timeout`; the load itself is left running.
    pub async fn wait_timeout(&self, timeout: Duration) -> LoadResult {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| CacheError::LoadTimedOut {
                model_id: self.model_id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// Block the current thread until the load finishes.
    ///
    /// For callers outside the async runtime; must not be called from a
    /// runtime worker thread.
    pub fn blocking_wait(&self) -> LoadResult {
        futures::executor::block_on(self.wait())
    }

    /// Request cancellation. Any reserved budget is released.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for PendingLoad {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingLoad")
            .field("model_id", &self.model_id)
            .field("load_id", &self.load_id)
            .field("state", &self.status())
            .finish()
    }
}

/// A handle plus an in-flight guard; graceful reloads wait for leases to drop.
pub struct ModelLease {
    model_id: String,
    handle: ModelHandle,
    _flight: FlightGuard,
}

impl ModelLease {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }
}

impl Deref for ModelLease {
    type Target = ModelHandle;

    fn deref(&self) -> &ModelHandle {
        &self.handle
    }
}

/// Marks an entry draining until dropped.
///
/// While the gate is held the entry is never chosen for eviction, and new
/// `get_or_load`/`acquire` callers for it wait for the gate to drop.
pub struct DrainGate {
    cache: ModelCache,
    model_id: String,
    gate_id: Uuid,
    release: watch::Sender<bool>,
}

impl DrainGate {
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Wait until every outstanding lease on the model has been dropped.
    pub async fn wait_idle(&self, timeout: Duration) -> Result<(), CacheError> {
        self.cache
            .inner
            .flights
            .drain(&self.model_id, timeout)
            .await
            .map_err(|e| {
                tracing::warn!(model_id = %self.model_id, error = %e, "drain timed out");
                CacheError::DrainTimeout(self.model_id.clone())
            })
    }
}

impl Drop for DrainGate {
    fn drop(&mut self) {
        self.cache.end_drain(&self.model_id, self.gate_id);
        self.release.send_replace(true);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoadOrigin {
    Demand,
    Preload,
}

struct DrainState {
    gate_id: Uuid,
    released: watch::Receiver<bool>,
}

struct CacheEntry {
    info: ModelInfo,
    handle: Option<ModelHandle>,
    loading: Option<PendingLoad>,
    allocation: Option<Allocation>,
    drain: Option<DrainState>,
    preload_claimed: bool,
}

impl CacheEntry {
    fn new(info: ModelInfo) -> Self {
        Self {
            info,
            handle: None,
            loading: None,
            allocation: None,
            drain: None,
            preload_claimed: false,
        }
    }

    fn touch(&mut self, seq: u64) {
        self.info.last_access = Instant::now();
        self.info.last_access_seq = seq;
        self.info.access_count += 1;
    }

    /// True the first time a demand lookup lands on a preloaded residency.
    fn claim_preload(&mut self) -> bool {
        if self.info.is_preloaded && !self.preload_claimed {
            self.preload_claimed = true;
            return true;
        }
        false
    }

    fn owns_load(&self, load_id: Uuid) -> bool {
        self.loading.as_ref().is_some_and(|p| p.load_id == load_id)
    }
}

struct Admission {
    required_mb: u64,
    allocation: Option<Allocation>,
}

/// Why no set of victims can make room for a load.
enum AdmissionShortfall {
    Budget,
    Arena,
}

enum Lookup {
    Hit(ModelHandle),
    Draining(watch::Receiver<bool>),
    Miss,
}

struct CacheState {
    entries: HashMap<String, CacheEntry>,
    policy: Arc<dyn EvictionPolicy>,
    capacity_mb: u64,
    used_mb: u64,
    reserved_mb: u64,
    access_seq: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    loads_completed: u64,
    loads_failed: u64,
    preload_hits: u64,
    total_load_time: Duration,
}

impl CacheState {
    fn next_seq(&mut self) -> u64 {
        self.access_seq += 1;
        self.access_seq
    }

    fn owns_load(&self, model_id: &str, load_id: Uuid) -> bool {
        self.entries
            .get(model_id)
            .is_some_and(|e| e.owns_load(load_id))
    }

    /// Resident, non-draining entries.
    fn eviction_candidates(&self) -> Vec<ModelInfo> {
        self.entries
            .values()
            .filter(|e| e.handle.is_some() && e.drain.is_none())
            .map(|e| e.info.clone())
            .collect()
    }

    /// Ask the policy which resident, non-draining entries to drop.
    ///
    /// Returns the victims the policy named that really are candidates, and
    /// the megabytes they would free.
    fn plan_eviction(&self, need_mb: u64) -> (Vec<String>, u64) {
        let candidates = self.eviction_candidates();
        let mut freed_mb = 0;
        let mut victims = Vec::new();
        for id in self.policy.select_victims(&candidates, need_mb) {
            if victims.contains(&id) {
                continue;
            }
            if let Some(c) = candidates.iter().find(|c| c.model_id == id) {
                freed_mb += c.memory_requirement_mb;
                victims.push(id);
            }
        }
        (victims, freed_mb)
    }

    /// Victims for a load needing `need_mb` of budget and, when arena
    /// backed, `arena_bytes` of contiguous arena space.
    ///
    /// Walks the policy's full eviction order and stops at the shortest
    /// prefix that satisfies both. Nothing is evicted here; `None` means no
    /// prefix works and the load must fail without evicting anything.
    fn plan_admission(
        &self,
        need_mb: u64,
        arena: Option<(&Arena, usize)>,
    ) -> Result<(Vec<String>, u64), AdmissionShortfall> {
        let fits = |victims: &[String]| match arena {
            Some((arena, bytes)) => {
                let released: Vec<usize> = victims
                    .iter()
                    .filter_map(|id| self.entries.get(id)?.allocation.map(|a| a.offset()))
                    .collect();
                arena.fits_after_release(bytes, &released)
            }
            None => true,
        };

        let mut victims = Vec::new();
        let mut freed_mb = 0;
        if fits(&victims) && need_mb == 0 {
            return Ok((victims, freed_mb));
        }

        let candidates = self.eviction_candidates();
        for id in self.policy.select_victims(&candidates, u64::MAX) {
            if victims.contains(&id) {
                continue;
            }
            let Some(c) = candidates.iter().find(|c| c.model_id == id) else {
                continue;
            };
            freed_mb += c.memory_requirement_mb;
            victims.push(id);
            if freed_mb >= need_mb && fits(&victims) {
                return Ok((victims, freed_mb));
            }
        }

        if freed_mb >= need_mb {
            Err(AdmissionShortfall::Arena)
        } else {
            Err(AdmissionShortfall::Budget)
        }
    }

    /// Drop residency but keep metadata.
    fn evict_resident(&mut self, model_id: &str, arena: Option<&Arena>) -> Option<ModelHandle> {
        let entry = self.entries.get_mut(model_id)?;
        let handle = entry.handle.take()?;
        entry.info.is_loaded = false;
        entry.info.is_preloaded = false;
        entry.info.load_time = None;
        self.used_mb = self.used_mb.saturating_sub(entry.info.memory_requirement_mb);

        if let (Some(arena), Some(allocation)) = (arena, entry.allocation.take()) {
            if let Err(e) = arena.deallocate(allocation) {
                tracing::warn!(model_id, error = %e, "arena release failed");
            }
        }
        Some(handle)
    }
}

struct Inner {
    state: RwLock<CacheState>,
    config: CacheConfig,
    loader: Arc<dyn ModelLoader>,
    arena: Option<Arc<Arena>>,
    flights: FlightTracker,
}

/// Resource-bounded model cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<Inner>,
}

impl ModelCache {
    pub fn new(
        config: CacheConfig,
        loader: Arc<dyn ModelLoader>,
        policy: Arc<dyn EvictionPolicy>,
    ) -> Self {
        Self::build(config, loader, policy, None)
    }

    /// Like [`ModelCache::new`], but every resident model also holds an
    /// allocation of its memory requirement in `arena`.
    pub fn with_arena(
        config: CacheConfig,
        loader: Arc<dyn ModelLoader>,
        policy: Arc<dyn EvictionPolicy>,
        arena: Arc<Arena>,
    ) -> Self {
        Self::build(config, loader, policy, Some(arena))
    }

    fn build(
        config: CacheConfig,
        loader: Arc<dyn ModelLoader>,
        policy: Arc<dyn EvictionPolicy>,
        arena: Option<Arc<Arena>>,
    ) -> Self {
        tracing::debug!(capacity_mb = config.capacity_mb, policy = policy.name(), "model cache created");
        let state = CacheState {
            entries: HashMap::new(),
            policy,
            capacity_mb: config.capacity_mb,
            used_mb: 0,
            reserved_mb: 0,
            access_seq: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            loads_completed: 0,
            loads_failed: 0,
            preload_hits: 0,
            total_load_time: Duration::ZERO,
        };
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(state),
                config,
                loader,
                arena,
                flights: FlightTracker::new(),
            }),
        }
    }

    /// Make an id known without loading it. Returns false if it was already
    /// known; a non-resident entry still picks up the new path.
    pub fn register(&self, model_id: &str, model_path: &str) -> bool {
        let mut state = self.inner.state.write();
        match state.entries.entry(model_id.to_string()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.handle.is_none() && entry.loading.is_none() {
                    entry.info.model_path = model_path.to_string();
                }
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(ModelInfo::new(model_id, model_path)));
                true
            }
        }
    }

    /// Start loading and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn load_async(&self, model_id: &str, model_path: &str) -> Result<PendingLoad, CacheError> {
        self.start_load(model_id, Some(model_path), LoadOrigin::Demand)
    }

    /// Load and wait for the outcome, bounded by the configured load timeout.
    pub async fn load_sync(&self, model_id: &str, model_path: &str) -> LoadResult {
        let pending = self.load_async(model_id, model_path)?;
        self.await_pending(&pending).await
    }

    /// Return the resident handle, loading it on a miss.
    ///
    /// `model_path` may be omitted for ids the cache already knows.
    pub async fn get_or_load(&self, model_id: &str, model_path: Option<&str>) -> LoadResult {
        loop {
            match self.lookup(model_id) {
                Lookup::Hit(handle) => return Ok(handle),
                Lookup::Draining(mut released) => {
                    let _ = released.wait_for(|done| *done).await;
                }
                Lookup::Miss => break,
            }
        }

        let pending = self.start_load(model_id, model_path, LoadOrigin::Demand)?;
        let handle = self.await_pending(&pending).await?;
        self.record_access(model_id);
        Ok(handle)
    }

    /// `get_or_load` that also registers the caller as in flight on the model.
    pub async fn acquire(&self, model_id: &str, model_path: Option<&str>) -> Result<ModelLease, CacheError> {
        loop {
            let handle = self.get_or_load(model_id, model_path).await?;
            let flight = self.inner.flights.track(model_id);
            // A drain that began before the guard was counted will not wait
            // for it, so back off and queue behind the gate instead.
            if !self.is_draining(model_id) {
                return Ok(ModelLease {
                    model_id: model_id.to_string(),
                    handle,
                    _flight: flight,
                });
            }
        }
    }

    /// Mark an entry draining. Fails if a drain is already underway.
    pub fn begin_drain(&self, model_id: &str) -> Result<DrainGate, CacheError> {
        let mut state = self.inner.state.write();
        let entry = state
            .entries
            .get_mut(model_id)
            .ok_or_else(|| CacheError::UnknownModel(model_id.to_string()))?;
        if entry.drain.is_some() {
            return Err(CacheError::DrainInProgress(model_id.to_string()));
        }

        let gate_id = Uuid::new_v4();
        let (release, released) = watch::channel(false);
        entry.drain = Some(DrainState { gate_id, released });
        entry.info.is_draining = true;
        tracing::debug!(model_id, "drain started");

        Ok(DrainGate {
            cache: self.clone(),
            model_id: model_id.to_string(),
            gate_id,
            release,
        })
    }

    fn end_drain(&self, model_id: &str, gate_id: Uuid) {
        let mut state = self.inner.state.write();
        if let Some(entry) = state.entries.get_mut(model_id) {
            if entry.drain.as_ref().is_some_and(|d| d.gate_id == gate_id) {
                entry.drain = None;
                entry.info.is_draining = false;
            }
        }
    }

    pub fn is_cached(&self, model_id: &str) -> bool {
        self.inner
            .state
            .read()
            .entries
            .get(model_id)
            .is_some_and(|e| e.handle.is_some())
    }

    pub fn is_draining(&self, model_id: &str) -> bool {
        self.inner
            .state
            .read()
            .entries
            .get(model_id)
            .is_some_and(|e| e.drain.is_some())
    }

    /// Drop residency but keep the entry as known-but-evicted.
    pub fn evict(&self, model_id: &str) -> Result<(), CacheError> {
        let (handle, freed_mb) = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            let freed_mb = state
                .entries
                .get(model_id)
                .map(|e| e.info.memory_requirement_mb)
                .ok_or_else(|| CacheError::UnknownModel(model_id.to_string()))?;
            let handle = state
                .evict_resident(model_id, self.inner.arena.as_deref())
                .ok_or_else(|| CacheError::NotCached(model_id.to_string()))?;
            state.evictions += 1;
            (handle, freed_mb)
        };

        tracing::info!(model_id, freed_mb, "model evicted");
        metrics::record_eviction(1, freed_mb);
        self.inner.loader.unload(handle);
        Ok(())
    }

    /// Forget an entry entirely, cancelling any in-flight load for it.
    pub fn unload(&self, model_id: &str) -> bool {
        let (removed, handle) = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            let handle = state.evict_resident(model_id, self.inner.arena.as_deref());
            (state.entries.remove(model_id), handle)
        };

        let Some(entry) = removed else {
            return false;
        };
        if let Some(pending) = entry.loading {
            pending.cancel();
        }
        if let Some(handle) = handle {
            self.inner.loader.unload(handle);
        }
        self.inner.flights.remove(model_id);
        tracing::info!(model_id, "model unloaded");
        true
    }

    /// Start background loads for every known, non-resident id in `model_ids`.
    ///
    /// Unknown ids are skipped. Preloads obey the same budget as demand loads.
    pub fn preload<S: AsRef<str>>(&self, model_ids: &[S]) -> Vec<PendingLoad> {
        model_ids
            .iter()
            .filter_map(|id| {
                let id = id.as_ref();
                if self.is_cached(id) {
                    return None;
                }
                match self.start_load(id, None, LoadOrigin::Preload) {
                    Ok(pending) => Some(pending),
                    Err(e) => {
                        tracing::debug!(model_id = id, error = %e, "preload skipped");
                        None
                    }
                }
            })
            .collect()
    }

    /// Set an entry's priority, clamped to `[0, 1]`.
    pub fn set_priority(&self, model_id: &str, priority: f64) -> Result<(), CacheError> {
        let mut state = self.inner.state.write();
        let entry = state
            .entries
            .get_mut(model_id)
            .ok_or_else(|| CacheError::UnknownModel(model_id.to_string()))?;
        entry.info.priority = if priority.is_nan() { 0.0 } else { priority.clamp(0.0, 1.0) };
        Ok(())
    }

    /// Change the capacity and evict by policy until residency fits it.
    ///
    /// Returns the number of entries evicted. Draining entries are never
    /// evicted here, so usage may stay above a very small target.
    pub fn optimize_cache_size(&self, target_mb: u64) -> usize {
        let (victims, freed_mb, handles) = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            state.capacity_mb = target_mb;

            let mut handles = Vec::new();
            let (victims, freed_mb) = if state.used_mb > target_mb {
                state.plan_eviction(state.used_mb - target_mb)
            } else {
                (Vec::new(), 0)
            };
            for id in &victims {
                if let Some(handle) = state.evict_resident(id, self.inner.arena.as_deref()) {
                    handles.push(handle);
                }
            }
            state.evictions += handles.len() as u64;
            (victims, freed_mb, handles)
        };

        let evicted = handles.len();
        if evicted > 0 {
            tracing::info!(target_mb, victims = ?victims, freed_mb, "cache resized");
            metrics::record_eviction(evicted, freed_mb);
        }
        self.release_handles(handles);
        evicted
    }

    /// Drop every entry and cancel every in-flight load. Counters are kept.
    pub fn clear(&self) {
        let (handles, pending) = {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            let ids: Vec<String> = state.entries.keys().cloned().collect();
            let handles: Vec<ModelHandle> = ids
                .iter()
                .filter_map(|id| state.evict_resident(id, self.inner.arena.as_deref()))
                .collect();
            let pending: Vec<PendingLoad> = state
                .entries
                .drain()
                .filter_map(|(_, entry)| entry.loading)
                .collect();
            (handles, pending)
        };

        for load in pending {
            load.cancel();
        }
        tracing::info!(released = handles.len(), "cache cleared");
        self.release_handles(handles);
    }

    pub fn set_eviction_policy(&self, policy: Arc<dyn EvictionPolicy>) {
        tracing::info!(policy = policy.name(), "eviction policy changed");
        self.inner.state.write().policy = policy;
    }

    pub fn model_info(&self, model_id: &str) -> Option<ModelInfo> {
        self.inner
            .state
            .read()
            .entries
            .get(model_id)
            .map(|e| e.info.clone())
    }

    /// Snapshot of every known entry, ordered by id.
    pub fn cached_models(&self) -> Vec<ModelInfo> {
        let state = self.inner.state.read();
        let mut infos: Vec<ModelInfo> = state.entries.values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        infos
    }

    pub fn capacity_mb(&self) -> u64 {
        self.inner.state.read().capacity_mb
    }

    pub fn used_mb(&self) -> u64 {
        self.inner.state.read().used_mb
    }

    /// Outstanding leases on a model.
    pub fn in_flight(&self, model_id: &str) -> u32 {
        self.inner.flights.in_flight_count(model_id)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn arena(&self) -> Option<&Arc<Arena>> {
        self.inner.arena.as_ref()
    }

    pub fn stats(&self) -> ModelCacheStats {
        let state = self.inner.state.read();
        let lookups = state.hits + state.misses;
        ModelCacheStats {
            total_models: state.entries.len(),
            loaded_models: state.entries.values().filter(|e| e.handle.is_some()).count(),
            loading_models: state.entries.values().filter(|e| e.loading.is_some()).count(),
            capacity_mb: state.capacity_mb,
            used_mb: state.used_mb,
            reserved_mb: state.reserved_mb,
            cache_hits: state.hits,
            cache_misses: state.misses,
            hit_ratio: if lookups > 0 { state.hits as f64 / lookups as f64 } else { 0.0 },
            evictions: state.evictions,
            loads_completed: state.loads_completed,
            loads_failed: state.loads_failed,
            preload_hits: state.preload_hits,
            avg_load_time: mean_duration(state.total_load_time, state.loads_completed),
            eviction_policy: state.policy.name().to_string(),
        }
    }

    fn lookup(&self, model_id: &str) -> Lookup {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        let seq = state.next_seq();

        let Some(entry) = state.entries.get_mut(model_id) else {
            state.misses += 1;
            metrics::record_cache_miss();
            return Lookup::Miss;
        };
        if let Some(drain) = &entry.drain {
            return Lookup::Draining(drain.released.clone());
        }
        let Some(handle) = entry.handle.clone() else {
            state.misses += 1;
            metrics::record_cache_miss();
            return Lookup::Miss;
        };

        entry.touch(seq);
        let preload_hit = entry.claim_preload();
        state.hits += 1;
        if preload_hit {
            state.preload_hits += 1;
        }
        metrics::record_cache_hit(preload_hit);
        Lookup::Hit(handle)
    }

    fn record_access(&self, model_id: &str) {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        let seq = state.next_seq();
        if let Some(entry) = state.entries.get_mut(model_id) {
            entry.touch(seq);
        }
    }

    async fn await_pending(&self, pending: &PendingLoad) -> LoadResult {
        let timeout = self.inner.config.load_timeout;
        match tokio::time::timeout(timeout, pending.wait()).await {
            Ok(result) => result,
            Err(_) => {
                let behavior = self.inner.config.timeout_behavior;
                if behavior == TimeoutBehavior::Cancel {
                    pending.cancel();
                    let mut state = self.inner.state.write();
                    if let Some(entry) = state.entries.get_mut(&pending.model_id) {
                        if entry.owns_load(pending.load_id) {
                            entry.loading = None;
                        }
                    }
                }
                tracing::warn!(
                    model_id = %pending.model_id,
                    load_id = %pending.load_id,
                    timeout_ms = timeout.as_millis() as u64,
                    ?behavior,
                    "load timed out"
                );
                Err(CacheError::LoadTimedOut {
                    model_id: pending.model_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    fn start_load(
        &self,
        model_id: &str,
        model_path: Option<&str>,
        origin: LoadOrigin,
    ) -> Result<PendingLoad, CacheError> {
        let mut state = self.inner.state.write();
        let entry = match state.entries.entry(model_id.to_string()) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let path = model_path.ok_or_else(|| CacheError::UnknownModel(model_id.to_string()))?;
                slot.insert(CacheEntry::new(ModelInfo::new(model_id, path)))
            }
        };

        if let Some(handle) = &entry.handle {
            return Ok(PendingLoad::ready(model_id, handle.clone()));
        }
        // A cancelled load is still unwinding; start over rather than join it.
        if let Some(pending) = entry.loading.as_ref().filter(|p| !p.cancel.is_cancelled()) {
            return Ok(pending.clone());
        }
        if let Some(path) = model_path {
            entry.info.model_path = path.to_string();
        }

        let (tx, result) = watch::channel(None);
        let pending = PendingLoad {
            model_id: model_id.to_string(),
            load_id: Uuid::new_v4(),
            result,
            cancel: CancellationToken::new(),
        };
        entry.loading = Some(pending.clone());
        let path = entry.info.model_path.clone();
        drop(state);

        tracing::debug!(model_id, load_id = %pending.load_id, path = %path, ?origin, "load started");
        tokio::spawn(self.clone().run_load(pending.clone(), path, origin, tx));
        Ok(pending)
    }

    async fn run_load(
        self,
        pending: PendingLoad,
        path: String,
        origin: LoadOrigin,
        tx: watch::Sender<Option<LoadResult>>,
    ) {
        let started = Instant::now();
        let result = self.perform_load(&pending, &path, origin, started).await;
        let elapsed = started.elapsed();
        metrics::record_load(elapsed, result.is_ok());

        match &result {
            Ok(_) => tracing::info!(
                model_id = %pending.model_id,
                load_id = %pending.load_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "model loaded"
            ),
            Err(e) => tracing::warn!(
                model_id = %pending.model_id,
                load_id = %pending.load_id,
                error = %e,
                "model load failed"
            ),
        }
        tx.send_replace(Some(result));
    }

    async fn perform_load(
        &self,
        pending: &PendingLoad,
        path: &str,
        origin: LoadOrigin,
        started: Instant,
    ) -> LoadResult {
        let model_id = pending.model_id.as_str();
        let loader = self.inner.loader.clone();

        let probed = tokio::select! {
            _ = pending.cancel.cancelled() => Err(CacheError::LoadCancelled(model_id.to_string())),
            probed = loader.probe(path) => probed.map_err(|e| loader_failed(model_id, e)),
        };
        let descriptor = match probed {
            Ok(descriptor) => descriptor,
            Err(e) => {
                self.abandon(pending, None);
                return Err(e);
            }
        };

        let mut victims = Vec::new();
        let admitted = self.admit(pending, &descriptor, &mut victims);
        self.release_handles(victims);
        let admission = match admitted {
            Ok(admission) => admission,
            Err(e) => {
                self.abandon(pending, None);
                return Err(e);
            }
        };

        let loaded = tokio::select! {
            _ = pending.cancel.cancelled() => Err(CacheError::LoadCancelled(model_id.to_string())),
            loaded = loader.load(path) => loaded.map_err(|e| loader_failed(model_id, e)),
        };
        match loaded {
            Ok(handle) => self.commit(pending, &descriptor, admission, handle, origin, started.elapsed()),
            Err(e) => {
                self.abandon(pending, Some(admission));
                Err(e)
            }
        }
    }

    /// Select, evict and reserve as one critical section.
    ///
    /// Evicted handles are pushed to `victims` for release once the lock is
    /// dropped. A request that cannot be admitted, whether over the whole
    /// capacity or unplaceable in the arena, evicts nothing.
    fn admit(
        &self,
        pending: &PendingLoad,
        descriptor: &ModelDescriptor,
        victims: &mut Vec<ModelHandle>,
    ) -> Result<Admission, CacheError> {
        let required_mb = descriptor.memory_requirement_mb;
        let mut guard = self.inner.state.write();
        let state = &mut *guard;

        if !state.owns_load(&pending.model_id, pending.load_id) {
            return Err(CacheError::LoadCancelled(pending.model_id.clone()));
        }
        let capacity_mb = state.capacity_mb;
        if required_mb > capacity_mb {
            return Err(CacheError::InsufficientCacheSpace { required_mb, capacity_mb });
        }

        let arena_request = match &self.inner.arena {
            Some(arena) if required_mb > 0 => {
                let bytes = usize::try_from(required_mb)
                    .ok()
                    .and_then(|mb| mb.checked_mul(MB))
                    .ok_or_else(|| {
                        CacheError::AllocationFailed(format!("{required_mb} MB does not fit in the address space"))
                    })?;
                Some((arena.as_ref(), bytes))
            }
            _ => None,
        };

        let committed_mb = state.used_mb + state.reserved_mb;
        let need_mb = committed_mb.saturating_add(required_mb).saturating_sub(capacity_mb);
        let (ids, freed_mb) = match state.plan_admission(need_mb, arena_request) {
            Ok(plan) => plan,
            Err(AdmissionShortfall::Budget) => {
                return Err(CacheError::InsufficientCacheSpace { required_mb, capacity_mb });
            }
            Err(AdmissionShortfall::Arena) => {
                let largest = arena_request.map_or(0, |(arena, _)| arena.stats().largest_free_block_bytes);
                tracing::warn!(model_id = %pending.model_id, required_mb, largest_free = largest, "no eviction frees enough contiguous arena space");
                return Err(CacheError::AllocationFailed(format!(
                    "{required_mb} MB cannot be placed contiguously, largest free block {largest} bytes"
                )));
            }
        };

        if !ids.is_empty() {
            for id in &ids {
                if let Some(handle) = state.evict_resident(id, self.inner.arena.as_deref()) {
                    victims.push(handle);
                }
            }
            state.evictions += ids.len() as u64;
            tracing::info!(
                model_id = %pending.model_id,
                victims = ?ids,
                freed_mb,
                policy = state.policy.name(),
                "evicted to admit load"
            );
            metrics::record_eviction(ids.len(), freed_mb);
        }

        let allocation = match arena_request {
            Some((arena, bytes)) => {
                let allocation = arena.allocate(bytes).map_err(|e| {
                    tracing::warn!(model_id = %pending.model_id, error = %e, "arena allocation failed");
                    CacheError::AllocationFailed(e.to_string())
                })?;
                Some(allocation)
            }
            None => None,
        };

        state.reserved_mb += required_mb;
        Ok(Admission { required_mb, allocation })
    }

    fn commit(
        &self,
        pending: &PendingLoad,
        descriptor: &ModelDescriptor,
        admission: Admission,
        handle: ModelHandle,
        origin: LoadOrigin,
        elapsed: Duration,
    ) -> LoadResult {
        let mut guard = self.inner.state.write();
        let state = &mut *guard;
        state.reserved_mb = state.reserved_mb.saturating_sub(admission.required_mb);
        let seq = state.next_seq();
        let capacity_mb = state.capacity_mb;
        // Capacity may have shrunk while the load ran.
        let fits = state.used_mb + admission.required_mb <= capacity_mb;

        let entry = state
            .entries
            .get_mut(&pending.model_id)
            .filter(|e| e.owns_load(pending.load_id));
        let failure = match entry {
            Some(entry) if fits => {
                entry.loading = None;
                entry.handle = Some(handle.clone());
                entry.allocation = admission.allocation;
                entry.preload_claimed = false;

                let now = Instant::now();
                let info = &mut entry.info;
                info.model_type = descriptor.model_type;
                info.size_mb = descriptor.size_mb;
                info.memory_requirement_mb = admission.required_mb;
                info.is_loaded = true;
                info.is_preloaded = origin == LoadOrigin::Preload;
                info.load_time = Some(now);
                info.load_duration = elapsed;
                info.last_access = now;
                info.last_access_seq = seq;

                state.used_mb += admission.required_mb;
                state.loads_completed += 1;
                state.total_load_time += elapsed;
                return Ok(handle);
            }
            Some(entry) => {
                entry.loading = None;
                CacheError::InsufficientCacheSpace { required_mb: admission.required_mb, capacity_mb }
            }
            None => CacheError::LoadCancelled(pending.model_id.clone()),
        };
        state.loads_failed += 1;
        drop(guard);

        self.release_allocation(admission.allocation);
        self.inner.loader.unload(handle);
        Err(failure)
    }

    /// Roll an entry back to unloaded and return any reservation.
    fn abandon(&self, pending: &PendingLoad, admission: Option<Admission>) {
        {
            let mut guard = self.inner.state.write();
            let state = &mut *guard;
            if let Some(admission) = &admission {
                state.reserved_mb = state.reserved_mb.saturating_sub(admission.required_mb);
            }
            if let Some(entry) = state.entries.get_mut(&pending.model_id) {
                if entry.owns_load(pending.load_id) {
                    entry.loading = None;
                }
            }
            state.loads_failed += 1;
        }
        if let Some(admission) = admission {
            self.release_allocation(admission.allocation);
        }
    }

    fn release_allocation(&self, allocation: Option<Allocation>) {
        if let (Some(arena), Some(allocation)) = (&self.inner.arena, allocation) {
            if let Err(e) = arena.deallocate(allocation) {
                tracing::warn!(error = %e, "arena release failed");
            }
        }
    }

    fn release_handles(&self, handles: Vec<ModelHandle>) {
        for handle in handles {
            self.inner.loader.unload(handle);
        }
    }
}

impl fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.read();
        f.debug_struct("ModelCache")
            .field("capacity_mb", &state.capacity_mb)
            .field("used_mb", &state.used_mb)
            .field("entries", &state.entries.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_pending_resolves_immediately() {
        let pending = PendingLoad::ready("m", ModelHandle::new(7u32));
        assert!(pending.is_finished());
        assert_eq!(pending.status(), LoadState::Loaded);
        let handle = pending.wait().await.unwrap();
        assert_eq!(handle.downcast_ref::<u32>(), Some(&7));
    }

    #[tokio::test]
    async fn dropped_sender_reads_as_cancelled() {
        let (tx, result) = watch::channel(None);
        let pending = PendingLoad {
            model_id: "m".into(),
            load_id: Uuid::new_v4(),
            result,
            cancel: CancellationToken::new(),
        };
        assert_eq!(pending.status(), LoadState::Pending);
        drop(tx);
        assert_eq!(pending.wait().await.unwrap_err(), CacheError::LoadCancelled("m".into()));
    }

    #[test]
    fn timeout_behavior_parses() {
        assert_eq!("Cancel".parse::<TimeoutBehavior>(), Ok(TimeoutBehavior::Cancel));
        assert_eq!("continue".parse::<TimeoutBehavior>(), Ok(TimeoutBehavior::Continue));
        assert!("abort".parse::<TimeoutBehavior>().is_err());
    }
}
