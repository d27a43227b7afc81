//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gg_cache::models::{
    CacheConfig, EvictionPolicy, LoadError, ModelCache, ModelDescriptor, ModelHandle, ModelLoader,
    ModelType, RecencyPolicy,
};

/// Default memory requirement for paths without an explicit size.
pub const DEFAULT_MB: u64 = 100;

/// What `FakeLoader::load` hands back.
#[derive(Debug)]
pub struct FakeModel {
    pub path: String,
    pub serial: usize,
}

/// Loader that never touches the filesystem.
///
/// Sizes, delays and failures are configured per path. Every call to
/// `load` and `unload` is counted.
#[derive(Default)]
pub struct FakeLoader {
    sizes: Mutex<HashMap<String, u64>>,
    delays: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    load_calls: Mutex<HashMap<String, usize>>,
    loads: AtomicUsize,
    unloads: AtomicUsize,
}

impl FakeLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_size(&self, path: &str, mb: u64) {
        self.sizes.lock().unwrap().insert(path.to_string(), mb);
    }

    pub fn set_delay(&self, path: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(path.to_string(), delay);
    }

    pub fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    pub fn recover(&self, path: &str) {
        self.failing.lock().unwrap().remove(path);
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn loads_of(&self, path: &str) -> usize {
        self.load_calls.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn unload_count(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn probe(&self, path: &str) -> Result<ModelDescriptor, LoadError> {
        let mb = self.sizes.lock().unwrap().get(path).copied().unwrap_or(DEFAULT_MB);
        Ok(ModelDescriptor {
            size_mb: mb,
            memory_requirement_mb: mb,
            model_type: ModelType::Local,
        })
    }

    async fn load(&self, path: &str) -> Result<ModelHandle, LoadError> {
        let serial = self.loads.fetch_add(1, Ordering::SeqCst);
        *self.load_calls.lock().unwrap().entry(path.to_string()).or_default() += 1;

        let delay = self.delays.lock().unwrap().get(path).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(path) {
            return Err(LoadError::Backend(format!("{path}: injected failure")));
        }
        Ok(ModelHandle::new(FakeModel {
            path: path.to_string(),
            serial,
        }))
    }

    fn unload(&self, handle: ModelHandle) {
        self.unloads.fetch_add(1, Ordering::SeqCst);
        drop(handle);
    }
}

pub fn path(id: &str) -> String {
    format!("models/{id}.bin")
}

pub fn cache_config(capacity_mb: u64) -> CacheConfig {
    CacheConfig {
        capacity_mb,
        load_timeout: Duration::from_secs(5),
        ..CacheConfig::default()
    }
}

pub fn recency_cache(capacity_mb: u64, loader: &Arc<FakeLoader>) -> ModelCache {
    cache_with(cache_config(capacity_mb), loader, Arc::new(RecencyPolicy))
}

pub fn cache_with(
    config: CacheConfig,
    loader: &Arc<FakeLoader>,
    policy: Arc<dyn EvictionPolicy>,
) -> ModelCache {
    let loader: Arc<dyn ModelLoader> = loader.clone();
    ModelCache::new(config, loader, policy)
}

/// Sum of memory requirements over resident entries.
pub fn resident_mb(cache: &ModelCache) -> u64 {
    cache
        .cached_models()
        .iter()
        .filter(|info| info.is_loaded)
        .map(|info| info.memory_requirement_mb)
        .sum()
}
