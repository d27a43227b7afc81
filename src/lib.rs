//! GG-CACHE
//!
//! Resource-bounded model cache for the GG-CORE runtime. Keeps expensive
//! models resident within a fixed memory budget, evicts by recency or by a
//! usage score when the budget is exceeded, and replaces revisions at
//! runtime without disturbing in-flight users.
//!
//! # Components
//!
//! - [`memory::Arena`]: one contiguous reservation carved into aligned blocks
//! - [`memory::SessionManager`]: bounded session tracking with idle expiry
//! - [`models::ModelCache`]: budgeted, deduplicated model loading and eviction
//! - [`models::ModelPreloader`], [`models::VersionManager`],
//!   [`models::HotReloader`]: lifecycle on top of the cache
//!
//! Model bytes never pass through the cache. Loading and unloading are
//! delegated to an injected [`models::ModelLoader`].

pub mod config;
pub mod memory;
pub mod models;
pub mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use config::CoreConfig;
use memory::{Arena, SessionManager};
use models::{HotReloader, ModelCache, ModelLoader, ModelPreloader, VersionManager};
use telemetry::StatsExporter;

/// Snapshots kept by the runtime's exporter.
const STATS_HISTORY: usize = 120;

/// Upper bound on the session reaper period.
const MAX_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Every component wired from one [`CoreConfig`].
pub struct CacheRuntime {
    pub config: CoreConfig,
    pub arena: Arc<Arena>,
    pub sessions: Arc<SessionManager>,
    pub cache: ModelCache,
    pub preloader: Arc<ModelPreloader>,
    pub versions: Arc<VersionManager>,
    pub reloader: Arc<HotReloader>,
    pub exporter: Arc<StatsExporter>,
    tasks: Mutex<Option<(CancellationToken, Vec<JoinHandle<()>>)>>,
}

impl CacheRuntime {
    /// Build the runtime. Nothing runs until [`CacheRuntime::start`].
    pub fn new(config: CoreConfig, loader: Arc<dyn ModelLoader>) -> Self {
        let config = config.normalized();
        let arena = Arc::new(Arena::new(config.arena_config()));
        let sessions = Arc::new(SessionManager::new(config.session_config()));

        let policy = config.eviction_policy.build();
        let cache = if config.back_cache_with_arena {
            ModelCache::with_arena(config.cache_config(), loader, policy, Arc::clone(&arena))
        } else {
            ModelCache::new(config.cache_config(), loader, policy)
        };

        let preloader = Arc::new(ModelPreloader::new(cache.clone(), config.preload_strategy));
        let versions = Arc::new(VersionManager::new());
        let reloader = Arc::new(HotReloader::new(
            cache.clone(),
            Arc::clone(&versions),
            config.hot_reload_config(),
        ));
        let exporter = Arc::new(StatsExporter::new(cache.clone(), Arc::clone(&sessions), STATS_HISTORY));

        tracing::info!(
            capacity_mb = config.cache_capacity_mb,
            arena_mb = config.arena_size_mb,
            policy = ?config.eviction_policy,
            reload = ?config.hot_reload_strategy,
            "cache runtime created"
        );

        Self {
            config,
            arena,
            sessions,
            cache,
            preloader,
            versions,
            reloader,
            exporter,
            tasks: Mutex::new(None),
        }
    }

    /// Spawn the preloader, reload monitor, session reaper and stats
    /// exporter. Must be called inside a tokio runtime. A second call is a
    /// no-op until `shutdown`.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            return;
        }

        self.preloader
            .start(Duration::from_secs(self.config.preload_interval_secs));
        self.reloader
            .start_monitoring(Duration::from_secs(self.config.reload_poll_interval_secs));

        let cancel = CancellationToken::new();
        let reap_interval = Duration::from_secs(self.config.session_timeout_secs).min(MAX_REAP_INTERVAL);
        let handles = vec![
            Arc::clone(&self.sessions).spawn_reaper(reap_interval, cancel.clone()),
            Arc::clone(&self.exporter).spawn(
                Duration::from_secs(self.config.stats_interval_secs),
                cancel.clone(),
            ),
        ];
        *tasks = Some((cancel, handles));
        tracing::info!("cache runtime started");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Stop every background task and wait for them to exit. Resident
    /// models stay loaded.
    pub async fn shutdown(&self) {
        let tasks = self.tasks.lock().take();
        self.preloader.stop().await;
        self.reloader.stop_monitoring().await;

        if let Some((cancel, handles)) = tasks {
            cancel.cancel();
            for handle in futures::future::join_all(handles).await {
                if let Err(e) = handle {
                    tracing::warn!(error = %e, "background task ended abnormally");
                }
            }
        }
        tracing::info!("cache runtime stopped");
    }
}
