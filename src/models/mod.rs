//! Model management module for GG-CACHE.
//!
//! The cache and its eviction policies, the loader contract, and the
//! lifecycle managers layered on top: preloading, version tracking and hot
//! reload.

mod cache;
mod drain;
mod eviction;
mod loader;
mod preload;
mod reload;
mod version;

pub use cache::{
    CacheConfig, CacheError, DrainGate, LoadState, ModelCache, ModelCacheStats, ModelInfo,
    ModelLease, PendingLoad, TimeoutBehavior,
};
pub use drain::{DrainError, FlightGuard, FlightTracker};
pub use eviction::{
    predict_usage_probability, EvictionPolicy, EvictionPolicyKind, RecencyPolicy, ScoredPolicy,
    ScoringPeers, ScoringWeights, UsageScore,
};
pub use loader::{
    LoadError, MappedModel, MmapLoader, ModelDescriptor, ModelHandle, ModelLoader, ModelPath,
    ModelType,
};
pub use preload::{ModelPreloader, PreloadReport, PreloadStats, PreloadStrategy};
pub use reload::{
    HotReloadCallback, HotReloadConfig, HotReloadStats, HotReloadStrategy, HotReloader,
    ReloadError, ReloadOutcome, ReloadWindow,
};
pub use version::{sha256_file, ModelVersion, VersionError, VersionManager};
