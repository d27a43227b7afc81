//! End-to-end wiring: one config, every component, background tasks.

mod common;

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use common::{path, FakeLoader};
use gg_cache::config::CoreConfig;
use gg_cache::models::{EvictionPolicyKind, ModelLoader, ModelVersion, ReloadOutcome};
use gg_cache::CacheRuntime;

fn runtime(config: CoreConfig) -> (Arc<FakeLoader>, CacheRuntime) {
    let loader = FakeLoader::new();
    let dyn_loader: Arc<dyn ModelLoader> = loader.clone();
    (loader, CacheRuntime::new(config, dyn_loader))
}

fn small_config() -> CoreConfig {
    CoreConfig {
        cache_capacity_mb: 250,
        arena_size_mb: 256,
        stats_interval_secs: 1,
        ..CoreConfig::default()
    }
}

#[tokio::test]
async fn test_components_share_one_cache() {
    let (loader, rt) = runtime(small_config());

    rt.cache.load_sync("a", &path("a")).await.unwrap();
    rt.preloader.add_preload_candidate("b", 0.9);
    rt.cache.register("b", &path("b"));
    let report = rt.preloader.preload_tick().await;
    assert_eq!(report.loaded, vec!["b".to_string()]);
    assert_eq!(rt.cache.stats().loaded_models, 2);

    rt.versions
        .register(ModelVersion::new("a", "v2", "models/a-v2.bin").active())
        .unwrap();
    let outcome = rt.reloader.trigger_hot_reload("a").await.unwrap();
    assert!(matches!(outcome, ReloadOutcome::Reloaded { .. }));
    assert_eq!(loader.loads_of("models/a-v2.bin"), 1);
}

#[tokio::test]
async fn test_arena_backing_follows_config() {
    let (_, plain) = runtime(small_config());
    assert!(plain.cache.arena().is_none());

    let (_, backed) = runtime(CoreConfig {
        back_cache_with_arena: true,
        ..small_config()
    });
    backed.cache.load_sync("a", &path("a")).await.unwrap();
    let arena = backed.cache.arena().expect("arena-backed cache");
    assert_eq!(arena.live_allocations(), 1);
    assert_eq!(arena.stats().used_size_mb(), 100);
}

#[tokio::test]
async fn test_start_and_shutdown_background_tasks() {
    let (_, rt) = runtime(small_config());
    assert!(!rt.is_running());

    rt.start();
    rt.start();
    assert!(rt.is_running());
    assert!(rt.preloader.is_running());
    assert!(rt.reloader.is_monitoring());

    // The exporter's first tick fires immediately.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let latest = rt.exporter.latest().expect("snapshot recorded on start");
    assert_eq!(latest.cache.capacity_mb, 250);

    rt.shutdown().await;
    assert!(!rt.is_running());
    assert!(!rt.preloader.is_running());
    assert!(!rt.reloader.is_monitoring());
}

#[tokio::test]
async fn test_exporter_history_serializes() {
    let (_, rt) = runtime(CoreConfig {
        back_cache_with_arena: true,
        ..small_config()
    });
    rt.sessions.create("s1", Arc::new(()), 1024).unwrap();
    rt.cache.load_sync("a", &path("a")).await.unwrap();

    let snapshot = rt.exporter.record_snapshot();
    assert_eq!(snapshot.sessions.total_sessions, 1);
    assert!(snapshot.arena.is_some());

    let json: serde_json::Value = serde_json::from_str(&rt.exporter.to_json().unwrap()).unwrap();
    let history = json.as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["cache"]["loaded_models"], 1);
    assert!(history[0]["taken_at"].is_string());
}

#[tokio::test]
async fn test_runtime_from_toml_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("gg-cache.toml");
    let mut f = std::fs::File::create(&file).unwrap();
    writeln!(f, "cache_capacity_mb = 150\neviction_policy = \"scored\"\nalignment = 48").unwrap();
    drop(f);

    let config = CoreConfig::from_toml_file(&file).unwrap();
    assert_eq!(config.eviction_policy, EvictionPolicyKind::Scored);
    assert_eq!(config.alignment, 64);

    let (_, rt) = runtime(config);
    assert_eq!(rt.cache.stats().eviction_policy, "scored");
    rt.cache.load_sync("a", &path("a")).await.unwrap();
    rt.cache.load_sync("b", &path("b")).await.unwrap();
    assert_eq!(rt.cache.stats().loaded_models, 1);
}
