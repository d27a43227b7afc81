//! Recorders pushed through the `metrics` facade.
//!
//! No exporter is installed here; the embedding process picks one. Without a
//! recorder every call is a no-op.

use std::time::Duration;

use metrics::{counter, gauge, histogram};

use super::snapshot::StatsSnapshot;

pub fn record_cache_hit(preloaded: bool) {
    counter!("gg_cache_hits_total").increment(1);
    if preloaded {
        counter!("gg_cache_preload_hits_total").increment(1);
    }
}

pub fn record_cache_miss() {
    counter!("gg_cache_misses_total").increment(1);
}

/// One eviction decision: how many entries went and how much budget they freed.
pub fn record_eviction(victims: usize, freed_mb: u64) {
    counter!("gg_cache_evictions_total").increment(victims as u64);
    counter!("gg_cache_evicted_mb_total").increment(freed_mb);
}

pub fn record_load(elapsed: Duration, success: bool) {
    if success {
        counter!("gg_cache_loads_total").increment(1);
        histogram!("gg_cache_load_duration_seconds").record(elapsed.as_secs_f64());
    } else {
        counter!("gg_cache_load_failures_total").increment(1);
    }
}

pub fn record_reload(success: bool) {
    if success {
        counter!("gg_cache_reloads_total").increment(1);
    } else {
        counter!("gg_cache_reload_failures_total").increment(1);
    }
}

/// Publish a periodic snapshot as gauges.
pub fn record_snapshot(snapshot: &StatsSnapshot) {
    let cache = &snapshot.cache;
    gauge!("gg_cache_capacity_mb").set(cache.capacity_mb as f64);
    gauge!("gg_cache_used_mb").set(cache.used_mb as f64);
    gauge!("gg_cache_loaded_models").set(cache.loaded_models as f64);
    gauge!("gg_cache_hit_ratio").set(cache.hit_ratio);
    gauge!("gg_cache_avg_load_seconds").set(cache.avg_load_time.as_secs_f64());

    if let Some(arena) = &snapshot.arena {
        gauge!("gg_arena_used_bytes").set(arena.used_bytes as f64);
        gauge!("gg_arena_fragmentation_ratio").set(arena.fragmentation_ratio);
        gauge!("gg_arena_free_blocks").set(arena.free_block_count as f64);
    }

    let sessions = &snapshot.sessions;
    gauge!("gg_sessions_total").set(sessions.total_sessions as f64);
    gauge!("gg_sessions_memory_bytes").set(sessions.total_memory_usage_bytes as f64);
}
