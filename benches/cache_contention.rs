//! Model cache contention benchmarks.
//!
//! Many tasks hitting the same resident models, and churn under a budget
//! that forces eviction on every load.

use std::sync::Arc;

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::future::join_all;

use gg_cache::models::{
    CacheConfig, EvictionPolicyKind, LoadError, ModelCache, ModelDescriptor, ModelHandle,
    ModelLoader, ModelType,
};

/// Loader that returns immediately with a fixed footprint.
struct InstantLoader;

#[async_trait]
impl ModelLoader for InstantLoader {
    async fn probe(&self, _path: &str) -> Result<ModelDescriptor, LoadError> {
        Ok(ModelDescriptor {
            size_mb: 100,
            memory_requirement_mb: 100,
            model_type: ModelType::Local,
        })
    }

    async fn load(&self, path: &str) -> Result<ModelHandle, LoadError> {
        Ok(ModelHandle::new(path.to_string()))
    }

    fn unload(&self, handle: ModelHandle) {
        drop(handle);
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn cache(capacity_mb: u64, policy: EvictionPolicyKind) -> ModelCache {
    let config = CacheConfig {
        capacity_mb,
        ..CacheConfig::default()
    };
    ModelCache::new(config, Arc::new(InstantLoader), policy.build())
}

fn bench_concurrent_hits(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_concurrent_hits");
    let rt = runtime();

    for tasks in [8, 64, 256] {
        let cache = cache(1000, EvictionPolicyKind::Recency);
        rt.block_on(async {
            for i in 0..8 {
                cache.load_sync(&format!("m{i}"), &format!("models/m{i}.bin")).await.unwrap();
            }
        });

        group.throughput(Throughput::Elements(tasks as u64));
        group.bench_function(BenchmarkId::new("tasks", tasks), |b| {
            b.iter(|| {
                rt.block_on(async {
                    let handles = (0..tasks).map(|i| {
                        let cache = cache.clone();
                        tokio::spawn(async move { cache.get_or_load(&format!("m{}", i % 8), None).await })
                    });
                    for result in join_all(handles).await {
                        black_box(result.unwrap().unwrap());
                    }
                })
            })
        });
    }

    group.finish();
}

fn bench_eviction_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_eviction_churn");
    let rt = runtime();

    for policy in [EvictionPolicyKind::Recency, EvictionPolicyKind::Scored] {
        let cache = cache(300, policy);
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("policy", format!("{policy:?}")), |b| {
            let mut next = 0u64;
            b.iter(|| {
                let id = format!("m{}", next % 32);
                next += 1;
                rt.block_on(cache.get_or_load(&id, Some(&format!("models/{id}.bin"))))
                    .unwrap()
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_concurrent_hits, bench_eviction_churn);
criterion_main!(benches);
