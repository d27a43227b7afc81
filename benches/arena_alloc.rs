//! Arena allocator benchmarks.
//!
//! Measures allocate/free cycles and the cost of coalescing under churn.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gg_cache::memory::{Arena, ArenaConfig};

const KB: usize = 1024;

fn bench_allocate_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_allocate_free");

    for size in [64, 4 * KB, 256 * KB] {
        let arena = Arena::new(ArenaConfig::with_size_mb(64));
        group.throughput(Throughput::Elements(1));
        group.bench_function(BenchmarkId::new("bytes", size), |b| {
            b.iter(|| {
                let allocation = arena.allocate(black_box(size)).unwrap();
                arena.deallocate(allocation).unwrap();
            })
        });
    }

    group.finish();
}

fn bench_fragmented_churn(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_fragmented_churn");

    for live in [16, 128, 1024] {
        group.throughput(Throughput::Elements(live as u64));
        group.bench_function(BenchmarkId::new("live_blocks", live), |b| {
            b.iter(|| {
                let arena = Arena::new(ArenaConfig::with_size_mb(64));
                let allocations: Vec<_> = (0..live)
                    .map(|i| arena.allocate(KB + (i % 7) * 96).unwrap())
                    .collect();

                // Free every other block first so later frees merge both sides.
                let (even, odd): (Vec<_>, Vec<_>) = allocations
                    .into_iter()
                    .enumerate()
                    .partition(|(i, _)| i % 2 == 0);
                for (_, allocation) in even.into_iter().chain(odd) {
                    arena.deallocate(allocation).unwrap();
                }
                black_box(arena.stats())
            })
        });
    }

    group.finish();
}

fn bench_batch_allocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena_batch_allocate");

    for count in [8, 64] {
        let sizes = vec![4 * KB; count];
        let arena = Arena::new(ArenaConfig::with_size_mb(64));
        group.throughput(Throughput::Elements(count as u64));
        group.bench_function(BenchmarkId::new("blocks", count), |b| {
            b.iter(|| {
                let allocations = arena.batch_allocate(black_box(&sizes)).unwrap();
                arena.batch_deallocate(&allocations).unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_allocate_free, bench_fragmented_churn, bench_batch_allocate);
criterion_main!(benches);
