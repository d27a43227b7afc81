//! Arena allocator tests: first-fit reuse, tiling and coalescing.

use gg_cache::memory::{Allocation, Arena, ArenaConfig, ArenaError, BlockSnapshot};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MB: usize = 1024 * 1024;
const KB: usize = 1024;

fn arena_of(bytes: usize) -> Arena {
    Arena::new(ArenaConfig {
        size_bytes: bytes,
        ..ArenaConfig::default()
    })
}

/// Blocks must cover `[0, capacity)` with no gaps, no overlaps, and no two
/// free blocks side by side.
fn assert_tiles(arena: &Arena) -> Vec<BlockSnapshot> {
    let layout = arena.layout();
    let mut cursor = 0;
    for (i, block) in layout.iter().enumerate() {
        assert_eq!(block.offset, cursor, "gap or overlap at block {i}: {layout:?}");
        cursor += block.size;
        if i > 0 {
            assert!(
                layout[i - 1].in_use || block.in_use,
                "adjacent free blocks at {} and {}",
                layout[i - 1].offset,
                block.offset
            );
        }
    }
    assert_eq!(cursor, arena.capacity());
    layout
}

#[test]
fn test_freed_block_is_reused_first_fit() {
    let arena = Arena::new(ArenaConfig::with_size_mb(1024));

    let a = arena.allocate(300 * MB).unwrap();
    let b = arena.allocate(200 * MB).unwrap();
    let c = arena.allocate(300 * MB).unwrap();
    assert_eq!(a.offset(), 0);
    assert_eq!(b.offset(), 300 * MB);
    assert_eq!(c.offset(), 500 * MB);

    arena.deallocate(b).unwrap();
    let d = arena.allocate(150 * MB).unwrap();
    assert_eq!(d.offset(), b.offset(), "D must land in B's hole");

    let stats = arena.stats();
    assert_eq!(stats.free_size_mb(), 1024 - 300 - 300 - 150);
    assert_eq!(stats.used_size_mb(), 750);
    assert_eq!(stats.peak_usage_mb(), 800);
    assert_eq!(stats.allocation_count, 4);
    assert_eq!(stats.deallocation_count, 1);
    assert_tiles(&arena);
}

#[test]
fn test_new_arena_is_one_free_block() {
    let arena = arena_of(MB);
    let layout = assert_tiles(&arena);
    assert_eq!(layout.len(), 1);
    assert!(!layout[0].in_use);

    let stats = arena.stats();
    assert_eq!(stats.free_bytes, MB);
    assert_eq!(stats.largest_free_block_bytes, MB);
    assert_eq!(stats.fragmentation_ratio, 0.0);
}

#[test]
fn test_random_sequences_keep_tiling() {
    let mut rng = StdRng::seed_from_u64(0x6763_6163);
    let arena = arena_of(4 * MB);
    let mut live: Vec<Allocation> = Vec::new();

    for step in 0..3000 {
        let free_one = !live.is_empty() && rng.gen_bool(0.45);
        if free_one {
            let idx = rng.gen_range(0..live.len());
            let allocation = live.swap_remove(idx);
            arena.deallocate(allocation).unwrap();
        } else {
            let size = rng.gen_range(1..64 * KB);
            let result = if rng.gen_bool(0.2) {
                arena.allocate_aligned(size, 4096)
            } else {
                arena.allocate(size)
            };
            match result {
                Ok(allocation) => live.push(allocation),
                Err(ArenaError::AllocationFailed { .. }) => {}
                Err(e) => panic!("step {step}: unexpected error {e}"),
            }
        }

        let layout = assert_tiles(&arena);
        let used: usize = layout.iter().filter(|b| b.in_use).map(|b| b.size).sum();
        assert_eq!(used, arena.stats().used_bytes, "step {step}");
        assert_eq!(arena.live_allocations(), live.len());
    }

    for allocation in live.drain(..) {
        arena.deallocate(allocation).unwrap();
    }
    let layout = assert_tiles(&arena);
    assert_eq!(layout.len(), 1, "everything freed must coalesce back to one block");
}

#[test]
fn test_aligned_allocation_offsets() {
    let arena = arena_of(MB);
    let small = arena.allocate(10).unwrap();
    assert_eq!(small.offset(), 0);
    assert_eq!(small.size(), 32, "sizes round up to the default alignment");

    let page = arena.allocate_aligned(100, 4096).unwrap();
    assert_eq!(page.offset() % 4096, 0);
    assert_eq!(page.offset(), 4096);

    // The prefix gap before the aligned block stays allocatable.
    let filler = arena.allocate(64).unwrap();
    assert!(filler.offset() < page.offset());
    assert_tiles(&arena);
}

#[test]
fn test_invalid_requests_are_rejected() {
    let arena = arena_of(MB);
    assert_eq!(arena.allocate(0), Err(ArenaError::ZeroSize));
    assert_eq!(arena.allocate_aligned(64, 0), Err(ArenaError::InvalidAlignment(0)));
    assert_eq!(arena.allocate_aligned(64, 48), Err(ArenaError::InvalidAlignment(48)));
    assert_eq!(arena.deallocate_offset(128), Err(ArenaError::UnknownAllocation(128)));
}

#[test]
fn test_failure_reports_largest_free_block() {
    let arena = arena_of(MB);
    let a = arena.allocate(256 * KB).unwrap();
    let _b = arena.allocate(256 * KB).unwrap();
    let c = arena.allocate(256 * KB).unwrap();
    let _d = arena.allocate(256 * KB).unwrap();
    arena.deallocate(a).unwrap();
    arena.deallocate(c).unwrap();

    // Half the arena is free, but in two non-adjacent pieces.
    assert_eq!(arena.stats().free_bytes, 512 * KB);
    let err = arena.allocate(300 * KB).unwrap_err();
    assert_eq!(
        err,
        ArenaError::AllocationFailed {
            requested: 300 * KB,
            largest_free: 256 * KB
        }
    );
}

#[test]
fn test_oversized_request_fails_without_overflow() {
    let arena = arena_of(16 * MB);
    let err = arena.allocate(usize::MAX - 4).unwrap_err();
    assert_eq!(
        err,
        ArenaError::AllocationFailed {
            requested: usize::MAX - 4,
            largest_free: 16 * MB
        }
    );
    assert!(arena.allocate_aligned(usize::MAX, 4096).is_err());
    assert!(!arena.fits_after_release(usize::MAX - 4, &[]));

    assert_eq!(arena.live_allocations(), 0);
    assert_tiles(&arena);
}

#[test]
fn test_fits_after_release_merges_released_blocks() {
    let arena = arena_of(MB);
    let a = arena.allocate(256 * KB).unwrap();
    let b = arena.allocate(256 * KB).unwrap();
    let c = arena.allocate(256 * KB).unwrap();
    let _d = arena.allocate(256 * KB).unwrap();

    assert!(!arena.fits_after_release(300 * KB, &[]));
    // a and c are not adjacent; a and b are.
    assert!(!arena.fits_after_release(300 * KB, &[a.offset(), c.offset()]));
    assert!(arena.fits_after_release(300 * KB, &[a.offset(), b.offset()]));
    // Unknown offsets are ignored.
    assert!(!arena.fits_after_release(300 * KB, &[3]));

    // Nothing was actually freed.
    assert_eq!(arena.live_allocations(), 4);
}

#[test]
fn test_double_free_is_rejected() {
    let arena = arena_of(MB);
    let a = arena.allocate(KB).unwrap();
    arena.deallocate(a).unwrap();
    assert_eq!(arena.deallocate(a), Err(ArenaError::UnknownAllocation(a.offset())));
}

#[test]
fn test_batch_allocate_is_all_or_nothing() {
    let arena = arena_of(MB);
    let err = arena.batch_allocate(&[400 * KB, 400 * KB, 400 * KB]).unwrap_err();
    assert!(matches!(err, ArenaError::AllocationFailed { .. }));
    assert_eq!(arena.live_allocations(), 0);
    assert_eq!(arena.stats().used_bytes, 0);
    assert_eq!(assert_tiles(&arena).len(), 1);

    let ok = arena.batch_allocate(&[100 * KB, 200 * KB]).unwrap();
    assert_eq!(ok.len(), 2);
    arena.batch_deallocate(&ok).unwrap();
    assert_eq!(arena.live_allocations(), 0);
}

#[test]
fn test_fragmentation_ratio_counts_free_blocks() {
    let arena = Arena::new(ArenaConfig {
        size_bytes: MB,
        compaction_threshold: 0.3,
        ..ArenaConfig::default()
    });
    let blocks: Vec<Allocation> = (0..8).map(|_| arena.allocate(64 * KB).unwrap()).collect();
    assert!(!arena.needs_defragment());

    // Free every other block: 4 holes plus the tail.
    for allocation in blocks.iter().step_by(2) {
        arena.deallocate(*allocation).unwrap();
    }
    let stats = arena.stats();
    assert_eq!(stats.free_block_count, 5);
    assert!((stats.fragmentation_ratio - 0.8).abs() < 1e-9);
    assert!(arena.needs_defragment());

    // Merging cannot help while the live blocks stay put.
    assert_eq!(arena.defragment(), 0);

    for allocation in blocks.iter().skip(1).step_by(2) {
        arena.deallocate(*allocation).unwrap();
    }
    assert_eq!(arena.stats().free_block_count, 1);
    assert!(!arena.needs_defragment());
}

#[test]
fn test_memory_pressure_threshold() {
    let arena = Arena::new(ArenaConfig {
        size_bytes: MB,
        pressure_threshold: 0.75,
        ..ArenaConfig::default()
    });
    let a = arena.allocate(512 * KB).unwrap();
    assert!(!arena.is_memory_pressure());
    let _b = arena.allocate(256 * KB).unwrap();
    assert!(arena.is_memory_pressure());
    arena.deallocate(a).unwrap();
    assert!(!arena.is_memory_pressure());
}

#[test]
fn test_small_tail_is_absorbed() {
    // 970 rounds up to 992, leaving an 8-byte tail that cannot stand alone.
    let arena = Arena::new(ArenaConfig {
        size_bytes: 1000,
        ..ArenaConfig::default()
    });
    let a = arena.allocate(970).unwrap();
    assert_eq!(a.size(), 1000);
    assert_eq!(arena.stats().free_bytes, 0);
    assert_tiles(&arena);
}
