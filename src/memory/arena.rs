//! Block arena allocator over a single pre-reserved region.
//!
//! Blocks are tracked as arena-relative `(offset, size)` pairs. Free blocks are
//! kept in a list that is re-sorted by offset before every merge pass, so no
//! two free blocks are ever left address-adjacent once control returns to the
//! caller. Free and used blocks together always tile `[0, size)` exactly.
//!
//! Offsets are aligned relative to the start of the region; the region itself
//! is assumed to start on a cache-line boundary.

use std::collections::BTreeMap;
use std::time::Instant;

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

/// Default allocation alignment in bytes.
pub const DEFAULT_ALIGNMENT: usize = 32;

const MB: usize = 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Allocation failed: requested {requested} bytes, largest free block {largest_free} bytes")]
    AllocationFailed { requested: usize, largest_free: usize },

    #[error("No live allocation at offset {0}")]
    UnknownAllocation(usize),

    #[error("Alignment must be a non-zero power of two, got {0}")]
    InvalidAlignment(usize),

    #[error("Cannot allocate zero bytes")]
    ZeroSize,
}

/// Configuration for the arena.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    pub size_bytes: usize,
    pub alignment: usize,
    /// Fragmentation ratio above which `needs_defragment` reports true.
    pub compaction_threshold: f64,
    /// Used/total ratio at which `is_memory_pressure` reports true.
    pub pressure_threshold: f64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            size_bytes: 512 * MB,
            alignment: DEFAULT_ALIGNMENT,
            compaction_threshold: 0.3,
            pressure_threshold: 0.9,
        }
    }
}

impl ArenaConfig {
    /// Arena of `size_mb` megabytes with default alignment and thresholds.
    pub fn with_size_mb(size_mb: usize) -> Self {
        Self {
            size_bytes: size_mb * MB,
            ..Self::default()
        }
    }
}

/// A live allocation handed out by the arena.
///
/// Carries no pointer: the caller owns "this range of the arena" until it is
/// passed back to [`Arena::deallocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    offset: usize,
    size: usize,
}

impl Allocation {
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Bytes reserved for this allocation (may exceed the request by padding).
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

#[derive(Debug, Clone)]
struct MemoryBlock {
    offset: usize,
    size: usize,
    alignment: usize,
    in_use: bool,
    last_used: Instant,
    ref_count: u32,
}

impl MemoryBlock {
    fn free(offset: usize, size: usize, alignment: usize) -> Self {
        Self {
            offset,
            size,
            alignment,
            in_use: false,
            last_used: Instant::now(),
            ref_count: 0,
        }
    }

    fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// One block in an address-ordered layout snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSnapshot {
    pub offset: usize,
    pub size: usize,
    pub alignment: usize,
    pub in_use: bool,
    pub ref_count: u32,
}

/// Arena usage statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ArenaStats {
    pub total_bytes: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub peak_bytes: usize,
    pub largest_free_block_bytes: usize,
    pub free_block_count: usize,
    /// `(free_blocks - 1) / free_blocks` when two or more free blocks exist.
    ///
    /// Counts blocks, not bytes: many tiny holes next to one huge hole score
    /// the same as equally sized holes.
    pub fragmentation_ratio: f64,
    pub allocation_count: u64,
    pub deallocation_count: u64,
}

impl ArenaStats {
    pub fn total_size_mb(&self) -> usize {
        self.total_bytes / MB
    }

    pub fn used_size_mb(&self) -> usize {
        self.used_bytes / MB
    }

    pub fn free_size_mb(&self) -> usize {
        self.free_bytes / MB
    }

    pub fn peak_usage_mb(&self) -> usize {
        self.peak_bytes / MB
    }

    pub fn largest_free_block_mb(&self) -> usize {
        self.largest_free_block_bytes / MB
    }
}

struct BlockTable {
    free: Vec<MemoryBlock>,
    used: BTreeMap<usize, MemoryBlock>,
    allocated_bytes: usize,
    peak_bytes: usize,
    allocation_count: u64,
    deallocation_count: u64,
}

/// First-fit block allocator with split and coalesce.
pub struct Arena {
    table: RwLock<BlockTable>,
    config: ArenaConfig,
}

impl Arena {
    /// Create an arena spanning `config.size_bytes` as one free block.
    ///
    /// A non power-of-two default alignment is rounded up to the next one.
    pub fn new(mut config: ArenaConfig) -> Self {
        config.alignment = config.alignment.max(1).next_power_of_two();
        let initial = MemoryBlock::free(0, config.size_bytes, config.alignment);
        let free = if config.size_bytes > 0 { vec![initial] } else { Vec::new() };

        tracing::debug!(size_bytes = config.size_bytes, alignment = config.alignment, "arena initialized");

        Self {
            table: RwLock::new(BlockTable {
                free,
                used: BTreeMap::new(),
                allocated_bytes: 0,
                peak_bytes: 0,
                allocation_count: 0,
                deallocation_count: 0,
            }),
            config,
        }
    }

    /// Allocate `size` bytes at the default alignment.
    pub fn allocate(&self, size: usize) -> Result<Allocation, ArenaError> {
        self.allocate_aligned(size, self.config.alignment)
    }

    /// Allocate `size` bytes whose offset is a multiple of `alignment`.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<Allocation, ArenaError> {
        validate_request(size, alignment)?;
        let mut table = self.table.write();
        self.allocate_locked(&mut table, size, alignment)
    }

    /// Allocate every size in `sizes`, or none of them.
    pub fn batch_allocate(&self, sizes: &[usize]) -> Result<Vec<Allocation>, ArenaError> {
        for &size in sizes {
            validate_request(size, self.config.alignment)?;
        }

        let mut table = self.table.write();
        let mut done = Vec::with_capacity(sizes.len());
        for &size in sizes {
            match self.allocate_locked(&mut table, size, self.config.alignment) {
                Ok(allocation) => done.push(allocation),
                Err(e) => {
                    for allocation in done {
                        // Just allocated under this same lock, so it is known.
                        let _ = Self::deallocate_locked(&mut table, allocation.offset);
                    }
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    /// Return an allocation to the arena and coalesce it with free neighbours.
    pub fn deallocate(&self, allocation: Allocation) -> Result<(), ArenaError> {
        self.deallocate_offset(allocation.offset)
    }

    /// Return the allocation starting at `offset`.
    pub fn deallocate_offset(&self, offset: usize) -> Result<(), ArenaError> {
        let mut table = self.table.write();
        Self::deallocate_locked(&mut table, offset)
    }

    /// Release every allocation in `allocations`; stops at the first unknown one.
    pub fn batch_deallocate(&self, allocations: &[Allocation]) -> Result<(), ArenaError> {
        let mut table = self.table.write();
        for allocation in allocations {
            Self::deallocate_locked(&mut table, allocation.offset)?;
        }
        Ok(())
    }

    /// Merge adjacent free blocks and run the compaction hook.
    ///
    /// Returns the number of merges performed. Live allocations are never
    /// moved: the arena does not know who holds their offsets.
    pub fn defragment(&self) -> usize {
        let mut table = self.table.write();
        let merged = Self::merge_adjacent_blocks(&mut table.free);
        Self::compact_memory_layout(&table);
        merged
    }

    pub fn stats(&self) -> ArenaStats {
        let table = self.table.read();
        let free_block_count = table.free.len();
        let largest = table.free.iter().map(|b| b.size).max().unwrap_or(0);

        ArenaStats {
            total_bytes: self.config.size_bytes,
            used_bytes: table.allocated_bytes,
            free_bytes: self.config.size_bytes - table.allocated_bytes,
            peak_bytes: table.peak_bytes,
            largest_free_block_bytes: largest,
            free_block_count,
            fragmentation_ratio: fragmentation_ratio(free_block_count),
            allocation_count: table.allocation_count,
            deallocation_count: table.deallocation_count,
        }
    }

    /// Address-ordered snapshot of every block, free and used.
    pub fn layout(&self) -> Vec<BlockSnapshot> {
        let table = self.table.read();
        let mut blocks: Vec<BlockSnapshot> = table
            .free
            .iter()
            .chain(table.used.values())
            .map(|b| BlockSnapshot {
                offset: b.offset,
                size: b.size,
                alignment: b.alignment,
                in_use: b.in_use,
                ref_count: b.ref_count,
            })
            .collect();
        blocks.sort_by_key(|b| b.offset);
        blocks
    }

    pub fn needs_defragment(&self) -> bool {
        self.stats().fragmentation_ratio > self.config.compaction_threshold
    }

    pub fn is_memory_pressure(&self) -> bool {
        if self.config.size_bytes == 0 {
            return true;
        }
        let used = self.table.read().allocated_bytes as f64;
        used / self.config.size_bytes as f64 >= self.config.pressure_threshold
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.table.read().used.len()
    }

    /// Whether `size` bytes at the default alignment would fit once the
    /// live allocations at `released` were freed. Nothing is changed.
    pub fn fits_after_release(&self, size: usize, released: &[usize]) -> bool {
        let alignment = self.config.alignment;
        let Some(size) = align_up(size, alignment) else {
            return false;
        };

        let table = self.table.read();
        let mut spans: Vec<(usize, usize)> = table.free.iter().map(|b| (b.offset, b.size)).collect();
        spans.extend(
            released
                .iter()
                .filter_map(|offset| table.used.get(offset))
                .map(|b| (b.offset, b.size)),
        );
        spans.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
        for (offset, len) in spans {
            match merged.last_mut() {
                Some((start, run)) if *start + *run == offset => *run += len,
                _ => merged.push((offset, len)),
            }
        }
        merged
            .iter()
            .any(|&(offset, len)| fit_in(offset, len, size, alignment).is_some())
    }

    pub fn capacity(&self) -> usize {
        self.config.size_bytes
    }

    pub fn alignment(&self) -> usize {
        self.config.alignment
    }

    fn allocate_locked(
        &self,
        table: &mut BlockTable,
        size: usize,
        alignment: usize,
    ) -> Result<Allocation, ArenaError> {
        let found = align_up(size, alignment).and_then(|size| {
            table.free.iter().enumerate().find_map(|(idx, block)| {
                fit_in(block.offset, block.size, size, alignment).map(|(start, prefix)| (idx, start, prefix, size))
            })
        });

        let Some((idx, start, prefix, size)) = found else {
            let largest_free = table.free.iter().map(|b| b.size).max().unwrap_or(0);
            tracing::warn!(requested = size, largest_free, "arena allocation failed");
            return Err(ArenaError::AllocationFailed { requested: size, largest_free });
        };

        let block = table.free.remove(idx);
        let mut insert_at = idx;

        if prefix > 0 {
            table.free.insert(insert_at, MemoryBlock::free(block.offset, prefix, self.config.alignment));
            insert_at += 1;
        }

        // A tail no larger than one alignment unit is handed out with the
        // allocation so the blocks keep tiling the arena.
        let remainder = block.size - prefix - size;
        let granted = if remainder > alignment {
            table.free.insert(insert_at, MemoryBlock::free(start + size, remainder, self.config.alignment));
            size
        } else {
            size + remainder
        };

        table.used.insert(
            start,
            MemoryBlock {
                offset: start,
                size: granted,
                alignment,
                in_use: true,
                last_used: Instant::now(),
                ref_count: 1,
            },
        );

        table.allocated_bytes += granted;
        table.peak_bytes = table.peak_bytes.max(table.allocated_bytes);
        table.allocation_count += 1;

        Ok(Allocation { offset: start, size: granted })
    }

    fn deallocate_locked(table: &mut BlockTable, offset: usize) -> Result<(), ArenaError> {
        let mut block = table
            .used
            .remove(&offset)
            .ok_or(ArenaError::UnknownAllocation(offset))?;

        table.allocated_bytes -= block.size;
        table.deallocation_count += 1;

        block.in_use = false;
        block.ref_count = 0;
        block.last_used = Instant::now();
        table.free.push(block);

        Self::merge_adjacent_blocks(&mut table.free);
        Ok(())
    }

    /// Sort free blocks by offset and merge every adjacent pair.
    ///
    /// Panics if two free blocks overlap: the block table is corrupt and any
    /// further answer from the allocator would be wrong.
    fn merge_adjacent_blocks(free: &mut Vec<MemoryBlock>) -> usize {
        free.sort_by_key(|b| b.offset);

        let mut merged = 0;
        let mut i = 0;
        while i + 1 < free.len() {
            let current_end = free[i].end();
            let next_start = free[i + 1].offset;
            assert!(
                current_end <= next_start,
                "arena free list corrupt: block [{}, {}) overlaps block at {}",
                free[i].offset,
                current_end,
                next_start
            );

            if current_end == next_start {
                let next = free.remove(i + 1);
                free[i].size += next.size;
                free[i].last_used = free[i].last_used.max(next.last_used);
                merged += 1;
                continue;
            }
            i += 1;
        }
        merged
    }

    fn compact_memory_layout(table: &BlockTable) {
        // Relocating live blocks would invalidate offsets held by callers.
        tracing::debug!(
            live = table.used.len(),
            free_blocks = table.free.len(),
            "arena compaction skipped: live blocks are not relocatable"
        );
    }
}

fn validate_request(size: usize, alignment: usize) -> Result<(), ArenaError> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(ArenaError::InvalidAlignment(alignment));
    }
    if size == 0 {
        return Err(ArenaError::ZeroSize);
    }
    Ok(())
}

/// `None` when rounding up would overflow.
fn align_up(value: usize, alignment: usize) -> Option<usize> {
    value.checked_add(alignment - 1).map(|v| v & !(alignment - 1))
}

/// Aligned start and padding prefix of `size` bytes inside a free block.
fn fit_in(offset: usize, len: usize, size: usize, alignment: usize) -> Option<(usize, usize)> {
    let start = align_up(offset, alignment)?;
    let prefix = start - offset;
    let needed = prefix.checked_add(size)?;
    (len >= needed).then_some((start, prefix))
}

fn fragmentation_ratio(free_blocks: usize) -> f64 {
    if free_blocks < 2 {
        return 0.0;
    }
    (free_blocks - 1) as f64 / free_blocks as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 32), Some(0));
        assert_eq!(align_up(1, 32), Some(32));
        assert_eq!(align_up(32, 32), Some(32));
        assert_eq!(align_up(33, 64), Some(64));
        assert_eq!(align_up(usize::MAX - 4, 32), None);
    }

    #[test]
    fn fragmentation_ratio_counts_blocks() {
        assert_eq!(fragmentation_ratio(0), 0.0);
        assert_eq!(fragmentation_ratio(1), 0.0);
        assert_eq!(fragmentation_ratio(2), 0.5);
        assert_eq!(fragmentation_ratio(4), 0.75);
    }

    #[test]
    fn merge_pass_joins_runs() {
        let mut free = vec![
            MemoryBlock::free(64, 32, 32),
            MemoryBlock::free(0, 64, 32),
            MemoryBlock::free(128, 32, 32),
        ];
        let merged = Arena::merge_adjacent_blocks(&mut free);
        assert_eq!(merged, 1);
        assert_eq!(free.len(), 2);
        assert_eq!((free[0].offset, free[0].size), (0, 96));
        assert_eq!((free[1].offset, free[1].size), (128, 32));
    }

    #[test]
    #[should_panic(expected = "free list corrupt")]
    fn merge_pass_panics_on_overlap() {
        let mut free = vec![MemoryBlock::free(0, 64, 32), MemoryBlock::free(32, 64, 32)];
        Arena::merge_adjacent_blocks(&mut free);
    }
}
