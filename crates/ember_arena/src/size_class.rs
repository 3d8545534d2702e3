//! Size-classed buffer cache
//!
//! Parameter-block requests are rounded up into fixed-capacity buckets: a
//! small tier at 64-byte granularity up to 1 KiB, a large tier at 1 KiB
//! granularity up to 24 KiB. Buffers live in a flat arena; each bucket keeps
//! a free and a used list of indices into it. Recycling is bulk: everything
//! allocated within one frame shares the frame's fence, so one
//! [`clear_used`](SizeClassCache::clear_used) call once that fence signals
//! moves the whole used population back to free.

use std::sync::Arc;

use ember_gpu::{BufferHandle, DeviceBackend};
use tracing::trace;

use crate::error::ArenaError;

/// Small tier rounds up to this granularity.
const SMALL_GRANULARITY: u32 = 64;
/// Largest size served by the small tier.
const SMALL_MAX: u32 = 1024;
/// Large tier rounds up to this granularity.
const LARGE_GRANULARITY: u32 = 1024;
/// Largest request any bucket serves.
pub const MAX_ALLOC: u32 = 24 * 1024;

const NUM_SMALL: usize = (SMALL_MAX / SMALL_GRANULARITY) as usize;
const NUM_LARGE: usize = ((MAX_ALLOC - SMALL_MAX) / LARGE_GRANULARITY) as usize;
const NUM_BUCKETS: usize = NUM_SMALL + NUM_LARGE;

/// Bucket index and rounded-up capacity for a request, or `None` when the
/// request exceeds the largest bucket.
fn bucket_of(size: u32) -> Option<(usize, u32)> {
    debug_assert!(size > 0, "zero-size parameter block");
    if size <= SMALL_MAX {
        let units = size.div_ceil(SMALL_GRANULARITY).max(1);
        Some(((units - 1) as usize, units * SMALL_GRANULARITY))
    } else if size <= MAX_ALLOC {
        let units = size.div_ceil(LARGE_GRANULARITY);
        Some((NUM_SMALL + (units - 2) as usize, units * LARGE_GRANULARITY))
    } else {
        None
    }
}

struct Entry {
    buffer: BufferHandle,
    next: Option<u32>,
}

#[derive(Clone, Copy, Default)]
struct Bucket {
    free_head: Option<u32>,
    used_head: Option<u32>,
    used_tail: Option<u32>,
}

/// A buffer served from the cache: the underlying handle plus the bucket
/// capacity it was rounded up to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PooledBuffer {
    pub buffer: BufferHandle,
    pub capacity: u32,
}

/// Allocation counters for one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Requests served from a free list.
    pub hits: u64,
    /// Requests that created a new buffer.
    pub misses: u64,
}

/// Bucketed free-list cache of fixed-capacity GPU buffers.
pub struct SizeClassCache {
    device: Arc<dyn DeviceBackend>,
    entries: Vec<Entry>,
    buckets: [Bucket; NUM_BUCKETS],
    stats: CacheStats,
}

impl SizeClassCache {
    pub fn new(device: Arc<dyn DeviceBackend>) -> Self {
        Self {
            device,
            entries: Vec::new(),
            buckets: [Bucket::default(); NUM_BUCKETS],
            stats: CacheStats::default(),
        }
    }

    /// Serve `size` bytes from the matching bucket, creating a buffer of the
    /// bucket's capacity on a miss. The buffer joins the used list and stays
    /// there until [`clear_used`](Self::clear_used).
    ///
    /// # Errors
    ///
    /// [`ArenaError::InvalidSize`] when `size` exceeds [`MAX_ALLOC`].
    pub fn allocate(&mut self, size: u32) -> Result<PooledBuffer, ArenaError> {
        let (index, capacity) = bucket_of(size).ok_or(ArenaError::InvalidSize {
            requested: size,
            max: MAX_ALLOC,
        })?;
        debug_assert!(size <= capacity);

        let bucket = &mut self.buckets[index];
        let entry_index = match bucket.free_head {
            Some(i) => {
                bucket.free_head = self.entries[i as usize].next;
                self.stats.hits += 1;
                i
            }
            None => {
                let buffer = self.device.create_buffer(capacity);
                trace!(capacity, bucket = index, "size class miss, created buffer");
                self.entries.push(Entry { buffer, next: None });
                self.stats.misses += 1;
                (self.entries.len() - 1) as u32
            }
        };

        let bucket = &mut self.buckets[index];
        self.entries[entry_index as usize].next = bucket.used_head;
        if bucket.used_head.is_none() {
            bucket.used_tail = Some(entry_index);
        }
        bucket.used_head = Some(entry_index);

        Ok(PooledBuffer {
            buffer: self.entries[entry_index as usize].buffer,
            capacity,
        })
    }

    /// Splice every used list onto its free list. O(1) per bucket via the
    /// tail link. Only safe once the frame generation that produced these
    /// allocations has retired on the GPU.
    pub fn clear_used(&mut self) {
        for bucket in &mut self.buckets {
            if let Some(tail) = bucket.used_tail {
                self.entries[tail as usize].next = bucket.free_head;
                bucket.free_head = bucket.used_head.take();
                bucket.used_tail = None;
            }
        }
    }

    /// Full teardown: release every underlying buffer and empty the arena.
    /// Used on resize and shutdown.
    pub fn clear_cache(&mut self) {
        for entry in &self.entries {
            self.device.destroy_buffer(entry.buffer);
        }
        self.entries.clear();
        self.buckets = [Bucket::default(); NUM_BUCKETS];
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of buffers the cache currently owns, free or used.
    pub fn buffer_count(&self) -> usize {
        self.entries.len()
    }
}

impl Drop for SizeClassCache {
    fn drop(&mut self) {
        self.clear_cache();
    }
}
