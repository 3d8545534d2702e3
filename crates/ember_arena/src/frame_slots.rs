//! Per-frame rotation of size-class caches
//!
//! One [`SizeClassCache`] cannot recycle per allocation: everything handed
//! out during a frame stays reserved until that frame's fence signals, and
//! the CPU starts the next frame long before that. [`FrameSlotSet`] keeps M
//! cache generations, tags each with the frame it last served, and rotates
//! allocation onto a generation whose frame has retired.

use std::sync::{Arc, Mutex, MutexGuard};

use ember_gpu::DeviceBackend;
use tracing::trace;

use crate::error::ArenaError;
use crate::fence::FenceTracker;
use crate::size_class::{CacheStats, PooledBuffer, SizeClassCache};

struct SlotEntry {
    cache: SizeClassCache,
    /// Frame generation this entry last served, `None` if never used.
    frame: Option<u64>,
}

struct Inner {
    entries: Vec<SlotEntry>,
    current: usize,
    recording: bool,
}

/// M rotating cache generations with a lock-guarded allocation path.
///
/// `begin_frame`/`end_frame` are orchestrator-only (`&mut self`);
/// [`allocate`](Self::allocate) is the one operation built for concurrent
/// callers, e.g. parallel command-recording workers within a frame.
pub struct FrameSlotSet {
    inner: Mutex<Inner>,
}

impl FrameSlotSet {
    pub fn new(device: Arc<dyn DeviceBackend>, generations: usize) -> Self {
        assert!(generations > 0, "need at least one cache generation");
        let entries = (0..generations)
            .map(|_| SlotEntry {
                cache: SizeClassCache::new(device.clone()),
                frame: None,
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                entries,
                current: 0,
                recording: false,
            }),
        }
    }

    fn inner_mut(&mut self) -> &mut Inner {
        self.inner.get_mut().expect("frame slot set poisoned")
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("frame slot set poisoned")
    }

    /// Pick the generation for the new frame: scan all entries and take the
    /// last one whose tagged frame has retired (or that was never used).
    /// The chosen generation bulk-recycles its used buffers and is re-tagged
    /// with the tracker's current frame.
    ///
    /// When every generation is still on the GPU, falls back to the oldest
    /// one and waits it out through the tracker's bounded retry.
    ///
    /// # Errors
    ///
    /// [`ArenaError::FenceWaitExceeded`] if the fallback wait runs out.
    pub fn begin_frame(&mut self, tracker: &mut FenceTracker) -> Result<(), ArenaError> {
        let inner = self.inner_mut();
        assert!(!inner.recording, "begin_frame without a matching end_frame");

        let mut chosen = None;
        for (i, entry) in inner.entries.iter().enumerate() {
            let eligible = match entry.frame {
                None => true,
                Some(frame) => !tracker.in_gpu_use(frame),
            };
            if eligible {
                chosen = Some(i);
            }
        }

        let index = match chosen {
            Some(i) => i,
            None => {
                let (i, frame) = inner
                    .entries
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (i, e.frame.expect("untagged entries are always eligible")))
                    .min_by_key(|&(_, frame)| frame)
                    .expect("slot set has at least one entry");
                trace!(frame, "every cache generation still on the GPU, waiting out the oldest");
                tracker.force_retire(frame)?;
                i
            }
        };

        let entry = &mut inner.entries[index];
        entry.cache.clear_used();
        entry.frame = Some(tracker.current_frame());
        inner.current = index;
        inner.recording = true;
        trace!(generation = index, frame = tracker.current_frame(), "parameter generation selected");
        Ok(())
    }

    /// Serve a parameter block from the current generation. Safe to call
    /// from multiple threads between one `begin_frame`/`end_frame` pair.
    ///
    /// # Errors
    ///
    /// [`ArenaError::InvalidSize`] for requests above the largest bucket.
    pub fn allocate(&self, size: u32) -> Result<PooledBuffer, ArenaError> {
        let mut inner = self.lock();
        assert!(inner.recording, "allocate outside a begin_frame/end_frame window");
        let index = inner.current;
        inner.entries[index].cache.allocate(size)
    }

    /// Close the recording window.
    pub fn end_frame(&mut self) {
        let inner = self.inner_mut();
        assert!(inner.recording, "end_frame without a matching begin_frame");
        inner.recording = false;
    }

    /// Force every generation back to unused and release all cached
    /// buffers. Device-loss/resize recovery.
    pub fn reset(&mut self) {
        let inner = self.inner_mut();
        for entry in &mut inner.entries {
            entry.cache.clear_cache();
            entry.frame = None;
        }
        inner.current = 0;
        inner.recording = false;
    }

    /// Index of the generation currently serving allocations.
    pub fn active_generation(&self) -> usize {
        self.lock().current
    }

    /// Hit/miss totals summed over every generation.
    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        let mut total = CacheStats::default();
        for entry in &inner.entries {
            let stats = entry.cache.stats();
            total.hits += stats.hits;
            total.misses += stats.misses;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gpu::HeadlessDevice;

    fn rig(generations: usize, frames: u32) -> (Arc<HeadlessDevice>, FenceTracker, FrameSlotSet) {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FenceTracker::new(device.clone(), frames, 16);
        let set = FrameSlotSet::new(device.clone(), generations);
        (device, tracker, set)
    }

    #[test]
    fn first_frame_selects_the_last_scanned_entry() {
        let (_device, mut tracker, mut set) = rig(3, 4);
        tracker.begin_frame().unwrap();
        set.begin_frame(&mut tracker).unwrap();

        // All three entries are unused and eligible; last one scanned wins.
        assert_eq!(set.active_generation(), 2);
        set.allocate(128).unwrap();
    }

    #[test]
    fn generations_rotate_while_frames_stay_in_flight() {
        let (_device, mut tracker, mut set) = rig(3, 4);
        let mut picked = Vec::new();
        for _ in 0..3 {
            tracker.begin_frame().unwrap();
            set.begin_frame(&mut tracker).unwrap();
            picked.push(set.active_generation());
            set.end_frame();
            tracker.end_frame();
        }
        // Nothing signaled, so each frame had to take a fresh generation,
        // scanning from the back.
        assert_eq!(picked, vec![2, 1, 0]);
    }

    #[test]
    fn all_generations_busy_waits_out_the_oldest() {
        let (device, mut tracker, mut set) = rig(3, 4);
        for _ in 0..3 {
            tracker.begin_frame().unwrap();
            set.begin_frame(&mut tracker).unwrap();
            set.end_frame();
            tracker.end_frame();
        }

        // Frames 0..2 all outstanding: the fourth frame must stall on frame
        // 0 and then reuse its generation (index 2).
        device.signal_after_waits(2);
        tracker.begin_frame().unwrap();
        set.begin_frame(&mut tracker).unwrap();
        assert_eq!(set.active_generation(), 2);
    }

    #[test]
    fn retired_generation_reuses_cached_buffers() {
        let (device, mut tracker, mut set) = rig(2, 4);

        tracker.begin_frame().unwrap();
        set.begin_frame(&mut tracker).unwrap();
        let first = set.allocate(100).unwrap();
        set.end_frame();
        let fence = tracker.current_fence();
        tracker.end_frame();

        // Frame 0 still in flight: frame 1 must take the other generation.
        tracker.begin_frame().unwrap();
        set.begin_frame(&mut tracker).unwrap();
        set.allocate(100).unwrap();
        set.end_frame();
        tracker.end_frame();

        // GPU finishes frame 0; frame 2 recycles its generation and buffer.
        device.signal_fence(fence);
        tracker.begin_frame().unwrap();
        set.begin_frame(&mut tracker).unwrap();
        let again = set.allocate(100).unwrap();
        assert_eq!(again.buffer, first.buffer);
        assert_eq!(device.buffers_created(), 2);
    }

    #[test]
    fn concurrent_allocations_within_one_frame() {
        let (device, mut tracker, mut set) = rig(3, 4);
        tracker.begin_frame().unwrap();
        set.begin_frame(&mut tracker).unwrap();

        let handles = Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..8 {
                        let block = set.allocate(256).unwrap();
                        handles.lock().unwrap().push(block.buffer);
                    }
                });
            }
        });

        let mut handles = handles.into_inner().unwrap();
        let total = handles.len();
        handles.sort_by_key(|h| h.raw());
        handles.dedup();
        // No buffer was handed to two callers within the frame.
        assert_eq!(handles.len(), total);
        assert_eq!(device.buffers_created(), total as u64);
    }

    #[test]
    #[should_panic(expected = "allocate outside")]
    fn allocate_outside_a_frame_window_is_a_bug() {
        let (_device, _tracker, set) = rig(2, 4);
        let _ = set.allocate(64);
    }

    #[test]
    fn reset_forgets_every_generation() {
        let (device, mut tracker, mut set) = rig(2, 4);
        tracker.begin_frame().unwrap();
        set.begin_frame(&mut tracker).unwrap();
        set.allocate(100).unwrap();
        set.allocate(2000).unwrap();

        set.reset();
        assert_eq!(device.live_buffers(), 0);

        // The set is usable again after a reset.
        set.begin_frame(&mut tracker).unwrap();
        set.allocate(100).unwrap();
    }
}
