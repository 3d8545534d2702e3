//! Scratch ring allocator
//!
//! One contiguous GPU buffer carved by a bump cursor with wraparound.
//! `start` is the write cursor; `end` is the frontier it must never cross,
//! re-derived each frame from a small history of per-frame boundary
//! snapshots: when the fence of a recorded frame signals, the frontier
//! advances to that frame's boundary, reclaiming its bytes. Several frames
//! retiring together reclaim several boundaries in one scan.

use std::sync::Arc;

use ember_gpu::{BufferHandle, DeviceBackend};
use tracing::{debug, trace, warn};

use crate::error::ArenaError;
use crate::fence::FenceTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingState {
    Idle,
    Writing,
}

#[derive(Clone, Copy)]
struct BoundarySlot {
    /// Frame whose last byte ended at `boundary`, `None` once reclaimed.
    frame: Option<u64>,
    boundary: u32,
}

/// A carved scratch range. The caller writes through the device and binds
/// `[offset, offset + size)` of `buffer` for the draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScratchAlloc {
    pub buffer: BufferHandle,
    pub offset: u32,
    pub size: u32,
}

/// Circular bump allocator over one backing buffer.
///
/// `allocate` takes `&mut self`: the ring is driven by the one thread that
/// builds the frame, and the borrow checker enforces it.
pub struct RingAllocator {
    device: Arc<dyn DeviceBackend>,
    buffer: BufferHandle,
    capacity: u32,
    start: u32,
    end: u32,
    state: RingState,
    history: Vec<BoundarySlot>,
    history_index: usize,
}

impl RingAllocator {
    pub fn new(device: Arc<dyn DeviceBackend>, capacity: u32, history_slots: u32) -> Self {
        assert!(capacity > 0, "scratch ring cannot be empty");
        assert!(history_slots > 0, "need at least one boundary history slot");
        let buffer = device.create_buffer(capacity);
        debug!(capacity, history_slots, "scratch ring created");
        Self {
            device,
            buffer,
            capacity,
            start: 0,
            end: capacity,
            state: RingState::Idle,
            history: vec![
                BoundarySlot {
                    frame: None,
                    boundary: capacity,
                };
                history_slots as usize
            ],
            history_index: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The backing buffer scratch ranges point into.
    pub fn buffer(&self) -> BufferHandle {
        self.buffer
    }

    /// Reclaim the space of every frame that has retired since last time,
    /// oldest first, stopping at the first boundary still in GPU use.
    pub fn begin_frame(&mut self, tracker: &FenceTracker) {
        assert!(self.state == RingState::Idle, "begin_frame without a matching end_frame");
        self.state = RingState::Writing;

        let slots = self.history.len();
        let mut outstanding = false;
        for i in 0..slots {
            let index = (self.history_index + i) % slots;
            match self.history[index].frame {
                None => continue,
                Some(frame) if tracker.in_gpu_use(frame) => {
                    outstanding = true;
                    break;
                }
                Some(frame) => {
                    self.end = self.history[index].boundary;
                    self.history[index].frame = None;
                    trace!(frame, frontier = self.end, "scratch frontier advanced");
                }
            }
        }

        // Fully drained ring: restore the pristine cursors so start == end
        // elsewhere always means full, never empty.
        if !outstanding && self.start == self.end {
            self.start = 0;
            self.end = self.capacity;
        }
    }

    /// Carve `size` bytes at the cursor, wrapping to offset 0 when the tail
    /// of the buffer cannot fit the request and the head is free.
    ///
    /// # Errors
    ///
    /// [`ArenaError::Exhausted`] when no contiguous `size` bytes are free
    /// this frame. Backpressure: the caller skips or degrades the item and
    /// the bytes come back once older frames retire.
    pub fn allocate(&mut self, size: u32) -> Result<ScratchAlloc, ArenaError> {
        assert!(self.state == RingState::Writing, "allocate outside a begin_frame/end_frame window");
        debug_assert!(size > 0, "zero-size scratch allocation");

        if self.start < self.end {
            // Compare against the free span, not `start + size`: the sum can
            // overflow u32 for oversized requests.
            if size > self.end - self.start {
                return Err(self.exhausted(size, self.end - self.start));
            }
            let offset = self.start;
            self.start += size;
            return Ok(self.carved(offset, size));
        }

        if self.start > self.end {
            // Wrapped: the free span is [start, capacity) then [0, end).
            if self.capacity - self.start >= size {
                let offset = self.start;
                self.start += size;
                return Ok(self.carved(offset, size));
            }
            if size <= self.end {
                trace!(size, "scratch cursor wrapped to offset 0");
                self.start = size;
                return Ok(self.carved(0, size));
            }
            return Err(self.exhausted(size, (self.capacity - self.start).max(self.end)));
        }

        // start == end: every byte is claimed by a frame not yet retired.
        Err(self.exhausted(size, 0))
    }

    /// Snapshot this frame's boundary into the history so a later
    /// `begin_frame` can reclaim up to it once the frame's fence signals.
    pub fn end_frame(&mut self, tracker: &FenceTracker) {
        assert!(self.state == RingState::Writing, "end_frame without a matching begin_frame");
        self.state = RingState::Idle;

        self.history[self.history_index] = BoundarySlot {
            frame: Some(tracker.current_frame()),
            boundary: self.start,
        };
        self.history_index = (self.history_index + 1) % self.history.len();
    }

    /// Forget all claims and history. Device-loss/resize recovery; only
    /// valid once the GPU is known to be idle.
    pub fn reset(&mut self) {
        self.start = 0;
        self.end = self.capacity;
        self.state = RingState::Idle;
        for slot in &mut self.history {
            *slot = BoundarySlot {
                frame: None,
                boundary: self.capacity,
            };
        }
        self.history_index = 0;
    }

    fn carved(&self, offset: u32, size: u32) -> ScratchAlloc {
        ScratchAlloc {
            buffer: self.buffer,
            offset,
            size,
        }
    }

    fn exhausted(&self, requested: u32, available: u32) -> ArenaError {
        warn!(requested, available, "scratch ring exhausted this frame");
        ArenaError::Exhausted {
            requested,
            available,
        }
    }
}

impl Drop for RingAllocator {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_gpu::HeadlessDevice;

    fn rig(capacity: u32, frames: u32) -> (Arc<HeadlessDevice>, FenceTracker, RingAllocator) {
        let device = Arc::new(HeadlessDevice::new());
        let tracker = FenceTracker::new(device.clone(), frames, 16);
        let ring = RingAllocator::new(device.clone(), capacity, frames);
        (device, tracker, ring)
    }

    /// Run one frame: the closure records, then the frame is fenced off and
    /// optionally retired immediately.
    fn frame(
        device: &HeadlessDevice,
        tracker: &mut FenceTracker,
        ring: &mut RingAllocator,
        retire: bool,
        record: impl FnOnce(&mut RingAllocator),
    ) {
        tracker.begin_frame().unwrap();
        ring.begin_frame(tracker);
        record(ring);
        ring.end_frame(tracker);
        let fence = tracker.current_fence();
        tracker.end_frame();
        if retire {
            device.signal_fence(fence);
        }
    }

    #[test]
    fn second_oversized_allocation_fails_within_one_frame() {
        let (device, mut tracker, mut ring) = rig(1024, 4);
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            let first = ring.allocate(600).unwrap();
            assert_eq!(first.offset, 0);
            assert_eq!(first.size, 600);

            let err = ring.allocate(600).unwrap_err();
            assert_eq!(
                err,
                ArenaError::Exhausted {
                    requested: 600,
                    available: 424
                }
            );
        });
    }

    #[test]
    fn huge_request_is_backpressure_not_a_panic() {
        let (device, mut tracker, mut ring) = rig(1024, 4);
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            ring.allocate(600).unwrap();
            // Near-u32::MAX sizes must not overflow the cursor arithmetic;
            // the cursor stays where the failed request found it.
            let err = ring.allocate(u32::MAX).unwrap_err();
            assert_eq!(
                err,
                ArenaError::Exhausted {
                    requested: u32::MAX,
                    available: 424
                }
            );
            let next = ring.allocate(100).unwrap();
            assert_eq!(next.offset, 600);
        });
    }

    #[test]
    fn exact_fit_succeeds_one_more_byte_fails() {
        let (device, mut tracker, mut ring) = rig(1024, 4);
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            ring.allocate(24).unwrap();
            // end - start == 1000 now.
            let fit = ring.allocate(1000).unwrap();
            assert_eq!(fit.offset, 24);
        });
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            // Ring is completely claimed by the previous frame.
            let err = ring.allocate(1).unwrap_err();
            assert_eq!(
                err,
                ArenaError::Exhausted {
                    requested: 1,
                    available: 0
                }
            );
        });
    }

    #[test]
    fn frontier_advances_only_after_frames_retire() {
        let (device, mut tracker, mut ring) = rig(1024, 4);
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            ring.allocate(600).unwrap();
        });
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            // Frame 0 unretired: only the tail bytes are free.
            ring.allocate(600).unwrap_err();
            ring.allocate(400).unwrap();
        });
        // Retire frame 0 only.
        device.signal_all();
        frame(&device, &mut tracker, &mut ring, false, |_| {});

        // History scan stops at frame 1... but signal_all retired both, so
        // the drained ring reset to pristine and a full-size claim fits.
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            ring.allocate(1024).unwrap();
        });
    }

    #[test]
    fn wraparound_restarts_at_offset_zero() {
        let (device, mut tracker, mut ring) = rig(1024, 4);
        tracker.begin_frame().unwrap();
        ring.begin_frame(&tracker);
        ring.allocate(600).unwrap();
        ring.end_frame(&tracker);
        let fence0 = tracker.current_fence();
        tracker.end_frame();

        frame(&device, &mut tracker, &mut ring, false, |ring| {
            ring.allocate(300).unwrap();
        });

        // Frame 0 retires, frame 1 stays on the GPU: the frontier moves to
        // 600 while the cursor sits at 900, a wrapped configuration.
        device.signal_fence(fence0);
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            let tail = ring.allocate(100).unwrap();
            assert_eq!(tail.offset, 900);
            // 24 tail bytes left; a 200-byte request restarts at offset 0.
            let wrapped = ring.allocate(200).unwrap();
            assert_eq!(wrapped.offset, 0);
            let inside = ring.allocate(300).unwrap();
            assert_eq!(inside.offset, 200);
            // [500, 600) remains ahead of the frontier.
            let err = ring.allocate(200).unwrap_err();
            assert_eq!(
                err,
                ArenaError::Exhausted {
                    requested: 200,
                    available: 100
                }
            );
        });
    }

    #[test]
    fn several_retired_frames_reclaim_in_one_scan() {
        let (device, mut tracker, mut ring) = rig(1024, 4);
        let mut fences = Vec::new();
        for _ in 0..3 {
            tracker.begin_frame().unwrap();
            ring.begin_frame(&tracker);
            ring.allocate(300).unwrap();
            ring.end_frame(&tracker);
            fences.push(tracker.current_fence());
            tracker.end_frame();
        }
        // Frames 0 and 1 retire together; one scan reclaims both
        // boundaries and the 500-byte request fits only via the wrap.
        device.signal_fence(fences[0]);
        device.signal_fence(fences[1]);
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            let wrapped = ring.allocate(500).unwrap();
            assert_eq!(wrapped.offset, 0);
            let inside = ring.allocate(100).unwrap();
            assert_eq!(inside.offset, 500);
        });
    }

    #[test]
    #[should_panic(expected = "allocate outside")]
    fn allocate_outside_a_frame_window_is_a_bug() {
        let (_device, _tracker, mut ring) = rig(1024, 4);
        let _ = ring.allocate(64);
    }

    #[test]
    #[should_panic(expected = "without a matching end_frame")]
    fn unpaired_begin_frame_is_a_bug() {
        let (_device, mut tracker, mut ring) = rig(1024, 4);
        tracker.begin_frame().unwrap();
        ring.begin_frame(&tracker);
        ring.begin_frame(&tracker);
    }

    #[test]
    fn reset_restores_the_pristine_ring() {
        let (device, mut tracker, mut ring) = rig(1024, 4);
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            ring.allocate(1000).unwrap();
        });
        ring.reset();
        frame(&device, &mut tracker, &mut ring, false, |ring| {
            let whole = ring.allocate(1024).unwrap();
            assert_eq!(whole.offset, 0);
        });
    }
}
