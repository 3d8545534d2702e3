//! Frame fence tracking
//!
//! The CPU records frame `c` while the GPU may still be consuming frames
//! `c-1 .. c-N+1`. [`FenceTracker`] owns the N rotating fences that mark
//! those submission boundaries and answers, without blocking, whether a past
//! frame has retired. The single blocking point of the whole arena lives
//! here: the bounded retry wait taken when the CPU laps the GPU.

use std::sync::Arc;

use ember_gpu::{DeviceBackend, FenceHandle};
use tracing::{error, trace};

use crate::error::ArenaError;

struct FrameSlot {
    fence: FenceHandle,
    /// Frame id this slot's fence currently guards. Meaningful only while
    /// `in_flight`; a slot re-armed for a newer frame proves any older frame
    /// that mapped here retired long ago.
    frame: u64,
    in_flight: bool,
}

/// Tracks N rotating frame fences.
///
/// Frame ids are monotonic; frame `id` maps to slot `id & (N-1)`.
pub struct FenceTracker {
    device: Arc<dyn DeviceBackend>,
    slots: Vec<FrameSlot>,
    mask: u64,
    current: u64,
    retry_budget: u32,
}

impl FenceTracker {
    /// `frames_in_flight` must be a power of two.
    pub fn new(device: Arc<dyn DeviceBackend>, frames_in_flight: u32, retry_budget: u32) -> Self {
        assert!(
            frames_in_flight.is_power_of_two(),
            "frames_in_flight must be a power of two, got {frames_in_flight}"
        );
        let slots = (0..frames_in_flight)
            .map(|_| FrameSlot {
                fence: device.create_fence(),
                frame: 0,
                in_flight: false,
            })
            .collect();
        Self {
            device,
            slots,
            mask: u64::from(frames_in_flight) - 1,
            current: 0,
            retry_budget,
        }
    }

    /// Id of the frame currently being recorded.
    pub fn current_frame(&self) -> u64 {
        self.current
    }

    /// Non-blocking: is the GPU still consuming `frame`?
    ///
    /// Answers from the flags cached by the last [`begin_frame`] sweep, so a
    /// fence that signaled since then may still report in use for one frame.
    ///
    /// [`begin_frame`]: Self::begin_frame
    pub fn in_gpu_use(&self, frame: u64) -> bool {
        let slot = &self.slots[(frame & self.mask) as usize];
        slot.in_flight && slot.frame == frame
    }

    /// Poll every slot once, then make sure the slot about to serve the new
    /// frame is free, blocking with a bounded retry loop if it is not.
    ///
    /// # Errors
    ///
    /// [`ArenaError::FenceWaitExceeded`] once the retry budget runs out. The
    /// device is considered lost at that point; the tracker is not usable
    /// for further frames.
    pub fn begin_frame(&mut self) -> Result<(), ArenaError> {
        for slot in &mut self.slots {
            if slot.in_flight && self.device.fence_signaled(slot.fence) {
                slot.in_flight = false;
            }
        }

        let idx = (self.current & self.mask) as usize;
        if self.slots[idx].in_flight {
            trace!(frame = self.current, "CPU lapped the GPU, entering bounded fence wait");
            self.wait_slot(idx)?;
        }
        Ok(())
    }

    /// Block until `frame` retires, within the same bounded retry budget.
    ///
    /// Escape hatch for callers that cannot make progress while `frame` is
    /// outstanding; returns immediately if it already retired.
    pub fn force_retire(&mut self, frame: u64) -> Result<(), ArenaError> {
        let idx = (frame & self.mask) as usize;
        if self.slots[idx].in_flight && self.slots[idx].frame == frame {
            self.wait_slot(idx)?;
        }
        Ok(())
    }

    /// Re-arm the current slot's fence to mark this frame's submission
    /// boundary and advance to the next frame.
    pub fn end_frame(&mut self) {
        let idx = (self.current & self.mask) as usize;
        let slot = &mut self.slots[idx];
        debug_assert!(!slot.in_flight, "end_frame on a slot that was never waited free");
        self.device.reset_fence(slot.fence);
        slot.frame = self.current;
        slot.in_flight = true;
        trace!(frame = self.current, "submission boundary fenced");
        self.current += 1;
    }

    /// The fence guarding the current frame, for the submission side to
    /// signal once the GPU retires this frame's work.
    pub fn current_fence(&self) -> FenceHandle {
        self.slots[(self.current & self.mask) as usize].fence
    }

    fn wait_slot(&mut self, idx: usize) -> Result<(), ArenaError> {
        let fence = self.slots[idx].fence;
        let mut polls = 0u32;
        while !self.device.fence_signaled(fence) {
            polls += 1;
            if polls > self.retry_budget {
                error!(
                    frame = self.slots[idx].frame,
                    budget = self.retry_budget,
                    "fence never signaled within retry budget, device lost"
                );
                return Err(ArenaError::FenceWaitExceeded {
                    budget: self.retry_budget,
                });
            }
            self.device.wait_fence(fence);
        }
        self.slots[idx].in_flight = false;
        Ok(())
    }
}

impl Drop for FenceTracker {
    fn drop(&mut self) {
        for slot in &self.slots {
            self.device.destroy_fence(slot.fence);
        }
    }
}
