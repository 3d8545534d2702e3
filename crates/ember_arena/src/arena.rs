//! The arena context object
//!
//! [`TransientArena`] owns the fence tracker, the parameter-block slot set,
//! and the scratch ring, and drives their begin/end ordering: fences first
//! into a frame (they may block), fences last out of a frame (the other two
//! snapshot the finishing frame's id before the tracker advances).

use std::sync::Arc;

use ember_gpu::{DeviceBackend, FenceHandle};
use tracing::debug;

use crate::config::ArenaConfig;
use crate::error::ArenaError;
use crate::fence::FenceTracker;
use crate::frame_slots::FrameSlotSet;
use crate::ring::{RingAllocator, ScratchAlloc};
use crate::size_class::{CacheStats, PooledBuffer};

/// Frame-pipelined transient GPU resource arena.
///
/// One instance per device, constructed once and passed by reference;
/// begin/end are driven by the frame orchestrator thread, strictly paired.
pub struct TransientArena {
    fences: FenceTracker,
    params: FrameSlotSet,
    scratch: RingAllocator,
}

impl TransientArena {
    pub fn new(device: Arc<dyn DeviceBackend>, config: &ArenaConfig) -> Self {
        config.validate();
        debug!(
            frames_in_flight = config.frames_in_flight,
            param_generations = config.param_generations,
            scratch_bytes = config.scratch_bytes,
            "creating transient arena"
        );
        Self {
            fences: FenceTracker::new(
                device.clone(),
                config.frames_in_flight,
                config.fence_retry_budget,
            ),
            params: FrameSlotSet::new(device.clone(), config.param_generations),
            scratch: RingAllocator::new(device, config.scratch_bytes, config.frames_in_flight),
        }
    }

    /// Open a frame. May block in the fence tracker when the CPU has lapped
    /// the GPU.
    ///
    /// # Errors
    ///
    /// [`ArenaError::FenceWaitExceeded`] means the device is lost; propagate
    /// it out of the render loop.
    pub fn begin_frame(&mut self) -> Result<(), ArenaError> {
        self.fences.begin_frame()?;
        self.params.begin_frame(&mut self.fences)?;
        self.scratch.begin_frame(&self.fences);
        Ok(())
    }

    /// Serve a per-draw parameter block. Callable from multiple recording
    /// threads within one frame.
    pub fn allocate_params(&self, size: u32) -> Result<PooledBuffer, ArenaError> {
        self.params.allocate(size)
    }

    /// Carve scratch vertex/index bytes from the ring. Single caller; the
    /// `&mut` receiver enforces it.
    pub fn allocate_scratch(&mut self, size: u32) -> Result<ScratchAlloc, ArenaError> {
        self.scratch.allocate(size)
    }

    /// Close the frame and fence off its submission boundary.
    pub fn end_frame(&mut self) {
        self.scratch.end_frame(&self.fences);
        self.params.end_frame();
        self.fences.end_frame();
    }

    /// The fence the submission side signals when this frame's GPU work
    /// retires. Valid between `begin_frame` and `end_frame`.
    pub fn frame_fence(&self) -> FenceHandle {
        self.fences.current_fence()
    }

    /// Tear down every transient claim. Device-loss/resize recovery; the
    /// caller must know the GPU is idle.
    pub fn reset(&mut self) {
        debug!("resetting transient arena");
        self.params.reset();
        self.scratch.reset();
    }

    /// Parameter-cache hit/miss totals across all generations.
    pub fn stats(&self) -> CacheStats {
        self.params.stats()
    }
}
