//! In-memory device backend
//!
//! Implements [`DeviceBackend`] without any GPU: fences are signaled flags,
//! buffers are byte vectors. Used by the test suites and by headless tools
//! that exercise frame pipelines without a swapchain. Completion is driven
//! from outside via [`HeadlessDevice::signal_fence`] or, for pipelines that
//! stall on a fence, [`HeadlessDevice::signal_after_waits`].

use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::backend::{BufferHandle, DeviceBackend, FenceHandle};

#[derive(Default)]
struct FenceState {
    signaled: bool,
    live: bool,
}

#[derive(Default)]
struct Inner {
    fences: Vec<FenceState>,
    buffers: Vec<Option<Vec<u8>>>,
    buffers_created: u64,
    wait_calls: u64,
    signal_after_waits: Option<u64>,
}

/// A [`DeviceBackend`] that lives entirely on the CPU.
#[derive(Default)]
pub struct HeadlessDevice {
    inner: Mutex<Inner>,
}

impl HeadlessDevice {
    pub fn new() -> Self {
        debug!("creating headless device");
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("headless device state poisoned")
    }

    /// Total `create_buffer` calls over the device's lifetime.
    pub fn buffers_created(&self) -> u64 {
        self.lock().buffers_created
    }

    /// Buffers created and not yet destroyed.
    pub fn live_buffers(&self) -> usize {
        self.lock().buffers.iter().filter(|b| b.is_some()).count()
    }

    /// Total blocking `wait_fence` calls over the device's lifetime.
    pub fn wait_calls(&self) -> u64 {
        self.lock().wait_calls
    }

    /// Simulate the GPU catching up: once the lifetime wait-call counter
    /// reaches `n`, the fence being waited on signals.
    pub fn signal_after_waits(&self, n: u64) {
        self.lock().signal_after_waits = Some(n);
    }

    /// Signal every live fence, as if the GPU went idle.
    pub fn signal_all(&self) {
        for fence in self.lock().fences.iter_mut().filter(|f| f.live) {
            fence.signaled = true;
        }
    }
}

impl DeviceBackend for HeadlessDevice {
    fn create_fence(&self) -> FenceHandle {
        let mut inner = self.lock();
        let id = inner.fences.len() as u32;
        inner.fences.push(FenceState {
            signaled: false,
            live: true,
        });
        FenceHandle::from_raw(id)
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut inner = self.lock();
        let state = &mut inner.fences[fence.raw() as usize];
        assert!(state.live, "fence destroyed twice");
        state.live = false;
    }

    fn reset_fence(&self, fence: FenceHandle) {
        self.lock().fences[fence.raw() as usize].signaled = false;
    }

    fn signal_fence(&self, fence: FenceHandle) {
        self.lock().fences[fence.raw() as usize].signaled = true;
    }

    fn fence_signaled(&self, fence: FenceHandle) -> bool {
        self.lock().fences[fence.raw() as usize].signaled
    }

    fn wait_fence(&self, fence: FenceHandle) -> bool {
        let mut inner = self.lock();
        inner.wait_calls += 1;
        if let Some(n) = inner.signal_after_waits {
            if inner.wait_calls >= n {
                inner.fences[fence.raw() as usize].signaled = true;
            }
        }
        inner.fences[fence.raw() as usize].signaled
    }

    fn create_buffer(&self, size: u32) -> BufferHandle {
        let mut inner = self.lock();
        let id = inner.buffers.len() as u32;
        inner.buffers.push(Some(vec![0u8; size as usize]));
        inner.buffers_created += 1;
        BufferHandle::from_raw(id)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut inner = self.lock();
        let slot = &mut inner.buffers[buffer.raw() as usize];
        assert!(slot.is_some(), "buffer destroyed twice");
        *slot = None;
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u32, data: &[u8]) {
        let mut inner = self.lock();
        let bytes = inner.buffers[buffer.raw() as usize]
            .as_mut()
            .expect("write to destroyed buffer");
        let start = offset as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }

    fn read_buffer(&self, buffer: BufferHandle, offset: u32, out: &mut [u8]) {
        let inner = self.lock();
        let bytes = inner.buffers[buffer.raw() as usize]
            .as_ref()
            .expect("read from destroyed buffer");
        let start = offset as usize;
        out.copy_from_slice(&bytes[start..start + out.len()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_write_read_round_trip() {
        let device = HeadlessDevice::new();
        let buffer = device.create_buffer(64);

        device.write_buffer(buffer, 16, &[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        device.read_buffer(buffer, 16, &mut out);
        assert_eq!(out, [1, 2, 3, 4]);

        assert_eq!(device.buffers_created(), 1);
        assert_eq!(device.live_buffers(), 1);
        device.destroy_buffer(buffer);
        assert_eq!(device.live_buffers(), 0);
    }

    #[test]
    fn fence_lifecycle() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence();

        assert!(!device.fence_signaled(fence));
        device.signal_fence(fence);
        assert!(device.fence_signaled(fence));

        device.reset_fence(fence);
        assert!(!device.fence_signaled(fence));

        device.destroy_fence(fence);
    }

    #[test]
    fn wait_counts_and_forced_completion() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence();

        assert!(!device.wait_fence(fence));
        assert!(!device.wait_fence(fence));
        assert_eq!(device.wait_calls(), 2);

        device.signal_after_waits(4);
        assert!(!device.wait_fence(fence));
        assert!(device.wait_fence(fence));
        assert!(device.fence_signaled(fence));
    }
}
