//! Device backend trait and opaque resource handles

/// Opaque handle to a device-owned fence.
///
/// A fence marks a submission boundary: it becomes signaled once the GPU has
/// finished executing everything submitted before it was armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(u32);

impl FenceHandle {
    /// Wrap a backend-assigned raw id.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The backend-assigned raw id.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// Opaque handle to a device-owned buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u32);

impl BufferHandle {
    /// Wrap a backend-assigned raw id.
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The backend-assigned raw id.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// The device capability the transient allocators consume.
///
/// All methods take `&self`: a device is shared by every component that
/// talks to it, the same shape wgpu gives `Device`/`Queue`. Implementations
/// are responsible for their own interior synchronization.
pub trait DeviceBackend: Send + Sync {
    /// Create a fence in the unsignaled state.
    fn create_fence(&self) -> FenceHandle;

    /// Release a fence. The handle must not be used afterwards.
    fn destroy_fence(&self, fence: FenceHandle);

    /// Re-arm a fence so it can track a new submission boundary.
    fn reset_fence(&self, fence: FenceHandle);

    /// Mark a fence signaled. Called by the submission side once the GPU
    /// retires the work the fence guards; tests call it directly.
    fn signal_fence(&self, fence: FenceHandle);

    /// Non-blocking poll: has the fence signaled?
    fn fence_signaled(&self, fence: FenceHandle) -> bool;

    /// Block until the fence signals or the backend's internal patience runs
    /// out. Returns whether the fence is signaled on return; callers that
    /// need a hard guarantee re-poll and retry with their own budget.
    fn wait_fence(&self, fence: FenceHandle) -> bool;

    /// Create a CPU-writable buffer of `size` bytes.
    fn create_buffer(&self, size: u32) -> BufferHandle;

    /// Release a buffer. The handle must not be used afterwards.
    fn destroy_buffer(&self, buffer: BufferHandle);

    /// Write `data` into the buffer starting at `offset`.
    ///
    /// The mapped-pointer acquisition of native APIs is scoped inside the
    /// call; the region is flushed and unmapped before it returns.
    fn write_buffer(&self, buffer: BufferHandle, offset: u32, data: &[u8]);

    /// Read `out.len()` bytes from the buffer starting at `offset`.
    fn read_buffer(&self, buffer: BufferHandle, offset: u32, out: &mut [u8]);
}
