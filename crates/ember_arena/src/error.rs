use thiserror::Error;

/// Errors surfaced by the transient allocators.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ArenaError {
    /// The scratch ring has no contiguous space left this frame.
    ///
    /// Backpressure, not failure: skip or degrade the draw item and retry
    /// next frame once older frames retire.
    #[error("scratch ring exhausted: requested {requested} bytes, {available} contiguous bytes free")]
    Exhausted { requested: u32, available: u32 },

    /// The bounded blocking wait on a frame fence ran out of retries.
    ///
    /// Fatal: the device is considered lost. Propagate to whatever owns the
    /// render loop; never retried internally.
    #[error("fence wait exceeded its retry budget of {budget} polls; device considered lost")]
    FenceWaitExceeded { budget: u32 },

    /// A parameter-block request exceeded the largest size class.
    #[error("requested {requested} bytes exceeds the largest size class of {max} bytes")]
    InvalidSize { requested: u32, max: u32 },
}
