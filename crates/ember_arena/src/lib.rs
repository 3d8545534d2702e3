//! Ember Transient Arena
//!
//! Frame-pipelined allocation of short-lived GPU-visible memory: per-draw
//! parameter blocks and scratch vertex/index bytes, handed out freely every
//! frame and reclaimed only once the frame's fence confirms the GPU is done
//! reading them. Three cooperating pieces:
//!
//! - [`FenceTracker`]: N rotating frame fences; the only place that blocks
//! - [`FrameSlotSet`]: rotating generations of size-classed buffer caches
//! - [`RingAllocator`]: circular bump allocator for scratch geometry
//!
//! [`TransientArena`] owns all three and is the type most callers use:
//!
//! ```
//! use std::sync::Arc;
//! use ember_arena::{ArenaConfig, TransientArena};
//! use ember_gpu::{DeviceBackend, HeadlessDevice};
//!
//! let device = Arc::new(HeadlessDevice::new());
//! let mut arena = TransientArena::new(device.clone(), &ArenaConfig::default());
//!
//! arena.begin_frame()?;
//! let block = arena.allocate_params(96)?;
//! device.write_buffer(block.buffer, 0, &[0u8; 96]);
//! arena.end_frame();
//! # Ok::<(), ember_arena::ArenaError>(())
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod fence;
pub mod frame_slots;
pub mod ring;
pub mod size_class;

pub use arena::TransientArena;
pub use config::ArenaConfig;
pub use error::ArenaError;
pub use fence::FenceTracker;
pub use frame_slots::FrameSlotSet;
pub use ring::{RingAllocator, ScratchAlloc};
pub use size_class::{CacheStats, PooledBuffer, SizeClassCache, MAX_ALLOC};
