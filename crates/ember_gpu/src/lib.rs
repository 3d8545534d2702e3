//! Ember GPU Device Boundary
//!
//! Defines the narrow device interface the transient allocators are written
//! against: opaque fence and buffer handles plus the [`DeviceBackend`] trait.
//! Real graphics backends implement the trait on top of their native fence
//! and buffer objects; [`HeadlessDevice`] implements it entirely in memory
//! for tests and headless tools.

pub mod backend;
pub mod headless;

pub use backend::{BufferHandle, DeviceBackend, FenceHandle};
pub use headless::HeadlessDevice;
