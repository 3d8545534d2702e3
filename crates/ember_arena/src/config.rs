//! Arena tuning knobs

use serde::{Deserialize, Serialize};

/// Configuration for a [`TransientArena`](crate::TransientArena).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArenaConfig {
    /// Number of rotating frame fences. Must be a power of two; the CPU may
    /// run at most this many frames ahead of the GPU.
    pub frames_in_flight: u32,

    /// Number of parameter-block cache generations. May differ from
    /// `frames_in_flight`; smaller values trade memory for an occasional
    /// blocking wait when every generation is still on the GPU.
    pub param_generations: usize,

    /// Byte size of the scratch ring backing buffer.
    pub scratch_bytes: u32,

    /// How many blocking polls the fence tracker attempts before declaring
    /// the device lost. Injectable so tests can force both outcomes.
    pub fence_retry_budget: u32,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 4,
            param_generations: 3,
            scratch_bytes: 256 * 1024,
            fence_retry_budget: 64,
        }
    }
}

impl ArenaConfig {
    /// Panics if the configuration is unusable. Called at arena
    /// construction; misconfiguration is a programmer error.
    pub fn validate(&self) {
        assert!(
            self.frames_in_flight.is_power_of_two(),
            "frames_in_flight must be a power of two, got {}",
            self.frames_in_flight
        );
        assert!(self.param_generations > 0, "need at least one parameter generation");
        assert!(self.scratch_bytes > 0, "scratch ring cannot be empty");
        assert!(self.fence_retry_budget > 0, "fence retry budget cannot be zero");
    }
}
