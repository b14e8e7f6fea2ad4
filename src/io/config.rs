//! Configuration types for creating a [`Ring`](super::Ring).

use crate::error::{RingError, MAX_QUEUE_DEPTH};

/// The most buffers the kernel lets a single ring register (`IORING_MAX_REG_BUFFERS`).
pub const MAX_REGISTERED_BUFFERS: usize = 1 << 14;

bitflags::bitflags! {
    /// Optional ring setup behaviour.
    pub struct RingFlags: u32 {
        /// Promise the kernel that only the creating thread submits (`IORING_SETUP_SINGLE_ISSUER`).
        const SINGLE_ISSUER = 1 << 0;
        /// Run completion task work cooperatively (`IORING_SETUP_COOP_TASKRUN`).
        const COOP_TASKRUN = 1 << 1;
        /// Clamp an oversized depth instead of failing (`IORING_SETUP_CLAMP`).
        const CLAMP = 1 << 2;
    }
}

/// Configuration for a single ring and its resource tables.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Number of submission queue entries. The kernel rounds this up to a power of two and sizes
    /// the completion queue at twice that.
    ///
    /// This must exceed the largest number of operations that will be in flight at once.
    pub queue_depth: u32,
    /// Setup flags.
    pub flags: RingFlags,
    /// Number of slots in the direct descriptor table. The table is registered sparse when the
    /// ring is created, so this is bounded by `RLIMIT_NOFILE`.
    pub file_slots: u32,
    /// Maximum number of buffers that may be registered.
    pub max_buffers: usize,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            flags: RingFlags::empty(),
            file_slots: 64,
            max_buffers: 1024,
        }
    }
}

impl RingConfig {
    /// Creates a configuration with the given depth and default tables.
    #[must_use]
    pub fn new(queue_depth: u32) -> Self {
        Self {
            queue_depth,
            ..Default::default()
        }
    }

    /// Sets the setup flags.
    #[must_use]
    pub fn with_flags(mut self, flags: RingFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the size of the direct descriptor table.
    #[must_use]
    pub fn with_file_slots(mut self, file_slots: u32) -> Self {
        self.file_slots = file_slots;
        self
    }

    /// Sets the maximum number of registered buffers.
    #[must_use]
    pub fn with_max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = max_buffers;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::CapacityInvalid`] if the depth is zero or too large, and
    /// [`RingError::ResourceExhausted`] if more buffers are requested than the kernel allows.
    pub fn validate(&self) -> Result<(), RingError> {
        if self.queue_depth == 0
            || (self.queue_depth > MAX_QUEUE_DEPTH && !self.flags.contains(RingFlags::CLAMP))
        {
            return Err(RingError::CapacityInvalid {
                requested: self.queue_depth,
                max: MAX_QUEUE_DEPTH,
            });
        }

        if self.max_buffers > MAX_REGISTERED_BUFFERS {
            return Err(RingError::ResourceExhausted {
                resource: "registered buffer table",
                requested: self.max_buffers,
                available: MAX_REGISTERED_BUFFERS,
            });
        }

        Ok(())
    }
}
