//! Error types for ring setup, staging, submission and resource registration.
//!
//! Note that errors of individual operations are _not_ represented here. A failed `openat` or a
//! short read is reported through the completion stream (see
//! [`Completion::outcome`](crate::io::Completion::outcome)), never as an `Err` from the ring.

use crate::registry::{FileSlot, RegisteredBuffer};
use std::{ffi::NulError, io};

/// The largest submission queue the kernel accepts (`IORING_MAX_ENTRIES`).
pub const MAX_QUEUE_DEPTH: u32 = 1 << 15;

/// Errors that can occur while setting up or driving a [`Ring`](crate::io::Ring).
#[derive(Debug, thiserror::Error)]
pub enum RingError {
    /// The requested queue depth is zero or larger than the kernel allows.
    #[error("Invalid queue depth {requested} (must be between 1 and {max})")]
    CapacityInvalid {
        /// The depth that was asked for.
        requested: u32,
        /// The largest depth the kernel accepts.
        max: u32,
    },

    /// The kernel refused to create the ring.
    #[error("Failed to create io_uring ring: {0}")]
    Setup(#[source] io::Error),

    /// Registering files, buffers, or an eventfd with the kernel failed.
    #[error("Failed to register {what} with the ring: {source}")]
    Registration {
        /// The kind of resource that was being registered.
        what: &'static str,
        /// The error returned by the kernel.
        #[source]
        source: io::Error,
    },

    /// Staging a chain would overflow the submission queue or the completion queue.
    #[error("Queue full: chain of {needed} entries does not fit ({available} available)")]
    QueueFull {
        /// The number of entries the chain needs.
        needed: usize,
        /// The number of entries that could still be staged.
        available: usize,
    },

    /// Flushing the submission queue failed.
    #[error("Submission failed: {0}")]
    SubmitFailed(#[source] io::Error),

    /// Waiting for completions failed.
    #[error("Wait for completions failed: {0}")]
    WaitFailed(#[source] io::Error),

    /// A blocking consume asked for more completions than there are operations in flight.
    #[error("Waited for {wanted} completions but only {delivered} could ever arrive")]
    Starved {
        /// The number of completions the caller asked for.
        wanted: usize,
        /// The number delivered before the ring ran dry.
        delivered: usize,
    },

    /// A registry table has no room left.
    #[error("{resource} exhausted: requested {requested}, {available} available")]
    ResourceExhausted {
        /// Which table ran out.
        resource: &'static str,
        /// How many entries were requested.
        requested: usize,
        /// How many entries were still free.
        available: usize,
    },

    /// A memory region cannot be registered.
    #[error("Invalid buffer region {index}: {reason}")]
    InvalidBuffer {
        /// The position of the offending region in the caller's input.
        index: usize,
        /// Why the region was rejected.
        reason: InvalidBufferReason,
    },

    /// Buffers cannot be re-registered while operations still reference them.
    #[error("Cannot re-register buffers while {0} operations reference them")]
    BuffersInUse(usize),

    /// The ring already has an eventfd registered.
    #[error("An eventfd is already registered with this ring")]
    EventFdAlreadyRegistered,

    /// A chain must hold at least two operations.
    #[error("A linked chain needs at least 2 operations, got {0}")]
    InvalidChain(usize),

    /// A request references a file slot this ring never handed out.
    #[error("Unknown file slot {0:?}")]
    UnknownSlot(FileSlot),

    /// A request references a buffer this ring never registered.
    #[error("Unknown registered buffer {0:?}")]
    UnknownBuffer(RegisteredBuffer),

    /// The buffer is currently owned by an in-flight operation.
    #[error("Registered buffer {0:?} is in use by an in-flight operation")]
    BufferBusy(RegisteredBuffer),

    /// A read or write asks for more bytes than its buffer holds.
    #[error("Requested {requested} bytes from {buffer:?} which holds {capacity}")]
    InvalidLength {
        /// The buffer the request targets.
        buffer: RegisteredBuffer,
        /// The requested transfer length.
        requested: usize,
        /// The buffer's length.
        capacity: usize,
    },

    /// A path contains an interior NUL byte.
    #[error("Invalid path: {0}")]
    InvalidPath(#[from] NulError),
}

/// The reason a buffer region was rejected by the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidBufferReason {
    /// The region has no bytes.
    #[error("region has zero length")]
    ZeroLength,
    /// The region extends past the end of its backing allocation.
    #[error("range {start}..{end} exceeds allocation of {len} bytes")]
    OutOfBounds {
        /// Start of the range.
        start: usize,
        /// End of the range.
        end: usize,
        /// Length of the backing allocation.
        len: usize,
    },
    /// The region overlaps another region of the same allocation.
    #[error("region overlaps region {other}")]
    Overlap {
        /// The input position of the region it overlaps.
        other: usize,
    },
    /// The kernel cannot register a single region this large.
    #[error("region of {0} bytes exceeds the 1 GiB registration limit")]
    TooLarge(usize),
}

impl RingError {
    /// Returns true for errors raised while creating the ring or registering its resources.
    ///
    /// These are fatal to the caller: nothing was submitted, and retrying will not help.
    #[must_use]
    pub const fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::CapacityInvalid { .. }
                | Self::Setup(_)
                | Self::Registration { .. }
                | Self::ResourceExhausted { .. }
                | Self::InvalidBuffer { .. }
                | Self::EventFdAlreadyRegistered
        )
    }

    /// Returns true if the kernel or a sandbox refused `io_uring` itself (`ENOSYS`, `EPERM`,
    /// `EACCES`), as opposed to the ring rejecting a particular request.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        let source = match self {
            Self::Setup(source) | Self::Registration { source, .. } => source,
            _ => return false,
        };
        matches!(
            source.raw_os_error(),
            Some(libc::ENOSYS | libc::EPERM | libc::EACCES)
        )
    }

    /// Returns true if the condition clears once in-flight operations complete.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::BufferBusy(_) | Self::BuffersInUse(_)
        )
    }
}
