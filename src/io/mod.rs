//! Linked file I/O on top of the linux `io_uring` interface.
//!
//! A [`Ring`] owns the kernel queues together with its registered file slots and buffers. Callers
//! build [`RequestChain`]s, stage them with [`Ring::prepare`], flush with [`Ring::submit`], and
//! collect [`Completion`]s either by polling or by blocking.

mod completion;
mod config;
mod eventfd;
pub(crate) mod op;
mod ring;

pub use completion::{ChainId, Completion, Outcome};
pub use config::{RingConfig, RingFlags, MAX_REGISTERED_BUFFERS};
pub use eventfd::{EventFd, Readiness};
pub use op::{
    AccessMode, CreationFlags, DirRef, OpKind, Operation, Permissions, Request, RequestChain,
    Token,
};
pub use ring::Ring;
