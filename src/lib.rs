//! Linked file I/O over `io_uring`: a ring engine with registered file slots and buffers, chains
//! of requests that abort together, and a dispatcher that counts completions phase by phase.

#![cfg(target_os = "linux")]
#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(clippy::missing_errors_doc)]
#![warn(clippy::missing_panics_doc)]
#![warn(clippy::missing_safety_doc)]

pub mod baseline;
pub mod dispatch;
pub mod error;
pub mod io;
pub mod registry;
pub mod scenario;
pub mod verify;

pub use error::RingError;
pub use io::Ring;
