//! A pollable readiness descriptor for a ring, and the listener that turns its readiness into
//! messages for the ring's owner.

use async_channel::{Sender, TrySendError};
use std::{
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};
use tokio::io::unix::AsyncFd;
use tracing::trace;

/// A non-blocking `eventfd` that becomes readable when the ring posts completions.
#[derive(Debug)]
pub struct EventFd {
    /// The owned descriptor.
    fd: OwnedFd,
}

/// A readiness message sent to the owner of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The number of times the descriptor was signaled since the previous message. Zero means the
    /// wake-up was spurious.
    pub signals: u64,
}

impl EventFd {
    /// Creates a new non-blocking, close-on-exec `eventfd` with a zero counter.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the descriptor cannot be created.
    pub fn new() -> io::Result<Self> {
        // Safety: `eventfd` has no memory-safety preconditions.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        // Safety: `fd` was just returned by `eventfd` and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Reads and resets the counter, returning the number of signals since the last reset.
    ///
    /// Returns 0 if the counter was already zero.
    ///
    /// # Errors
    ///
    /// Returns the OS error for anything other than `EAGAIN`.
    pub fn reset(&self) -> io::Result<u64> {
        let mut value = 0u64;

        // Safety: `value` is a valid, writable 8-byte location for the duration of the call.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(value)
    }

    /// Signals the descriptor once, as the kernel does when it posts a completion.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the write fails.
    pub fn signal(&self) -> io::Result<()> {
        let value = 1u64;

        // Safety: `value` is a valid, readable 8-byte location for the duration of the call.
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&value as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits for the descriptor to become readable and forwards a [`Readiness`] message for each
    /// wake-up, until the receiving side is closed.
    ///
    /// This `Future` never touches the ring. It must run on a `tokio` runtime with I/O enabled.
    /// Wake-ups that arrive while a message is still queued are coalesced into it, since the
    /// owner drains the whole completion queue on every message.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be registered with the reactor or cannot be read.
    pub async fn forward_readiness(self, tx: Sender<Readiness>) -> io::Result<()> {
        let async_fd = AsyncFd::new(self)?;

        loop {
            let mut guard = async_fd.readable().await?;
            let signals = guard.get_inner().reset()?;
            guard.clear_ready();

            trace!(signals, "eventfd readable");
            match tx.try_send(Readiness { signals }) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Closed(_)) => return Ok(()),
            }
        }
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
