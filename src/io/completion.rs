//! Completion records handed back by the ring.

use super::op::{OpKind, Token};
use crate::registry::{FileSlot, RegisteredBuffer};
use std::{
    fmt::{self, Display},
    io,
};

/// Identifies one chain staged on a ring. Ids are never reused for the lifetime of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId(pub u64);

impl Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain {}", self.0)
    }
}

/// The classified result of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The operation succeeded. Holds the byte count for reads and writes, and 0 otherwise.
    Done(u32),
    /// The operation itself failed with the given `errno`.
    Failed(i32),
    /// The operation was not attempted because an earlier operation of its chain failed.
    Canceled,
}

/// The asynchronous result record for one submitted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// The raw kernel result: a negated `errno`, or a non-negative byte count / success marker.
    pub result: i32,
    /// The token the request carried.
    pub token: Token,
    /// The kind of operation that completed.
    pub kind: OpKind,
    /// The registered buffer the operation used, for reads and writes.
    pub buffer: Option<RegisteredBuffer>,
    /// The file slot the operation targeted, if any.
    pub slot: Option<FileSlot>,
    /// The chain the operation belonged to.
    pub chain: ChainId,
    /// The operation's position within its chain.
    pub position: usize,
    /// Whether an earlier operation of the same chain already failed.
    pub(crate) upstream_failed: bool,
}

impl Completion {
    /// Classifies the result.
    ///
    /// A result of `-ECANCELED` is only reported as [`Outcome::Canceled`] when an earlier
    /// operation in the same chain has already failed. Otherwise it is this operation's own
    /// failure, and it is reported as [`Outcome::Failed`].
    pub fn outcome(&self) -> Outcome {
        if self.result >= 0 {
            Outcome::Done(self.result as u32)
        } else if self.result == -libc::ECANCELED && self.upstream_failed {
            Outcome::Canceled
        } else {
            Outcome::Failed(-self.result)
        }
    }

    /// Returns true if the operation was skipped because its chain was aborted upstream.
    pub fn is_canceled(&self) -> bool {
        self.outcome() == Outcome::Canceled
    }

    /// Returns true if the operation itself failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.outcome(), Outcome::Failed(_))
    }

    /// The number of bytes transferred, if the operation succeeded.
    pub fn bytes(&self) -> Option<usize> {
        match self.outcome() {
            Outcome::Done(n) => Some(n as usize),
            _ => None,
        }
    }

    /// The operation's own error, if it failed.
    pub fn error(&self) -> Option<io::Error> {
        match self.outcome() {
            Outcome::Failed(errno) => Some(io::Error::from_raw_os_error(errno)),
            _ => None,
        }
    }
}

impl Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} (position {}, token {})",
            self.kind, self.chain, self.position, self.token
        )?;
        match self.outcome() {
            Outcome::Done(n) => write!(f, " done: {n}"),
            Outcome::Canceled => write!(f, " canceled"),
            Outcome::Failed(errno) => {
                write!(f, " failed: {}", io::Error::from_raw_os_error(errno))
            }
        }
    }
}
