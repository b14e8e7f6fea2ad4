//! Requests and linked request chains.
//!
//! Building a [`RequestChain`] is pure data assembly. Nothing touches the kernel until the chain is
//! handed to [`Ring::prepare`](super::Ring::prepare), which validates it against the ring's
//! registry and translates each [`Request`] into a submission queue entry.
//!
//! The kernel executes the requests of one chain strictly in order. On the first failure (a
//! negative result, or a short read or write) every remaining request of that chain completes
//! with `-ECANCELED` instead of running.
//!
//! A failed unlink is the exception: it does not cancel the requests linked after it, which run
//! and report their own results.

use crate::error::RingError;
use crate::registry::{FileSlot, RegisteredBuffer, ResourceRegistry};
use io_uring::{opcode, squeue::Entry as SqEntry, types};
use std::{
    ffi::CString,
    fmt::{self, Display},
    os::{fd::RawFd, unix::ffi::OsStrExt},
    path::{Path, PathBuf},
};

/// An opaque value attached to a request and echoed back on its completion.
///
/// [`Token::NONE`] means "no payload of interest".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token(pub u64);

impl Token {
    /// The token carried by requests that nobody needs to correlate.
    pub const NONE: Token = Token(0);

    /// Returns true if this is [`Token::NONE`].
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The directory a relative path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirRef {
    /// The process's current working directory (`AT_FDCWD`).
    #[default]
    Cwd,
    /// An open directory descriptor owned by the caller, which must stay open until the request
    /// completes.
    Fd(RawFd),
}

impl DirRef {
    fn fd(self) -> types::Fd {
        match self {
            DirRef::Cwd => types::Fd(libc::AT_FDCWD),
            DirRef::Fd(fd) => types::Fd(fd),
        }
    }
}

/// How an opened file may be accessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// `O_RDONLY`.
    #[default]
    ReadOnly,
    /// `O_WRONLY`.
    WriteOnly,
    /// `O_RDWR`.
    ReadWrite,
}

impl AccessMode {
    fn bits(self) -> i32 {
        match self {
            AccessMode::ReadOnly => libc::O_RDONLY,
            AccessMode::WriteOnly => libc::O_WRONLY,
            AccessMode::ReadWrite => libc::O_RDWR,
        }
    }
}

bitflags::bitflags! {
    /// Flags that control how an Open creates or truncates its file.
    pub struct CreationFlags: i32 {
        /// Create the file if it does not exist (`O_CREAT`).
        const CREATE = libc::O_CREAT;
        /// Fail if the file already exists (`O_EXCL`).
        const EXCLUSIVE = libc::O_EXCL;
        /// Truncate an existing file to zero length (`O_TRUNC`).
        const TRUNCATE = libc::O_TRUNC;
        /// Append every write (`O_APPEND`).
        const APPEND = libc::O_APPEND;
    }
}

/// Permission bits for a newly created file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions(pub libc::mode_t);

impl Permissions {
    /// `0o600`.
    pub const OWNER_READ_WRITE: Permissions = Permissions(0o600);
    /// `0o644`.
    pub const OWNER_READ_WRITE_ALL_READ: Permissions = Permissions(0o644);
}

impl Default for Permissions {
    fn default() -> Self {
        Permissions(0)
    }
}

/// The kind of an operation, as reported on its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Open a path into a file slot.
    Open,
    /// Write a registered buffer into a file slot.
    Write,
    /// Read a file slot into a registered buffer.
    Read,
    /// Close the file in a file slot.
    Close,
    /// Remove a path.
    Unlink,
}

impl Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Open => "open",
            OpKind::Write => "write",
            OpKind::Read => "read",
            OpKind::Close => "close",
            OpKind::Unlink => "unlink",
        };
        f.write_str(name)
    }
}

/// A single file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Open `path` (relative to `dir`) and install the file into `slot`.
    Open {
        /// The path to open.
        path: PathBuf,
        /// The directory `path` is resolved against.
        dir: DirRef,
        /// The slot the opened file is installed into.
        slot: FileSlot,
        /// The access mode.
        access: AccessMode,
        /// Creation flags.
        creation: CreationFlags,
        /// Permissions, used only when the file is created.
        permissions: Permissions,
    },
    /// Write `len` bytes of `buffer` into the file in `slot` at `offset`.
    Write {
        /// The source buffer.
        buffer: RegisteredBuffer,
        /// The destination slot.
        slot: FileSlot,
        /// Number of bytes, or the whole buffer if `None`.
        len: Option<u32>,
        /// Offset into the file.
        offset: u64,
    },
    /// Read `len` bytes from the file in `slot` at `offset` into `buffer`.
    Read {
        /// The source slot.
        slot: FileSlot,
        /// The destination buffer.
        buffer: RegisteredBuffer,
        /// Number of bytes, or the whole buffer if `None`.
        len: Option<u32>,
        /// Offset into the file.
        offset: u64,
    },
    /// Close the file in `slot`, leaving the slot unbound.
    Close {
        /// The slot to close.
        slot: FileSlot,
    },
    /// Remove `path` (relative to `dir`).
    Unlink {
        /// The path to remove.
        path: PathBuf,
        /// The directory `path` is resolved against.
        dir: DirRef,
    },
}

impl Operation {
    /// The kind of this operation.
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Open { .. } => OpKind::Open,
            Operation::Write { .. } => OpKind::Write,
            Operation::Read { .. } => OpKind::Read,
            Operation::Close { .. } => OpKind::Close,
            Operation::Unlink { .. } => OpKind::Unlink,
        }
    }

    /// The file slot this operation targets, if any.
    pub fn slot(&self) -> Option<FileSlot> {
        match self {
            Operation::Open { slot, .. }
            | Operation::Write { slot, .. }
            | Operation::Read { slot, .. }
            | Operation::Close { slot } => Some(*slot),
            Operation::Unlink { .. } => None,
        }
    }

    /// The registered buffer this operation reads from or writes into, if any.
    pub fn buffer(&self) -> Option<RegisteredBuffer> {
        match self {
            Operation::Write { buffer, .. } | Operation::Read { buffer, .. } => Some(*buffer),
            _ => None,
        }
    }

    fn path(&self) -> Option<&Path> {
        match self {
            Operation::Open { path, .. } | Operation::Unlink { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Checks the operation against the registry and returns the transfer length (for reads and
    /// writes) and the NUL-terminated path (for opens and unlinks).
    pub(crate) fn validate(
        &self,
        registry: &ResourceRegistry,
    ) -> Result<(Option<u32>, Option<CString>), RingError> {
        if let Some(slot) = self.slot() {
            if !registry.slots.contains(slot) {
                return Err(RingError::UnknownSlot(slot));
            }
        }

        let transfer = match self {
            Operation::Write { buffer, len, .. } | Operation::Read { buffer, len, .. } => {
                let capacity = registry
                    .buffers
                    .len_of(*buffer)
                    .ok_or(RingError::UnknownBuffer(*buffer))?;
                let requested = len.map_or(capacity, |len| len as usize);
                if requested > capacity || requested > u32::MAX as usize {
                    return Err(RingError::InvalidLength {
                        buffer: *buffer,
                        requested,
                        capacity,
                    });
                }
                Some(requested as u32)
            }
            _ => None,
        };

        let path = self
            .path()
            .map(|path| CString::new(path.as_os_str().as_bytes()))
            .transpose()?;

        Ok((transfer, path))
    }

    /// Translates the operation into a submission queue entry.
    ///
    /// The caller must have validated the operation, and must keep `path` alive (and the
    /// referenced buffer pinned) until the entry completes.
    pub(crate) fn build(
        &self,
        registry: &mut ResourceRegistry,
        transfer: Option<u32>,
        path: Option<&CString>,
    ) -> Result<SqEntry, RingError> {
        let path_ptr = path.map_or(std::ptr::null(), |p| p.as_ptr());
        let len = transfer.unwrap_or(0);

        let entry = match self {
            Operation::Open {
                dir,
                slot,
                access,
                creation,
                permissions,
                ..
            } => {
                let destination = types::DestinationSlot::try_from_slot_target(slot.0)
                    .map_err(|_| RingError::UnknownSlot(*slot))?;
                opcode::OpenAt::new(dir.fd(), path_ptr)
                    .file_index(Some(destination))
                    .flags(access.bits() | creation.bits())
                    .mode(permissions.0)
                    .build()
            }
            Operation::Write {
                buffer,
                slot,
                offset,
                ..
            } => {
                let ptr = registry.buffers.as_mut_ptr(*buffer);
                opcode::WriteFixed::new(types::Fixed(slot.0), ptr.cast_const(), len, buffer.0)
                    .offset(*offset)
                    .build()
            }
            Operation::Read {
                slot,
                buffer,
                offset,
                ..
            } => {
                let ptr = registry.buffers.as_mut_ptr(*buffer);
                opcode::ReadFixed::new(types::Fixed(slot.0), ptr, len, buffer.0)
                    .offset(*offset)
                    .build()
            }
            Operation::Close { slot } => opcode::Close::new(types::Fixed(slot.0)).build(),
            Operation::Unlink { dir, .. } => opcode::UnlinkAt::new(dir.fd(), path_ptr).build(),
        };

        Ok(entry)
    }
}

/// An [`Operation`] together with its correlation [`Token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// The operation to perform.
    pub op: Operation,
    /// The token echoed back on this request's completion.
    pub token: Token,
}

impl Request {
    fn new(op: Operation) -> Self {
        Self {
            op,
            token: Token::NONE,
        }
    }

    /// Opens `path` read-only in the working directory into `slot`. Adjust with
    /// [`in_dir`](Self::in_dir), [`access`](Self::access), [`creation`](Self::creation) and
    /// [`permissions`](Self::permissions).
    pub fn open(path: impl Into<PathBuf>, slot: FileSlot) -> Self {
        Self::new(Operation::Open {
            path: path.into(),
            dir: DirRef::Cwd,
            slot,
            access: AccessMode::ReadOnly,
            creation: CreationFlags::empty(),
            permissions: Permissions::default(),
        })
    }

    /// Writes the whole of `buffer` into `slot` at offset 0.
    pub fn write(buffer: RegisteredBuffer, slot: FileSlot) -> Self {
        Self::new(Operation::Write {
            buffer,
            slot,
            len: None,
            offset: 0,
        })
    }

    /// Reads from `slot` at offset 0 into the whole of `buffer`.
    pub fn read(slot: FileSlot, buffer: RegisteredBuffer) -> Self {
        Self::new(Operation::Read {
            slot,
            buffer,
            len: None,
            offset: 0,
        })
    }

    /// Closes the file in `slot`.
    pub fn close(slot: FileSlot) -> Self {
        Self::new(Operation::Close { slot })
    }

    /// Removes `path` from the working directory.
    pub fn unlink(path: impl Into<PathBuf>) -> Self {
        Self::new(Operation::Unlink {
            path: path.into(),
            dir: DirRef::Cwd,
        })
    }

    /// Attaches a correlation token.
    #[must_use]
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    /// Resolves the path of an Open or Unlink against `dir`. Has no effect on other operations.
    #[must_use]
    pub fn in_dir(mut self, dir: DirRef) -> Self {
        if let Operation::Open { dir: d, .. } | Operation::Unlink { dir: d, .. } = &mut self.op {
            *d = dir;
        }
        self
    }

    /// Sets the access mode of an Open.
    #[must_use]
    pub fn access(mut self, access: AccessMode) -> Self {
        if let Operation::Open { access: a, .. } = &mut self.op {
            *a = access;
        }
        self
    }

    /// Sets the creation flags of an Open.
    #[must_use]
    pub fn creation(mut self, creation: CreationFlags) -> Self {
        if let Operation::Open { creation: c, .. } = &mut self.op {
            *c = creation;
        }
        self
    }

    /// Sets the permissions of an Open.
    #[must_use]
    pub fn permissions(mut self, permissions: Permissions) -> Self {
        if let Operation::Open { permissions: p, .. } = &mut self.op {
            *p = permissions;
        }
        self
    }

    /// Limits a Read or Write to `len` bytes.
    ///
    /// A linked read that returns fewer bytes than requested breaks its chain, so reads followed
    /// by other requests should ask for exactly the bytes the file holds.
    #[must_use]
    pub fn len(mut self, len: u32) -> Self {
        if let Operation::Read { len: l, .. } | Operation::Write { len: l, .. } = &mut self.op {
            *l = Some(len);
        }
        self
    }

    /// Sets the file offset of a Read or Write.
    #[must_use]
    pub fn offset(mut self, offset: u64) -> Self {
        if let Operation::Read { offset: o, .. } | Operation::Write { offset: o, .. } = &mut self.op
        {
            *o = offset;
        }
        self
    }
}

/// An ordered, short-circuiting sequence of requests submitted together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestChain {
    /// The requests, in execution order.
    requests: Vec<Request>,
}

impl RequestChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a request to the end of the chain.
    #[must_use]
    pub fn then(mut self, request: Request) -> Self {
        self.requests.push(request);
        self
    }

    /// Appends a request to the end of the chain.
    pub fn push(&mut self, request: Request) {
        self.requests.push(request);
    }

    /// The number of requests in the chain.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Returns true if the chain holds no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The requests, in execution order.
    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub(crate) fn into_requests(self) -> Vec<Request> {
        self.requests
    }
}

impl FromIterator<Request> for RequestChain {
    fn from_iter<I: IntoIterator<Item = Request>>(iter: I) -> Self {
        Self {
            requests: iter.into_iter().collect(),
        }
    }
}
