use super::completion::{ChainId, Completion};
use super::config::{RingConfig, RingFlags};
use super::op::{OpKind, RequestChain, Token};
use crate::error::RingError;
use crate::registry::{BufferTable, FileSlot, RegisteredBuffer, ResourceRegistry, SlotState};
use derivative::Derivative;
use io_uring::{cqueue, squeue, IoUring};
use slab::Slab;
use std::{
    ffi::CString,
    ops::Range,
    os::fd::{AsRawFd, RawFd},
};
use tracing::{debug, error, trace, warn};

/// `IORING_ENTER_GETEVENTS`: wait for completions inside `io_uring_enter`.
const ENTER_GETEVENTS: u32 = 1;

/// The state of a single staged or submitted operation.
#[derive(Debug)]
struct InFlight {
    /// The token echoed back on the completion.
    token: Token,
    /// The kind of the operation.
    kind: OpKind,
    /// The file slot the operation targets.
    slot: Option<FileSlot>,
    /// The registered buffer the operation owns until it completes.
    buffer: Option<RegisteredBuffer>,
    /// The number of bytes a read or write asked for. Anything less breaks the chain.
    transfer: Option<u32>,
    /// The key of the owning chain in the chain table.
    chain: usize,
    /// The position of the operation within its chain.
    position: usize,
    /// The path handed to the kernel, kept alive until the operation completes.
    _path: Option<CString>,
}

/// The state of a chain with operations still in flight.
#[derive(Debug)]
struct ChainTrack {
    /// The public id of the chain.
    id: ChainId,
    /// The number of operations whose completions have not been observed yet.
    remaining: usize,
    /// The position of the first operation that failed, if any.
    failed_at: Option<usize>,
}

/// A submission/completion queue pair plus its registered file slots and buffers.
///
/// Every queue operation takes `&mut self`, so a `Ring` has exactly one owner at a time: one
/// thread, or one task on a single-threaded runtime. Submission and completion are decoupled:
/// [`submit`](Self::submit) never waits for results, and all waiting is explicit through
/// [`try_consume_completion`](Self::try_consume_completion) or
/// [`blocking_consume_completions`](Self::blocking_consume_completions).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Ring {
    /// The kernel ring. Declared before the registry so it is closed before buffer memory is
    /// freed.
    #[derivative(Debug = "ignore")]
    uring: IoUring,
    /// File slots and pinned buffers.
    registry: ResourceRegistry,
    /// Every staged or submitted operation, keyed by the user data of its submission entry.
    operations: Slab<InFlight>,
    /// Every chain with operations in flight.
    chains: Slab<ChainTrack>,
    /// The id handed to the next staged chain.
    next_chain: u64,
    /// The depth the ring was created with.
    queue_depth: u32,
    /// Whether the kernel currently has our buffers registered.
    buffers_registered: bool,
    /// Whether an eventfd is registered.
    event_fd_registered: bool,
}

impl Ring {
    /// Creates a ring with the given depth and flags and the default resource tables.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::CapacityInvalid`] for a zero or oversized depth, or
    /// [`RingError::Setup`] if the kernel refuses to create the ring.
    pub fn new(queue_depth: u32, flags: RingFlags) -> Result<Self, RingError> {
        Self::with_config(RingConfig::new(queue_depth).with_flags(flags))
    }

    /// Creates a ring from a full configuration, registering a sparse file slot table of
    /// `config.file_slots` entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the kernel refuses to create the ring, or
    /// the file slot table cannot be registered.
    pub fn with_config(config: RingConfig) -> Result<Self, RingError> {
        config.validate()?;

        let mut builder = IoUring::<squeue::Entry, cqueue::Entry>::builder();
        if config.flags.contains(RingFlags::SINGLE_ISSUER) {
            builder.setup_single_issuer();
        }
        if config.flags.contains(RingFlags::COOP_TASKRUN) {
            builder.setup_coop_taskrun();
        }
        if config.flags.contains(RingFlags::CLAMP) {
            builder.setup_clamp();
        }

        let uring: IoUring = builder
            .build(config.queue_depth)
            .map_err(RingError::Setup)?;

        if config.file_slots > 0 {
            // A descriptor of -1 leaves the slot empty until an Open installs a file into it.
            let sparse = vec![-1; config.file_slots as usize];
            uring
                .submitter()
                .register_files(&sparse)
                .map_err(|source| RingError::Registration {
                    what: "file slot table",
                    source,
                })?;
        }

        debug!(
            queue_depth = config.queue_depth,
            sq_entries = uring.params().sq_entries(),
            cq_entries = uring.params().cq_entries(),
            file_slots = config.file_slots,
            "created ring"
        );

        Ok(Self {
            uring,
            registry: ResourceRegistry::new(config.file_slots, config.max_buffers),
            operations: Slab::with_capacity(config.queue_depth as usize),
            chains: Slab::new(),
            next_chain: 0,
            queue_depth: config.queue_depth,
            buffers_registered: false,
            event_fd_registered: false,
        })
    }

    /// Hands out `count` unbound file slots from the ring's slot table.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::ResourceExhausted`] if the table has fewer than `count` slots left.
    pub fn register_file_slots(&mut self, count: usize) -> Result<Vec<FileSlot>, RingError> {
        self.registry.slots.allocate(count)
    }

    /// Takes ownership of each region and registers it as its own pinned buffer.
    ///
    /// The returned handles are in the same order as the input. The memory stays allocated, at a
    /// fixed address, until the ring is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidBuffer`] for an empty region, [`RingError::ResourceExhausted`]
    /// if the buffer table is full, [`RingError::BuffersInUse`] if any registered buffer is
    /// referenced by an in-flight operation, and [`RingError::Registration`] if the kernel refuses
    /// the buffers. Nothing is registered on error.
    pub fn register_buffers(
        &mut self,
        regions: impl IntoIterator<Item = Box<[u8]>>,
    ) -> Result<Vec<RegisteredBuffer>, RingError> {
        self.ensure_buffers_idle()?;
        let mark = self.registry.buffers.mark();
        let handles = self
            .registry
            .buffers
            .add_owned(regions.into_iter().collect())?;
        self.sync_buffers(mark)?;
        Ok(handles)
    }

    /// Takes ownership of one allocation and registers each range of it as a pinned buffer.
    ///
    /// # Errors
    ///
    /// As [`register_buffers`](Self::register_buffers). Additionally, ranges that are out of
    /// bounds or overlap each other are rejected with [`RingError::InvalidBuffer`].
    pub fn register_slab(
        &mut self,
        slab: Box<[u8]>,
        ranges: impl IntoIterator<Item = Range<usize>>,
    ) -> Result<Vec<RegisteredBuffer>, RingError> {
        self.ensure_buffers_idle()?;
        let mark = self.registry.buffers.mark();
        let handles = self
            .registry
            .buffers
            .add_slab(slab, ranges.into_iter().collect())?;
        self.sync_buffers(mark)?;
        Ok(handles)
    }

    fn ensure_buffers_idle(&self) -> Result<(), RingError> {
        match self.registry.buffers.total_in_flight() {
            0 => Ok(()),
            busy => Err(RingError::BuffersInUse(busy)),
        }
    }

    /// Replaces the kernel's buffer table with the registry's, rolling the registry back to
    /// `mark` if the kernel refuses.
    fn sync_buffers(&mut self, mark: (usize, usize)) -> Result<(), RingError> {
        let submitter = self.uring.submitter();
        if self.buffers_registered {
            submitter
                .unregister_buffers()
                .map_err(|source| RingError::Registration {
                    what: "buffers",
                    source,
                })?;
            self.buffers_registered = false;
        }

        let iovecs = self.registry.buffers.iovecs();

        // Safety: Every `iovec` points into an allocation owned by the registry. The registry
        // never frees or moves an allocation while the ring exists, and it is dropped only after
        // the kernel ring has been closed.
        let registered = unsafe { submitter.register_buffers(&iovecs) };

        match registered {
            Ok(()) => {
                self.buffers_registered = true;
                debug!(count = iovecs.len(), "registered buffers");
                Ok(())
            }
            Err(source) => {
                self.registry.buffers.truncate(mark);
                if mark.0 > 0 {
                    // Put the previous table back so existing handles keep working.
                    let previous = self.registry.buffers.iovecs();
                    // Safety: As above.
                    if unsafe { submitter.register_buffers(&previous) }.is_ok() {
                        self.buffers_registered = true;
                    }
                }
                Err(RingError::Registration {
                    what: "buffers",
                    source,
                })
            }
        }
    }

    /// Associates a readiness descriptor with the ring. The descriptor is signaled whenever the
    /// ring posts completions.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::EventFdAlreadyRegistered`] if one is already registered, or
    /// [`RingError::Registration`] if the kernel refuses it.
    pub fn register_event_fd(&mut self, event_fd: &impl AsRawFd) -> Result<(), RingError> {
        if self.event_fd_registered {
            return Err(RingError::EventFdAlreadyRegistered);
        }

        self.uring
            .submitter()
            .register_eventfd(event_fd.as_raw_fd())
            .map_err(|source| RingError::Registration {
                what: "eventfd",
                source,
            })?;

        self.event_fd_registered = true;
        Ok(())
    }

    /// Removes the registered readiness descriptor, if any.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::Registration`] if the kernel refuses.
    pub fn unregister_event_fd(&mut self) -> Result<(), RingError> {
        if !self.event_fd_registered {
            return Ok(());
        }

        self.uring
            .submitter()
            .unregister_eventfd()
            .map_err(|source| RingError::Registration {
                what: "eventfd",
                source,
            })?;

        self.event_fd_registered = false;
        Ok(())
    }

    /// Stages a chain on the submission queue without flushing it to the kernel.
    ///
    /// May be called repeatedly to accumulate several chains before one
    /// [`submit`](Self::submit). Every request but the last is linked to its successor. Either
    /// the whole chain is staged or none of it is.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::InvalidChain`] for chains of fewer than 2 requests, a registry error
    /// for requests that reference unknown slots or buffers, and [`RingError::QueueFull`] if the
    /// chain does not fit in the submission queue or would leave more operations in flight than
    /// the completion queue can hold.
    pub fn prepare(&mut self, chain: RequestChain) -> Result<ChainId, RingError> {
        let len = chain.len();
        if len < 2 {
            return Err(RingError::InvalidChain(len));
        }

        let requests = chain.into_requests();
        let mut validated = Vec::with_capacity(len);
        for request in &requests {
            validated.push(request.op.validate(&self.registry)?);
        }

        let available = self.free_entries();
        if len > available {
            return Err(RingError::QueueFull {
                needed: len,
                available,
            });
        }

        // Build every entry before touching any bookkeeping so a failure leaves nothing behind.
        let mut entries = Vec::with_capacity(len);
        for (request, (transfer, path)) in requests.iter().zip(&validated) {
            entries.push(request.op.build(&mut self.registry, *transfer, path.as_ref())?);
        }

        let id = ChainId(self.next_chain);
        self.next_chain += 1;
        let chain_key = self.chains.insert(ChainTrack {
            id,
            remaining: len,
            failed_at: None,
        });

        let last = len - 1;
        let mut linked = Vec::with_capacity(len);
        for (position, ((request, (transfer, path)), entry)) in requests
            .into_iter()
            .zip(validated)
            .zip(entries)
            .enumerate()
        {
            let slot = request.op.slot();
            let buffer = request.op.buffer();

            let key = self.operations.insert(InFlight {
                token: request.token,
                kind: request.op.kind(),
                slot,
                buffer,
                transfer,
                chain: chain_key,
                position,
                _path: path,
            });

            let entry = entry.user_data(key as u64);
            linked.push(if position < last {
                entry.flags(squeue::Flags::IO_LINK)
            } else {
                entry
            });

            if let Some(slot) = slot {
                if self.registry.slots.stage(slot, id.0) {
                    warn!(
                        slot = slot.index(),
                        %id,
                        "file slot reused before its previous close completed"
                    );
                }
            }
            if let Some(buffer) = buffer {
                self.registry.buffers.acquire(buffer);
            }
        }

        // Safety: Every pointer in these entries refers either to a path owned by the in-flight
        // table or to a registered buffer owned by the registry, and both stay alive until the
        // entry's completion is consumed.
        let pushed = unsafe { self.uring.submission().push_multiple(&linked) };
        if pushed.is_err() {
            // Unreachable given the capacity check above, but never leave half a chain behind.
            self.rollback(chain_key);
            return Err(RingError::QueueFull {
                needed: len,
                available: self.free_entries(),
            });
        }

        trace!(%id, len, "staged chain");
        Ok(id)
    }

    /// Removes every in-flight record belonging to an unstaged chain.
    fn rollback(&mut self, chain_key: usize) {
        let keys: Vec<usize> = self
            .operations
            .iter()
            .filter(|(_, op)| op.chain == chain_key)
            .map(|(key, _)| key)
            .collect();

        for key in keys {
            let op = self.operations.remove(key);
            if let Some(slot) = op.slot {
                self.registry.slots.complete(slot, None);
            }
            if let Some(buffer) = op.buffer {
                self.registry.buffers.release(buffer);
            }
        }
        self.chains.remove(chain_key);
    }

    /// The number of entries that can still be staged.
    fn free_entries(&mut self) -> usize {
        let sq_free = {
            let sq = self.uring.submission();
            sq.capacity() - sq.len()
        };
        let cq_free = self.cq_capacity().saturating_sub(self.operations.len());
        sq_free.min(cq_free)
    }

    /// Submit all staged entries to the kernel. Does not wait for any of them to complete.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::SubmitFailed`] if `io_uring_enter` fails.
    pub fn submit(&mut self) -> Result<usize, RingError> {
        loop {
            match self.uring.submit() {
                Ok(submitted) => {
                    trace!(submitted, "submitted entries");
                    return Ok(submitted);
                }
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(RingError::SubmitFailed(e)),
            }
        }
    }

    /// Returns the next available completion without blocking.
    ///
    /// # Panics
    ///
    /// Panics if the kernel posts a completion this ring never submitted.
    pub fn try_consume_completion(&mut self) -> Option<Completion> {
        let cqe = self.uring.completion().next()?;
        Some(self.complete(&cqe))
    }

    /// Blocks until `minimum` completions have been handed to `handler`.
    ///
    /// The handler receives each completion, a shared view of the ring (to read the buffer a
    /// completed read filled), and whether it is the last completion this call will deliver.
    /// Staged entries are flushed while waiting.
    ///
    /// # Errors
    ///
    /// Returns the handler's error as soon as it raises one. Returns [`RingError::Starved`] if
    /// fewer than `minimum` operations are in flight, since the wait could never finish, and
    /// [`RingError::WaitFailed`] if waiting on the kernel fails.
    ///
    /// # Panics
    ///
    /// As [`try_consume_completion`](Self::try_consume_completion).
    pub fn blocking_consume_completions<F, E>(
        &mut self,
        minimum: usize,
        mut handler: F,
    ) -> Result<usize, E>
    where
        F: FnMut(Completion, &Ring, bool) -> Result<(), E>,
        E: From<RingError>,
    {
        let mut delivered = 0;

        while delivered < minimum {
            match self.try_consume_completion() {
                Some(completion) => {
                    delivered += 1;
                    handler(completion, self, delivered == minimum)?;
                }
                None => {
                    if self.operations.is_empty() {
                        return Err(RingError::Starved {
                            wanted: minimum,
                            delivered,
                        }
                        .into());
                    }
                    self.wait_for_completion()?;
                }
            }
        }

        Ok(delivered)
    }

    /// Flushes staged entries and blocks until at least one completion is available.
    fn wait_for_completion(&mut self) -> Result<(), RingError> {
        loop {
            match self.uring.submit_and_wait(1) {
                Ok(_) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(RingError::WaitFailed(e)),
            }
        }
    }

    /// Blocks until at least one completion is available without flushing staged entries.
    fn wait_without_submitting(&mut self) -> Result<(), RingError> {
        loop {
            // Safety: No entries are submitted and no argument is passed, so the kernel reads no
            // memory of ours.
            let waited = unsafe {
                self.uring
                    .submitter()
                    .enter::<libc::sigset_t>(0, 1, ENTER_GETEVENTS, None)
            };
            match waited {
                Ok(_) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => return Err(RingError::WaitFailed(e)),
            }
        }
    }

    /// Retires the in-flight record of a completion queue entry and builds its [`Completion`].
    fn complete(&mut self, cqe: &cqueue::Entry) -> Completion {
        let key = cqe.user_data() as usize;

        // Every entry this ring submits carries the key of its in-flight record, and records are
        // only removed here, so a miss means the completion queue was corrupted.
        assert!(
            self.operations.contains(key),
            "completion {key} does not match any in-flight operation"
        );
        let op = self.operations.remove(key);

        let result = cqe.result();
        let track = &mut self.chains[op.chain];
        let upstream_failed = track.failed_at.is_some_and(|at| at < op.position);

        // A short transfer breaks the link just like an error does.
        let short = matches!(op.transfer, Some(want) if result >= 0 && (result as u32) < want);
        if (result < 0 || short) && track.failed_at.is_none() {
            track.failed_at = Some(op.position);
        }

        track.remaining -= 1;
        let chain = track.id;
        if track.remaining == 0 {
            self.chains.remove(op.chain);
        }

        if let Some(buffer) = op.buffer {
            self.registry.buffers.release(buffer);
        }
        if let Some(slot) = op.slot {
            let transition = match (op.kind, result >= 0) {
                (OpKind::Open, true) => Some(SlotState::Bound),
                (OpKind::Close, true) => Some(SlotState::Unbound),
                _ => None,
            };
            self.registry.slots.complete(slot, transition);
        }

        trace!(%chain, position = op.position, kind = %op.kind, result, "completion");

        Completion {
            result,
            token: op.token,
            kind: op.kind,
            buffer: op.buffer,
            slot: op.slot,
            chain,
            position: op.position,
            upstream_failed,
        }
    }

    /// Borrows the bytes of a registered buffer.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::BufferBusy`] while an in-flight operation owns the buffer, and
    /// [`RingError::UnknownBuffer`] for a handle this ring never issued.
    pub fn buffer(&self, buffer: RegisteredBuffer) -> Result<&[u8], RingError> {
        self.registry.buffers.get(buffer)
    }

    /// Mutably borrows the bytes of a registered buffer.
    ///
    /// # Errors
    ///
    /// As [`buffer`](Self::buffer).
    pub fn buffer_mut(&mut self, buffer: RegisteredBuffer) -> Result<&mut [u8], RingError> {
        self.registry.buffers.get_mut(buffer)
    }

    /// Returns true while an in-flight operation owns the buffer.
    pub fn is_buffer_busy(&self, buffer: RegisteredBuffer) -> bool {
        self.registry.buffers.is_busy(buffer)
    }

    /// The number of registered buffers.
    pub fn buffer_count(&self) -> usize {
        self.registry.buffers.count()
    }

    /// The last observed state of a file slot, or `None` for a slot this ring never issued.
    pub fn slot_state(&self, slot: FileSlot) -> Option<SlotState> {
        self.registry.slots.state(slot)
    }

    /// The number of staged or submitted operations targeting a slot.
    pub fn slot_pending(&self, slot: FileSlot) -> Option<u32> {
        self.registry.slots.pending(slot)
    }

    /// The size of the direct descriptor table.
    pub fn file_slot_capacity(&self) -> u32 {
        self.registry.slots.capacity()
    }

    /// The number of slots handed out so far.
    pub fn file_slots_allocated(&self) -> usize {
        self.registry.slots.allocated()
    }

    /// The number of operations staged or submitted whose completions have not been consumed.
    pub fn in_flight(&self) -> usize {
        self.operations.len()
    }

    /// The number of entries staged but not yet submitted.
    pub fn staged(&mut self) -> usize {
        self.uring.submission().len()
    }

    /// The number of completions the kernel has posted that have not been consumed yet.
    pub fn ready(&mut self) -> usize {
        self.uring.completion().len()
    }

    /// The depth the ring was created with.
    pub fn queue_depth(&self) -> u32 {
        self.queue_depth
    }

    /// The number of entries in the submission queue.
    pub fn sq_capacity(&self) -> usize {
        self.uring.params().sq_entries() as usize
    }

    /// The number of entries in the completion queue.
    pub fn cq_capacity(&self) -> usize {
        self.uring.params().cq_entries() as usize
    }

    /// Returns true if an eventfd is registered.
    pub fn has_event_fd(&self) -> bool {
        self.event_fd_registered
    }
}

impl Drop for Ring {
    /// The kernel may still be reading from or writing into registered buffers, and reading paths
    /// owned by the in-flight table, until every submitted operation completes. Wait for them
    /// before any of that memory is released. Entries that were only staged are never handed to
    /// the kernel and are discarded with the ring.
    fn drop(&mut self) {
        let staged = self.staged();
        let mut submitted = self.operations.len().saturating_sub(staged);
        if staged > 0 {
            debug!(staged, "discarding staged entries");
        }
        if submitted == 0 {
            return;
        }

        warn!(
            in_flight = submitted,
            "dropping ring with operations in flight, draining first"
        );

        while submitted > 0 {
            if self.try_consume_completion().is_some() {
                submitted -= 1;
                continue;
            }
            if let Err(e) = self.wait_without_submitting() {
                error!(%e, "failed to drain ring before teardown, leaking its buffers");
                let buffers = std::mem::replace(&mut self.registry.buffers, BufferTable::new(0));
                std::mem::forget(buffers);
                std::mem::forget(std::mem::take(&mut self.operations));
                return;
            }
        }
    }
}

impl AsRawFd for Ring {
    fn as_raw_fd(&self) -> RawFd {
        self.uring.as_raw_fd()
    }
}
