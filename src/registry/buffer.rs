//! This module contains the definition of [`RegisteredBuffer`] and the table that owns the memory
//! behind every registered buffer.
//!
//! A registered buffer is intended to be shared with the kernel to avoid a per-operation mapping
//! of user memory. The kernel pins the pages once at registration time and refers to them by
//! index afterwards, which means the memory must stay allocated at a fixed address for as long as
//! the ring can use it.
//!
//! The table enforces this by taking ownership of the backing allocations. A `Box<[u8]>` never
//! moves its heap contents, so the addresses handed to the kernel stay valid until the table (and
//! with it the ring) is dropped.

use crate::error::{InvalidBufferReason, RingError};
use std::ops::Range;

/// The largest single region the kernel will register.
const MAX_REGION_LEN: usize = 1 << 30;

/// A registered, reusable index standing in for a pinned memory region.
///
/// A `RegisteredBuffer` is only meaningful for the ring that registered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegisteredBuffer(pub(crate) u16);

impl RegisteredBuffer {
    /// The index of this buffer in the ring's buffer table.
    pub fn index(&self) -> u16 {
        self.0
    }
}

/// A region of one of the table's allocations.
#[derive(Debug)]
struct BufferEntry {
    /// The allocation this region lives in.
    allocation: usize,
    /// The bytes of the allocation this region covers.
    range: Range<usize>,
    /// The number of staged or submitted operations that reference this region.
    in_flight: u32,
}

/// Owns every allocation behind the ring's registered buffers.
#[derive(Debug)]
pub(crate) struct BufferTable {
    /// Backing memory. Only ever appended to, so regions keep their addresses.
    allocations: Vec<Box<[u8]>>,
    /// Registered regions, indexed by [`RegisteredBuffer`].
    entries: Vec<BufferEntry>,
    /// The maximum number of regions the table may hold.
    max_entries: usize,
}

impl BufferTable {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            allocations: Vec::new(),
            entries: Vec::new(),
            max_entries,
        }
    }

    fn check_room(&self, requested: usize) -> Result<(), RingError> {
        let available = self.max_entries - self.entries.len();
        if requested > available {
            return Err(RingError::ResourceExhausted {
                resource: "registered buffer table",
                requested,
                available,
            });
        }
        Ok(())
    }

    fn check_len(index: usize, len: usize) -> Result<(), RingError> {
        let reason = match len {
            0 => InvalidBufferReason::ZeroLength,
            len if len > MAX_REGION_LEN => InvalidBufferReason::TooLarge(len),
            _ => return Ok(()),
        };
        Err(RingError::InvalidBuffer { index, reason })
    }

    /// Takes ownership of each region, registering each as its own buffer.
    ///
    /// Either every region is added or none is.
    pub(crate) fn add_owned(
        &mut self,
        regions: Vec<Box<[u8]>>,
    ) -> Result<Vec<RegisteredBuffer>, RingError> {
        self.check_room(regions.len())?;
        for (index, region) in regions.iter().enumerate() {
            Self::check_len(index, region.len())?;
        }

        let mut handles = Vec::with_capacity(regions.len());
        for region in regions {
            let allocation = self.allocations.len();
            let range = 0..region.len();
            self.allocations.push(region);
            handles.push(self.push_entry(allocation, range));
        }
        Ok(handles)
    }

    /// Takes ownership of a single allocation and registers the given ranges of it.
    ///
    /// Ranges must be non-empty, in bounds, and pairwise disjoint. Either every range is added or
    /// none is.
    pub(crate) fn add_slab(
        &mut self,
        slab: Box<[u8]>,
        ranges: Vec<Range<usize>>,
    ) -> Result<Vec<RegisteredBuffer>, RingError> {
        self.check_room(ranges.len())?;

        for (index, range) in ranges.iter().enumerate() {
            Self::check_len(index, range.end.saturating_sub(range.start))?;
            if range.end > slab.len() {
                return Err(RingError::InvalidBuffer {
                    index,
                    reason: InvalidBufferReason::OutOfBounds {
                        start: range.start,
                        end: range.end,
                        len: slab.len(),
                    },
                });
            }
        }

        // Sort by start so only neighbours need comparing.
        let mut order: Vec<usize> = (0..ranges.len()).collect();
        order.sort_by_key(|&i| ranges[i].start);
        for pair in order.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if ranges[b].start < ranges[a].end {
                let (index, other) = if a < b { (b, a) } else { (a, b) };
                return Err(RingError::InvalidBuffer {
                    index,
                    reason: InvalidBufferReason::Overlap { other },
                });
            }
        }

        let allocation = self.allocations.len();
        self.allocations.push(slab);
        Ok(ranges
            .into_iter()
            .map(|range| self.push_entry(allocation, range))
            .collect())
    }

    /// The current table size, for rolling back a failed registration with
    /// [`truncate`](Self::truncate).
    pub(crate) fn mark(&self) -> (usize, usize) {
        (self.entries.len(), self.allocations.len())
    }

    /// Drops every region and allocation added since `mark` was taken.
    ///
    /// Only valid while the kernel does not have the dropped regions registered.
    pub(crate) fn truncate(&mut self, (entries, allocations): (usize, usize)) {
        self.entries.truncate(entries);
        self.allocations.truncate(allocations);
    }

    fn push_entry(&mut self, allocation: usize, range: Range<usize>) -> RegisteredBuffer {
        let handle = RegisteredBuffer(self.entries.len() as u16);
        self.entries.push(BufferEntry {
            allocation,
            range,
            in_flight: 0,
        });
        handle
    }

    /// Builds the `iovec` array describing every registered region, in index order.
    pub(crate) fn iovecs(&mut self) -> Vec<libc::iovec> {
        let allocations = &mut self.allocations;
        self.entries
            .iter()
            .map(|entry| libc::iovec {
                iov_base: allocations[entry.allocation][entry.range.clone()]
                    .as_mut_ptr()
                    .cast(),
                iov_len: entry.range.len(),
            })
            .collect()
    }

    pub(crate) fn contains(&self, buffer: RegisteredBuffer) -> bool {
        (buffer.0 as usize) < self.entries.len()
    }

    pub(crate) fn len_of(&self, buffer: RegisteredBuffer) -> Option<usize> {
        self.entries.get(buffer.0 as usize).map(|e| e.range.len())
    }

    pub(crate) fn is_busy(&self, buffer: RegisteredBuffer) -> bool {
        self.entries
            .get(buffer.0 as usize)
            .is_some_and(|e| e.in_flight > 0)
    }

    /// The number of operations that currently reference any buffer.
    pub(crate) fn total_in_flight(&self) -> usize {
        self.entries.iter().map(|e| e.in_flight as usize).sum()
    }

    /// A raw pointer to the start of the region, for handing to the kernel.
    pub(crate) fn as_mut_ptr(&mut self, buffer: RegisteredBuffer) -> *mut u8 {
        let entry = &self.entries[buffer.0 as usize];
        self.allocations[entry.allocation][entry.range.clone()].as_mut_ptr()
    }

    /// Marks the buffer as owned by one more in-flight operation.
    pub(crate) fn acquire(&mut self, buffer: RegisteredBuffer) {
        self.entries[buffer.0 as usize].in_flight += 1;
    }

    /// Returns ownership of the buffer from one in-flight operation.
    pub(crate) fn release(&mut self, buffer: RegisteredBuffer) {
        let entry = &mut self.entries[buffer.0 as usize];
        debug_assert!(entry.in_flight > 0, "released idle buffer {buffer:?}");
        entry.in_flight = entry.in_flight.saturating_sub(1);
    }

    /// Borrows the bytes of an idle buffer.
    pub(crate) fn get(&self, buffer: RegisteredBuffer) -> Result<&[u8], RingError> {
        let entry = self
            .entries
            .get(buffer.0 as usize)
            .ok_or(RingError::UnknownBuffer(buffer))?;
        if entry.in_flight > 0 {
            return Err(RingError::BufferBusy(buffer));
        }
        Ok(&self.allocations[entry.allocation][entry.range.clone()])
    }

    /// Mutably borrows the bytes of an idle buffer.
    pub(crate) fn get_mut(&mut self, buffer: RegisteredBuffer) -> Result<&mut [u8], RingError> {
        let entry = self
            .entries
            .get(buffer.0 as usize)
            .ok_or(RingError::UnknownBuffer(buffer))?;
        if entry.in_flight > 0 {
            return Err(RingError::BufferBusy(buffer));
        }
        Ok(&mut self.allocations[entry.allocation][entry.range.clone()])
    }

    pub(crate) fn count(&self) -> usize {
        self.entries.len()
    }
}
