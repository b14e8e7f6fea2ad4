//! File slots: indices into the ring's direct (fixed) descriptor table.

use crate::error::RingError;

/// A registered, reusable index standing in for a kernel file descriptor.
///
/// A `FileSlot` is only meaningful for the ring that handed it out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileSlot(pub(crate) u32);

impl FileSlot {
    /// The index of this slot in the ring's descriptor table.
    pub fn index(&self) -> u32 {
        self.0
    }
}

/// Whether a file is currently installed in a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Registered, with no open file.
    Unbound,
    /// An Open targeting the slot has completed successfully, and no Close has completed since.
    Bound,
}

/// Bookkeeping for a single slot.
#[derive(Debug, Clone, Copy)]
struct SlotEntry {
    /// The last observed state of the slot.
    state: SlotState,
    /// The number of staged or submitted operations that target this slot.
    pending: u32,
    /// The chain that most recently staged an operation against this slot.
    owner: Option<u64>,
}

/// The table of file slots, sized once at ring creation.
///
/// The kernel side of this table is registered sparse, so every slot starts out
/// [`Unbound`](SlotState::Unbound).
#[derive(Debug)]
pub(crate) struct SlotTable {
    /// One entry per slot handed out so far.
    entries: Vec<SlotEntry>,
    /// The size of the kernel's descriptor table.
    capacity: u32,
}

impl SlotTable {
    pub(crate) fn new(capacity: u32) -> Self {
        Self {
            entries: Vec::with_capacity(capacity as usize),
            capacity,
        }
    }

    /// Hands out the next `count` slots.
    ///
    /// # Errors
    ///
    /// Returns [`RingError::ResourceExhausted`] if the table does not have `count` unused slots.
    pub(crate) fn allocate(&mut self, count: usize) -> Result<Vec<FileSlot>, RingError> {
        let available = self.capacity as usize - self.entries.len();
        if count > available {
            return Err(RingError::ResourceExhausted {
                resource: "file slot table",
                requested: count,
                available,
            });
        }

        let start = self.entries.len() as u32;
        self.entries.resize(
            self.entries.len() + count,
            SlotEntry {
                state: SlotState::Unbound,
                pending: 0,
                owner: None,
            },
        );

        Ok((start..start + count as u32).map(FileSlot).collect())
    }

    pub(crate) fn contains(&self, slot: FileSlot) -> bool {
        (slot.0 as usize) < self.entries.len()
    }

    pub(crate) fn state(&self, slot: FileSlot) -> Option<SlotState> {
        self.entries.get(slot.0 as usize).map(|e| e.state)
    }

    pub(crate) fn pending(&self, slot: FileSlot) -> Option<u32> {
        self.entries.get(slot.0 as usize).map(|e| e.pending)
    }

    /// Records that `chain` staged an operation against `slot`.
    ///
    /// Returns `true` if a different chain still has operations in flight against the slot, which
    /// means the caller is reusing it before observing the prior Close.
    pub(crate) fn stage(&mut self, slot: FileSlot, chain: u64) -> bool {
        let entry = &mut self.entries[slot.0 as usize];
        let reused = entry.pending > 0 && entry.owner != Some(chain);
        entry.pending += 1;
        entry.owner = Some(chain);
        reused
    }

    /// Records an observed completion of an operation against `slot`.
    ///
    /// `transition` is the state a successful completion moves the slot to, if any.
    pub(crate) fn complete(&mut self, slot: FileSlot, transition: Option<SlotState>) {
        let entry = &mut self.entries[slot.0 as usize];
        debug_assert!(entry.pending > 0, "completion for idle slot {slot:?}");
        entry.pending = entry.pending.saturating_sub(1);
        if let Some(state) = transition {
            entry.state = state;
        }
        if entry.pending == 0 {
            entry.owner = None;
        }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    pub(crate) fn allocated(&self) -> usize {
        self.entries.len()
    }
}
