//! The resource registry: the bookkeeping behind the kernel-visible file slots and pinned buffers
//! of a single ring.
//!
//! The registry is passive capacity. It hands out stable handles, validates regions, and tracks
//! which handles are referenced by in-flight operations, but it performs no I/O. The
//! [`Ring`](crate::io::Ring) that owns it makes the actual registration calls.

mod buffer;
mod slot;

pub use buffer::RegisteredBuffer;
pub use slot::{FileSlot, SlotState};

pub(crate) use buffer::BufferTable;
pub(crate) use slot::SlotTable;

/// The file-slot table and buffer table owned by a ring.
#[derive(Debug)]
pub(crate) struct ResourceRegistry {
    /// Slots of the direct descriptor table.
    pub(crate) slots: SlotTable,
    /// Pinned buffers and the memory behind them.
    pub(crate) buffers: BufferTable,
}

impl ResourceRegistry {
    pub(crate) fn new(file_slots: u32, max_buffers: usize) -> Self {
        Self {
            slots: SlotTable::new(file_slots),
            buffers: BufferTable::new(max_buffers),
        }
    }
}
