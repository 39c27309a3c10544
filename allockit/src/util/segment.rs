use super::memory::{MemoryMapError, RawMemory};
use super::Address;

/// A contiguous reserved address range committed on demand, in the manner of
/// a data segment grown with `sbrk`. Memory handed back by the owner stays
/// mapped, so ranges inside the segment can be reused in place.
pub struct Segment {
    start: Address,
    cursor: Address,
    limit: Address,
}

impl Segment {
    pub fn reserve(log_size: usize) -> Result<Self, MemoryMapError> {
        let size = 1usize << log_size;
        let start = RawMemory::reserve(size)?;
        Ok(Self {
            start,
            cursor: start,
            limit: start + size,
        })
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.cursor
    }

    /// Commit `size` more bytes at the growth cursor. `align` must be a power
    /// of two; slack pages skipped for alignment remain reserved.
    pub fn extend(&mut self, size: usize, align: usize) -> Option<Address> {
        let start = self.cursor.align_up(align);
        if start + size > self.limit {
            return None;
        }
        RawMemory::commit(start, size).ok()?;
        self.cursor = start + size;
        Some(start)
    }
}
