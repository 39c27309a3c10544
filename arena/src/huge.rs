//! Huge allocations: anything larger than `ARENA_MAXCLASS`.
//!
//! Each huge allocation owns a chunk-multiple range obtained straight from
//! the chunk manager. An address-ordered map under its own lock records the
//! ranges; lookups on free and usable-size queries must hit an exact entry,
//! anything else is heap corruption.

use std::collections::BTreeMap;

use allockit::stat::{self, AllocKind};
use allockit::util::Address;
use spin::Mutex;

use crate::chunks::ChunkManager;
use crate::size_class::*;

pub struct Huge {
    allocations: Mutex<BTreeMap<Address, usize>>,
}

impl Huge {
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn malloc(&self, chunks: &ChunkManager, size: usize, zero: bool) -> Option<Address> {
        let csize = chunk_ceiling(size)?;
        let (addr, zeroed) = chunks.acquire(csize)?;
        if zero && !zeroed {
            unsafe { std::ptr::write_bytes(addr.as_mut_ptr::<u8>(), 0, csize) };
        }
        self.allocations.lock().insert(addr, csize);
        stat::track_allocation(AllocKind::Huge);
        Some(addr)
    }

    /// Alignment larger than a chunk: over-acquire, then give back the
    /// leading and trailing chunks outside the aligned range.
    pub fn palloc(
        &self,
        chunks: &ChunkManager,
        alignment: usize,
        size: usize,
        zero: bool,
    ) -> Option<Address> {
        debug_assert!(alignment > CHUNK_SIZE && alignment.is_power_of_two());
        let csize = chunk_ceiling(size)?;
        let alloc_size = csize.checked_add(alignment - CHUNK_SIZE)?;
        let (raw, zeroed) = chunks.acquire(alloc_size)?;
        let addr = raw.align_up(alignment);
        if addr > raw {
            chunks.release(raw, addr - raw);
        }
        let end = addr + csize;
        let raw_end = raw + alloc_size;
        if raw_end > end {
            chunks.release(end, raw_end - end);
        }
        if zero && !zeroed {
            unsafe { std::ptr::write_bytes(addr.as_mut_ptr::<u8>(), 0, csize) };
        }
        self.allocations.lock().insert(addr, csize);
        stat::track_allocation(AllocKind::Huge);
        Some(addr)
    }

    /// In-place whenever the chunk-rounded size is unchanged.
    pub fn ralloc(
        &self,
        chunks: &ChunkManager,
        ptr: Address,
        size: usize,
        old_size: usize,
    ) -> Option<Address> {
        if chunk_ceiling(size) == chunk_ceiling(old_size) {
            return Some(ptr);
        }
        let new_ptr = self.malloc(chunks, size, false)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr::<u8>(),
                new_ptr.as_mut_ptr::<u8>(),
                usize::min(size, old_size),
            );
        }
        self.dalloc(chunks, ptr);
        Some(new_ptr)
    }

    pub fn dalloc(&self, chunks: &ChunkManager, ptr: Address) {
        let csize = match self.allocations.lock().remove(&ptr) {
            Some(csize) => csize,
            None => Self::invalid_pointer(ptr),
        };
        chunks.release(ptr, csize);
        stat::track_deallocation(AllocKind::Huge);
    }

    /// Usable size of a huge allocation; aborts on unknown pointers.
    pub fn size(&self, ptr: Address) -> usize {
        match self.allocations.lock().get(&ptr) {
            Some(&csize) => csize,
            None => Self::invalid_pointer(ptr),
        }
    }

    #[cold]
    fn invalid_pointer(ptr: Address) -> ! {
        allockit::println!("error: invalid huge pointer {:?}", ptr);
        std::process::abort();
    }

    pub fn pre_fork(&self) {
        std::mem::forget(self.allocations.lock());
    }

    pub fn post_fork(&self) {
        unsafe { self.allocations.force_unlock() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_to_whole_chunks() {
        let chunks = ChunkManager::new(false, 0, false);
        let huge = Huge::new();
        let a = huge.malloc(&chunks, ARENA_MAXCLASS_PLUS, false).unwrap();
        assert!(a.is_aligned_to(CHUNK_SIZE));
        assert_eq!(huge.size(a), CHUNK_SIZE);
        huge.dalloc(&chunks, a);
    }

    #[test]
    fn realloc_within_a_chunk_is_a_no_op() {
        let chunks = ChunkManager::new(false, 0, false);
        let huge = Huge::new();
        let a = huge.malloc(&chunks, CHUNK_SIZE / 2 + PAGE, false).unwrap();
        let b = huge.ralloc(&chunks, a, CHUNK_SIZE, CHUNK_SIZE / 2 + PAGE).unwrap();
        assert_eq!(a, b);
        let c = huge.ralloc(&chunks, b, CHUNK_SIZE + 1, CHUNK_SIZE).unwrap();
        assert_ne!(a, c);
        assert_eq!(huge.size(c), 2 * CHUNK_SIZE);
        huge.dalloc(&chunks, c);
    }

    #[test]
    fn chunk_alignment_is_honored() {
        let chunks = ChunkManager::new(false, 0, false);
        let huge = Huge::new();
        let a = huge
            .palloc(&chunks, 4 * CHUNK_SIZE, CHUNK_SIZE, false)
            .unwrap();
        assert!(a.is_aligned_to(4 * CHUNK_SIZE));
        huge.dalloc(&chunks, a);
    }

    #[test]
    fn absurd_sizes_fail_cleanly() {
        let chunks = ChunkManager::new(false, 0, false);
        let huge = Huge::new();
        assert!(huge.malloc(&chunks, usize::MAX - 64, false).is_none());
        assert!(huge
            .palloc(&chunks, 2 * CHUNK_SIZE, usize::MAX - 64, false)
            .is_none());
    }

    const ARENA_MAXCLASS_PLUS: usize = crate::chunk::ARENA_MAXCLASS + 1;
}
