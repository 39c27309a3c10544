//! Chunk acquisition and recycling.
//!
//! Released chunk ranges are remembered in two ordered indexes: one by
//! address (for coalescing) and one by (size, address) (for best-fit lookup
//! with lowest-address tie-break). The memory behind a released range is
//! returned to the kernel immediately; reuse re-maps the range at its old
//! address, so recycled chunks come back zero-filled. In segment mode all
//! chunks are carved from one reserved region instead, and released ranges
//! stay mapped and are reused in place.

use std::collections::{BTreeMap, BTreeSet};

use allockit::stat;
use allockit::util::segment::Segment;
use allockit::util::{Address, RawMemory};
use spin::Mutex;

use crate::size_class::*;

pub struct ChunkManager {
    inner: Mutex<Inner>,
    hint: bool,
}

struct Inner {
    by_addr: BTreeMap<Address, usize>,
    by_size: BTreeSet<(usize, Address)>,
    segment: Option<Segment>,
}

impl ChunkManager {
    pub fn new(use_segment: bool, segment_log_size: usize, hint: bool) -> Self {
        let segment = if use_segment {
            Segment::reserve(segment_log_size).ok()
        } else {
            None
        };
        Self {
            inner: Mutex::new(Inner {
                by_addr: BTreeMap::new(),
                by_size: BTreeSet::new(),
                segment,
            }),
            hint,
        }
    }

    /// Obtain a chunk-aligned range of `size` bytes. Returns the address and
    /// whether the memory is known zero-filled.
    pub fn acquire(&self, size: usize) -> Option<(Address, bool)> {
        debug_assert!(size > 0 && size % CHUNK_SIZE == 0);
        let mut inner = self.inner.lock();
        loop {
            let Some(&(rsize, raddr)) = inner.by_size.range((size, Address::ZERO)..).next()
            else {
                break;
            };
            inner.remove_record(raddr, rsize);
            if rsize > size {
                inner.insert_record(raddr + size, rsize - size);
            }
            if inner
                .segment
                .as_ref()
                .map_or(false, |s| s.contains(raddr))
            {
                // Still mapped; reuse in place.
                stat::track_chunk_recycle();
                return Some((raddr, false));
            }
            match RawMemory::map(raddr, size) {
                Ok(_) => {
                    RawMemory::advise_huge_page(raddr, size);
                    stat::track_chunk_recycle();
                    return Some((raddr, true));
                }
                // The range was grabbed by an unrelated mapping since we
                // released it; the record was stale. Try the next fit.
                Err(_) => continue,
            }
        }
        if inner.segment.is_some() {
            let addr = inner.segment.as_mut()?.extend(size, CHUNK_SIZE)?;
            RawMemory::advise_huge_page(addr, size);
            stat::track_chunk_map();
            return Some((addr, true));
        }
        let addr = Self::map_aligned(size)?;
        inner.purge_overlaps(addr, size);
        stat::track_chunk_map();
        Some((addr, true))
    }

    /// Return a chunk-aligned range. The caller must not touch it afterwards.
    pub fn release(&self, addr: Address, size: usize) {
        debug_assert!(addr.is_aligned_to(CHUNK_SIZE) && size % CHUNK_SIZE == 0);
        let mut inner = self.inner.lock();
        let in_segment = inner
            .segment
            .as_ref()
            .map_or(false, |s| s.contains(addr));
        if in_segment {
            if self.hint {
                RawMemory::discard(addr, size);
            }
        } else {
            RawMemory::unmap(addr, size);
            stat::track_chunk_unmap();
        }
        let mut start = addr;
        let mut len = size;
        let next = inner.by_addr.get(&(start + len)).copied();
        if let Some(next_len) = next {
            inner.remove_record(start + len, next_len);
            len += next_len;
        }
        let prev = inner
            .by_addr
            .range(..start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                inner.remove_record(prev_start, prev_len);
                start = prev_start;
                len += prev_len;
            }
        }
        inner.insert_record(start, len);
    }

    fn map_aligned(size: usize) -> Option<Address> {
        // Over-map by one chunk, then trim the slack so the result is
        // chunk-aligned.
        let padded = size + CHUNK_SIZE;
        let raw = RawMemory::map_anonymous(padded).ok()?;
        let start = raw.align_up(CHUNK_SIZE);
        if start > raw {
            RawMemory::unmap(raw, start - raw);
        }
        let end = start + size;
        let raw_end = raw + padded;
        if raw_end > end {
            RawMemory::unmap(end, raw_end - end);
        }
        RawMemory::advise_huge_page(start, size);
        Some(start)
    }

    pub fn pre_fork(&self) {
        std::mem::forget(self.inner.lock());
    }

    pub fn post_fork(&self) {
        unsafe { self.inner.force_unlock() };
    }
}

impl Inner {
    fn insert_record(&mut self, addr: Address, size: usize) {
        self.by_addr.insert(addr, size);
        self.by_size.insert((size, addr));
    }

    fn remove_record(&mut self, addr: Address, size: usize) {
        self.by_addr.remove(&addr);
        self.by_size.remove(&(size, addr));
    }

    /// A fresh mapping may land on address space covered by stale records
    /// (the kernel was free to reuse it once we unmapped). Drop the
    /// overlapping parts, keeping any non-overlapping fragments.
    fn purge_overlaps(&mut self, addr: Address, size: usize) {
        let end = addr + size;
        let mut stale = Vec::new();
        for (&s, &len) in self.by_addr.range(..end).rev() {
            if s + len <= addr {
                break;
            }
            stale.push((s, len));
        }
        for (s, len) in stale {
            self.remove_record(s, len);
            if s < addr {
                self.insert_record(s, addr - s);
            }
            if s + len > end {
                self.insert_record(end, (s + len) - end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycles_released_ranges_at_the_same_address() {
        let chunks = ChunkManager::new(false, 0, false);
        let (a, zeroed) = chunks.acquire(CHUNK_SIZE).unwrap();
        assert!(zeroed);
        assert!(a.is_aligned_to(CHUNK_SIZE));
        chunks.release(a, CHUNK_SIZE);
        let (b, zeroed) = chunks.acquire(CHUNK_SIZE).unwrap();
        assert_eq!(a, b);
        assert!(zeroed);
        chunks.release(b, CHUNK_SIZE);
    }

    #[test]
    fn adjacent_releases_coalesce_and_best_fit_splits() {
        let chunks = ChunkManager::new(false, 0, false);
        let (a, _) = chunks.acquire(3 * CHUNK_SIZE).unwrap();
        // Release the three chunks separately, out of order.
        chunks.release(a, CHUNK_SIZE);
        chunks.release(a + 2 * CHUNK_SIZE, CHUNK_SIZE);
        chunks.release(a + CHUNK_SIZE, CHUNK_SIZE);
        // The coalesced range satisfies a two-chunk request from its start.
        let (b, _) = chunks.acquire(2 * CHUNK_SIZE).unwrap();
        assert_eq!(b, a);
        let (c, _) = chunks.acquire(CHUNK_SIZE).unwrap();
        assert_eq!(c, a + 2 * CHUNK_SIZE);
        chunks.release(b, 2 * CHUNK_SIZE);
        chunks.release(c, CHUNK_SIZE);
    }

    #[test]
    fn segment_ranges_are_reused_in_place() {
        let chunks = ChunkManager::new(true, 28, false);
        let (a, zeroed) = chunks.acquire(CHUNK_SIZE).unwrap();
        assert!(zeroed);
        unsafe { std::ptr::write_bytes(a.as_mut_ptr::<u8>(), 0xcd, CHUNK_SIZE) };
        chunks.release(a, CHUNK_SIZE);
        let (b, zeroed) = chunks.acquire(CHUNK_SIZE).unwrap();
        assert_eq!(a, b);
        assert!(!zeroed);
    }
}
