//! Per-chunk page map.
//!
//! A chunk is a naturally aligned 1 MiB region. The header occupies the
//! first page(s) and records, for every page, whether it has never been
//! touched, belongs to a free run, or belongs to an allocated run. Only the
//! first and last entries of a free run are authoritative, which keeps
//! coalescing constant-time. Pages at or beyond `frontier` have never been
//! written and are therefore known to be zero-filled.

use allockit::util::Address;

use crate::size_class::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageEntry {
    /// Never touched since the chunk was initialized; zero-filled.
    Untouched,
    /// First or last page of a free run of `pages` pages.
    Free { pages: u16 },
    /// Page of an allocated run; `pos` is the page's offset within the run.
    Allocated { pages: u16, pos: u16 },
}

#[repr(C)]
pub struct Chunk {
    arena: Address,
    pages_used: usize,
    /// Index of the first never-touched page.
    frontier: usize,
    /// Upper bound on the largest free run below the frontier.
    max_free_run: usize,
    /// Lower bound on the first free page. Always a run boundary, so scans
    /// can start here and jump run by run.
    min_free_index: usize,
    map: [PageEntry; CHUNK_PAGES],
}

/// Largest size served by an arena; bigger requests go to the huge path.
pub const ARENA_MAXCLASS: usize = CHUNK_SIZE - (Chunk::HEADER_PAGES << LOG_PAGE);

impl Chunk {
    pub const HEADER_PAGES: usize = (std::mem::size_of::<Chunk>() + PAGE - 1) >> LOG_PAGE;
    pub const USABLE_PAGES: usize = CHUNK_PAGES - Self::HEADER_PAGES;

    /// Initialize the header of a fresh or recycled chunk mapping.
    ///
    /// # Safety
    /// `addr` must be the chunk-aligned start of a writable chunk-sized
    /// mapping owned by the caller.
    pub unsafe fn init<'a>(addr: Address, arena: Address, zeroed: bool) -> &'a mut Chunk {
        let chunk = &mut *addr.as_mut_ptr::<Chunk>();
        chunk.arena = arena;
        chunk.pages_used = 0;
        for entry in chunk.map.iter_mut() {
            *entry = PageEntry::Untouched;
        }
        if zeroed {
            chunk.frontier = Self::HEADER_PAGES;
            chunk.max_free_run = 0;
        } else {
            // Recycled in place; every page is dirty, so cover the whole
            // usable range with one free run.
            chunk.frontier = CHUNK_PAGES;
            chunk.max_free_run = Self::USABLE_PAGES;
            chunk.map[Self::HEADER_PAGES] = PageEntry::Free {
                pages: Self::USABLE_PAGES as u16,
            };
            chunk.map[CHUNK_PAGES - 1] = PageEntry::Free {
                pages: Self::USABLE_PAGES as u16,
            };
        }
        chunk.min_free_index = Self::HEADER_PAGES;
        chunk
    }

    /// # Safety
    /// `ptr` must point into a live chunk.
    pub unsafe fn from_ptr<'a>(ptr: Address) -> &'a mut Chunk {
        debug_assert!(!ptr.is_zero());
        &mut *ptr.align_down(CHUNK_SIZE).as_mut_ptr::<Chunk>()
    }

    pub fn start(&self) -> Address {
        Address::from(self as *const Chunk)
    }

    pub fn arena(&self) -> Address {
        self.arena
    }

    pub fn page_index(&self, ptr: Address) -> usize {
        (ptr - self.start()) >> LOG_PAGE
    }

    pub fn page_addr(&self, index: usize) -> Address {
        self.start() + (index << LOG_PAGE)
    }

    pub fn entry(&self, index: usize) -> PageEntry {
        self.map[index]
    }

    /// Pages an incoming run request could possibly get from this chunk.
    pub fn max_available(&self) -> usize {
        usize::max(self.max_free_run, CHUNK_PAGES - self.frontier)
    }

    /// Allocate a run of `npages`. Prefers existing free runs (first fit from
    /// the hint index) and falls back to carving the virgin tail. Returns the
    /// start page index and whether the pages are known zero-filled.
    pub fn alloc_run(&mut self, npages: usize) -> Option<(usize, bool)> {
        debug_assert!(npages >= 1 && npages <= Self::USABLE_PAGES);
        if self.max_free_run >= npages {
            let mut i = self.min_free_index;
            let mut largest = 0;
            let mut first_free = None;
            while i < self.frontier {
                match self.map[i] {
                    PageEntry::Allocated { pages, .. } => i += pages as usize,
                    PageEntry::Free { pages } => {
                        let run = pages as usize;
                        if first_free.is_none() {
                            first_free = Some(i);
                        }
                        if run >= npages {
                            self.min_free_index = first_free.unwrap_or(i);
                            self.mark_allocated(i, npages);
                            if run > npages {
                                let rem = (run - npages) as u16;
                                self.map[i + npages] = PageEntry::Free { pages: rem };
                                self.map[i + run - 1] = PageEntry::Free { pages: rem };
                            }
                            return Some((i, false));
                        }
                        if run > largest {
                            largest = run;
                        }
                        i += run;
                    }
                    PageEntry::Untouched => {
                        debug_assert!(false, "untouched page below frontier");
                        break;
                    }
                }
            }
            // The scan failed; tighten the hints so the next request skips
            // this chunk cheaply.
            self.max_free_run = largest;
            self.min_free_index = first_free.unwrap_or(self.frontier);
        }
        if CHUNK_PAGES - self.frontier >= npages {
            let start = self.frontier;
            self.frontier += npages;
            self.mark_allocated(start, npages);
            return Some((start, true));
        }
        None
    }

    fn mark_allocated(&mut self, start: usize, npages: usize) {
        self.write_allocated(start, npages);
        self.pages_used += npages;
    }

    /// Rewrite map entries for a run without touching the page accounting.
    /// Used when trimming an over-allocated aligned run.
    pub fn write_allocated(&mut self, start: usize, npages: usize) {
        for k in 0..npages {
            self.map[start + k] = PageEntry::Allocated {
                pages: npages as u16,
                pos: k as u16,
            };
        }
    }

    /// Return a run to the chunk, coalescing with free neighbors. Returns
    /// true when the chunk holds no allocations afterwards.
    pub fn free_run(&mut self, start: usize, npages: usize) -> bool {
        debug_assert!(matches!(
            self.map[start],
            PageEntry::Allocated { pos: 0, .. }
        ));
        self.pages_used -= npages;
        let mut new_start = start;
        let mut new_pages = npages;
        if new_start > Self::HEADER_PAGES {
            if let PageEntry::Free { pages } = self.map[new_start - 1] {
                let p = pages as usize;
                new_start -= p;
                new_pages += p;
            }
        }
        let end = start + npages;
        if end < self.frontier {
            if let PageEntry::Free { pages } = self.map[end] {
                new_pages += pages as usize;
            }
        }
        self.map[new_start] = PageEntry::Free {
            pages: new_pages as u16,
        };
        self.map[new_start + new_pages - 1] = PageEntry::Free {
            pages: new_pages as u16,
        };
        if new_pages > self.max_free_run {
            self.max_free_run = new_pages;
        }
        if new_start < self.min_free_index {
            self.min_free_index = new_start;
        }
        self.pages_used == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use allockit::util::RawMemory;

    fn fresh_chunk() -> &'static mut Chunk {
        let raw = RawMemory::map_anonymous(2 * CHUNK_SIZE).unwrap();
        let aligned = raw.align_up(CHUNK_SIZE);
        unsafe { Chunk::init(aligned, Address::ZERO, true) }
    }

    #[test]
    fn header_fits_in_reserved_pages() {
        assert!(std::mem::size_of::<Chunk>() <= Chunk::HEADER_PAGES << LOG_PAGE);
        assert_eq!(ARENA_MAXCLASS, CHUNK_SIZE - (Chunk::HEADER_PAGES << LOG_PAGE));
    }

    #[test]
    fn virgin_pages_are_reported_zeroed() {
        let chunk = fresh_chunk();
        let (start, zeroed) = chunk.alloc_run(4).unwrap();
        assert_eq!(start, Chunk::HEADER_PAGES);
        assert!(zeroed);
        let (next, zeroed) = chunk.alloc_run(2).unwrap();
        assert_eq!(next, start + 4);
        assert!(zeroed);
    }

    #[test]
    fn freed_runs_coalesce_both_ways() {
        let chunk = fresh_chunk();
        let (a, _) = chunk.alloc_run(2).unwrap();
        let (b, _) = chunk.alloc_run(3).unwrap();
        let (c, _) = chunk.alloc_run(4).unwrap();
        assert!(!chunk.free_run(a, 2));
        assert!(!chunk.free_run(c, 4));
        // Freeing b joins all three into one run.
        assert!(chunk.free_run(b, 3));
        assert_eq!(chunk.entry(a), PageEntry::Free { pages: 9 });
        assert_eq!(chunk.entry(a + 8), PageEntry::Free { pages: 9 });
        // And the coalesced run is reused in preference to the virgin tail.
        let (again, zeroed) = chunk.alloc_run(9).unwrap();
        assert_eq!(again, a);
        assert!(!zeroed);
    }

    #[test]
    fn free_runs_are_split_first_fit() {
        let chunk = fresh_chunk();
        let (a, _) = chunk.alloc_run(8).unwrap();
        let (_b, _) = chunk.alloc_run(1).unwrap();
        chunk.free_run(a, 8);
        let (c, zeroed) = chunk.alloc_run(3).unwrap();
        assert_eq!(c, a);
        assert!(!zeroed);
        assert_eq!(chunk.entry(a + 3), PageEntry::Free { pages: 5 });
    }
}
