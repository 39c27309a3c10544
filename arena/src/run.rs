//! Small-object runs.
//!
//! A run is a small group of pages carved from a chunk and dedicated to one
//! size class. The header sits at the start of the run and is followed by a
//! bitmap with one bit per region (set = free); regions are packed at the
//! end of the run. The `cursor` remembers the first bitmap word that may
//! contain a set bit, so allocation scans resume where the last one left
//! off and only move backwards on free.

use allockit::util::Address;

use crate::bin::BinInfo;

pub const BITMAP_WORD_BITS: usize = 32;

#[repr(C)]
pub struct Run {
    bin_index: u32,
    free_count: u32,
    cursor: u32,
    // The bitmap words follow the header in memory.
}

impl Run {
    pub const fn header_size(mask_words: usize) -> usize {
        std::mem::size_of::<Run>() + mask_words * std::mem::size_of::<u32>()
    }

    /// # Safety
    /// `addr` must be the start of a freshly allocated run of
    /// `bin.run_pages` pages.
    pub unsafe fn init<'a>(addr: Address, bin_index: usize, bin: &BinInfo) -> &'a mut Run {
        let run = &mut *addr.as_mut_ptr::<Run>();
        run.bin_index = bin_index as u32;
        run.free_count = bin.nregs as u32;
        run.cursor = 0;
        let mask = run.mask_mut(bin.mask_words);
        for word in mask.iter_mut() {
            *word = u32::MAX;
        }
        // Clear the padding bits past the last region.
        let tail = bin.nregs % BITMAP_WORD_BITS;
        if tail != 0 {
            mask[bin.mask_words - 1] = (1u32 << tail) - 1;
        }
        run
    }

    /// # Safety
    /// `addr` must point to the header of a live run.
    pub unsafe fn from_addr<'a>(addr: Address) -> &'a mut Run {
        &mut *addr.as_mut_ptr::<Run>()
    }

    pub fn addr(&self) -> Address {
        Address::from(self as *const Run)
    }

    pub fn bin_index(&self) -> usize {
        self.bin_index as usize
    }

    pub fn free_count(&self) -> usize {
        self.free_count as usize
    }

    fn mask_mut(&mut self, words: usize) -> &mut [u32] {
        unsafe {
            let base = (self as *mut Run).add(1) as *mut u32;
            std::slice::from_raw_parts_mut(base, words)
        }
    }

    /// Claim a free region; returns its index.
    pub fn alloc_region(&mut self, bin: &BinInfo) -> Option<usize> {
        if self.free_count == 0 {
            return None;
        }
        let words = bin.mask_words;
        let start = self.cursor as usize;
        for w in start..words {
            let mask = self.mask_mut(words);
            let word = mask[w];
            if word != 0 {
                let bit = word.trailing_zeros() as usize;
                mask[w] = word & !(1 << bit);
                self.free_count -= 1;
                self.cursor = w as u32;
                return Some(w * BITMAP_WORD_BITS + bit);
            }
        }
        debug_assert!(false, "free_count and bitmap disagree");
        None
    }

    /// Release the region at `index`.
    pub fn free_region(&mut self, index: usize, bin: &BinInfo) {
        debug_assert!(index < bin.nregs);
        let w = index / BITMAP_WORD_BITS;
        let bit = index % BITMAP_WORD_BITS;
        let mask = self.mask_mut(bin.mask_words);
        debug_assert!(mask[w] & (1 << bit) == 0, "double free of region");
        mask[w] |= 1 << bit;
        self.free_count += 1;
        if (w as u32) < self.cursor {
            self.cursor = w as u32;
        }
    }

    /// Address of the region at `index`.
    pub fn region(&self, index: usize, bin: &BinInfo) -> Address {
        self.addr() + bin.reg0_offset + index * bin.reg_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bin::BinInfo;
    use crate::size_class;

    fn run_for(reg_size: usize) -> (&'static mut Run, BinInfo) {
        let bin = BinInfo::new(reg_size);
        let addr = allockit::util::RawMemory::map_anonymous(bin.run_pages << size_class::LOG_PAGE)
            .unwrap();
        let run = unsafe { Run::init(addr, size_class::bin_index(reg_size), &bin) };
        (run, bin)
    }

    #[test]
    fn regions_are_unique_and_exhaustible() {
        let (run, bin) = run_for(64);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..bin.nregs {
            let index = run.alloc_region(&bin).unwrap();
            assert!(seen.insert(index));
            assert!(index < bin.nregs);
        }
        assert_eq!(run.free_count(), 0);
        assert!(run.alloc_region(&bin).is_none());
    }

    #[test]
    fn cursor_moves_back_on_free() {
        let (run, bin) = run_for(16);
        let a = run.alloc_region(&bin).unwrap();
        let b = run.alloc_region(&bin).unwrap();
        assert_ne!(a, b);
        run.free_region(a, &bin);
        // The lowest free region is handed out again.
        assert_eq!(run.alloc_region(&bin).unwrap(), a);
    }

    #[test]
    fn regions_fit_inside_the_run() {
        let (run, bin) = run_for(48);
        let run_bytes = bin.run_pages << size_class::LOG_PAGE;
        assert!(bin.reg0_offset >= Run::header_size(bin.mask_words));
        let last = run.region(bin.nregs - 1, &bin);
        assert!(last + bin.reg_size <= run.addr() + run_bytes);
    }
}
