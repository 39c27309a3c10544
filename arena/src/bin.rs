//! Size-class bins.
//!
//! Each bin serves one region size out of runs sized by a small search: the
//! run grows a page at a time until the bitmap-plus-header overhead drops
//! under the fixed-point bound, or the run hits its ceiling. The current
//! run (`runcur`) absorbs the fast path; other runs with free regions wait
//! in an address-ordered set so the lowest-addressed run is refilled first,
//! which keeps allocations packed toward low memory.

use std::collections::BTreeSet;

use allockit::util::Address;

use crate::chunk::ARENA_MAXCLASS;
use crate::run::{Run, BITMAP_WORD_BITS};
use crate::size_class::*;

/// Geometry of one size class, fixed at arena construction.
#[derive(Clone, Copy, Debug)]
pub struct BinInfo {
    pub reg_size: usize,
    pub run_pages: usize,
    pub nregs: usize,
    pub mask_words: usize,
    pub reg0_offset: usize,
}

impl BinInfo {
    /// Pick the run size for a region size.
    ///
    /// Starting from one page, the run grows while the space lost to the
    /// header and trailing padding exceeds `RUN_MAX_OVRHD / 2^RUN_BFP` of
    /// the run, subject to the `RUN_MAX_SMALL` and `ARENA_MAXCLASS`
    /// ceilings. Classes too small for the bound to ever hold (the relax
    /// test) stay at one page.
    pub fn new(reg_size: usize) -> Self {
        let mut run_size = PAGE;
        let (mut nregs, mut mask_words, mut reg0_offset) = Self::fit(reg_size, run_size);
        while run_size + PAGE <= usize::min(RUN_MAX_SMALL, ARENA_MAXCLASS)
            && RUN_MAX_OVRHD * (reg_size << 3) > RUN_MAX_OVRHD_RELAX
            && (reg0_offset << RUN_BFP) > RUN_MAX_OVRHD * run_size
        {
            run_size += PAGE;
            let fit = Self::fit(reg_size, run_size);
            nregs = fit.0;
            mask_words = fit.1;
            reg0_offset = fit.2;
        }
        debug_assert!(reg0_offset >= Run::header_size(mask_words));
        Self {
            reg_size,
            run_pages: run_size >> LOG_PAGE,
            nregs,
            mask_words,
            reg0_offset,
        }
    }

    /// Largest region count such that header, bitmap and regions fit.
    fn fit(reg_size: usize, run_size: usize) -> (usize, usize, usize) {
        let mut nregs = run_size / reg_size + 1;
        let mut mask_words;
        let mut reg0_offset;
        loop {
            nregs -= 1;
            mask_words = (nregs + BITMAP_WORD_BITS - 1) / BITMAP_WORD_BITS;
            reg0_offset = run_size - nregs * reg_size;
            if Run::header_size(mask_words) <= reg0_offset {
                break;
            }
        }
        (nregs, mask_words, reg0_offset)
    }
}

/// Per-arena state for one size class. Protected by the arena lock.
pub struct Bin {
    pub info: BinInfo,
    /// Run currently used for allocation, or zero.
    pub runcur: Address,
    /// Other runs with free regions, lowest address first.
    pub runs: BTreeSet<Address>,
}

impl Bin {
    pub fn new(index: usize) -> Self {
        Self {
            info: BinInfo::new(reg_size(index)),
            runcur: Address::ZERO,
            runs: BTreeSet::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_sizes_respect_all_bounds() {
        for index in 0..NBINS {
            let info = BinInfo::new(reg_size(index));
            let run_size = info.run_pages << LOG_PAGE;
            assert!(run_size >= PAGE);
            assert!(run_size <= RUN_MAX_SMALL);
            assert!(run_size <= ARENA_MAXCLASS);
            assert!(info.nregs >= 1);
            // Header and bitmap fit in front of the first region.
            assert!(info.reg0_offset >= Run::header_size(info.mask_words));
            // Regions fill the run exactly up to its end.
            assert_eq!(info.reg0_offset + info.nregs * info.reg_size, run_size);
        }
    }

    #[test]
    fn overhead_bound_holds_or_is_relaxed() {
        for index in 0..NBINS {
            let info = BinInfo::new(reg_size(index));
            let run_size = info.run_pages << LOG_PAGE;
            let relaxed = RUN_MAX_OVRHD * (info.reg_size << 3) <= RUN_MAX_OVRHD_RELAX;
            let bounded = (info.reg0_offset << RUN_BFP) <= RUN_MAX_OVRHD * run_size;
            let capped = run_size + PAGE > RUN_MAX_SMALL;
            assert!(relaxed || bounded || capped);
        }
    }

    #[test]
    fn sub_page_classes_hold_multiple_regions() {
        let info = BinInfo::new(BIN_MAXCLASS);
        assert!(info.nregs >= 2);
    }
}
