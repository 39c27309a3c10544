//! Size classes and the lookup tables used on the small-object fast paths.
//!
//! Three families of small classes: power-of-two "tiny" classes below half a
//! quantum, quantum-spaced classes up to 512 bytes, and power-of-two
//! sub-page classes up to half a page. Everything up to `ARENA_MAXCLASS`
//! (defined next to the chunk header) is page-run sized; beyond that the
//! huge path takes over.

pub const LOG_PAGE: usize = 12;
pub const PAGE: usize = 1 << LOG_PAGE;

pub const LOG_CHUNK: usize = 20;
pub const CHUNK_SIZE: usize = 1 << LOG_CHUNK;
pub const CHUNK_PAGES: usize = CHUNK_SIZE >> LOG_PAGE;

pub const LOG_QUANTUM: usize = 4;
pub const QUANTUM: usize = 1 << LOG_QUANTUM;

pub const LOG_TINY_MIN: usize = 1;
pub const TINY_MIN: usize = 1 << LOG_TINY_MIN;

/// Tiny classes: 2, 4, 8.
pub const NTBINS: usize = LOG_QUANTUM - LOG_TINY_MIN;
/// Quantum-spaced classes: 16, 32, ..., 512.
pub const SMALL_MAX: usize = 512;
pub const NQBINS: usize = SMALL_MAX >> LOG_QUANTUM;
/// Sub-page classes: 1024, 2048.
pub const NSBINS: usize = LOG_PAGE - 9 - 1;
pub const NBINS: usize = NTBINS + NQBINS + NSBINS;

/// Smallest size that is not served by a tiny bin.
pub const SMALL_MIN: usize = (QUANTUM >> 1) + 1;
/// Largest bin-managed size; half a page.
pub const BIN_MAXCLASS: usize = PAGE >> 1;

/// Limits for the run-size search performed per bin.
pub const RUN_BFP: usize = 12;
pub const RUN_MAX_OVRHD: usize = 0x3d;
pub const RUN_MAX_OVRHD_RELAX: usize = 0x1800;
pub const RUN_MAX_SMALL: usize = 32 << 10;

const LOG_SMALL_MAX: usize = 9;

/// Bin index for a small request. `size` must be in `1..=BIN_MAXCLASS`.
pub fn bin_index(size: usize) -> usize {
    debug_assert!(size >= 1 && size <= BIN_MAXCLASS);
    if size < SMALL_MIN {
        let s = usize::max(size.next_power_of_two(), TINY_MIN);
        s.trailing_zeros() as usize - LOG_TINY_MIN
    } else if size <= SMALL_MAX {
        let s = (size + QUANTUM - 1) & !(QUANTUM - 1);
        NTBINS + (s >> LOG_QUANTUM) - 1
    } else {
        let s = size.next_power_of_two();
        NTBINS + NQBINS + (s.trailing_zeros() as usize - LOG_SMALL_MAX - 1)
    }
}

/// Region size served by bin `index`; the inverse of [`bin_index`].
pub const fn reg_size(index: usize) -> usize {
    if index < NTBINS {
        1 << (LOG_TINY_MIN + index)
    } else if index < NTBINS + NQBINS {
        (index - NTBINS + 1) << LOG_QUANTUM
    } else {
        1 << (LOG_SMALL_MAX + 1 + index - NTBINS - NQBINS)
    }
}

/// Rounded size actually allocated for a small request.
pub fn small_size_class(size: usize) -> usize {
    reg_size(bin_index(size))
}

const SIZE_INV_SHIFT: usize = 21;

// Reciprocals of the quantum-spaced sizes (3..=32 quanta). Multiplying by
// the reciprocal and shifting is exact for every offset that can occur
// within a small run.
const SIZE_INVS: [usize; 30] = {
    let mut t = [0usize; 30];
    let mut q = 3;
    while q <= 32 {
        t[q - 3] = (1 << SIZE_INV_SHIFT) / (q << LOG_QUANTUM) + 1;
        q += 1;
    }
    t
};

/// Region index for a pointer `diff` bytes into the region area of a run.
pub fn region_index(reg_size: usize, diff: usize) -> usize {
    debug_assert!(diff % reg_size == 0 || diff / reg_size == (diff + reg_size - 1) / reg_size);
    if reg_size.is_power_of_two() {
        diff >> reg_size.trailing_zeros()
    } else if (reg_size & (QUANTUM - 1)) == 0 && reg_size <= SMALL_MAX {
        let q = reg_size >> LOG_QUANTUM;
        (diff * SIZE_INVS[q - 3]) >> SIZE_INV_SHIFT
    } else {
        diff / reg_size
    }
}

/// Round up to a whole number of pages; `None` when the rounding would
/// overflow (sizes this close to `usize::MAX` are unsatisfiable anyway).
pub const fn page_ceiling(size: usize) -> Option<usize> {
    match size.checked_add(PAGE - 1) {
        Some(s) => Some(s & !(PAGE - 1)),
        None => None,
    }
}

/// Round up to a whole number of chunks; `None` on overflow.
pub const fn chunk_ceiling(size: usize) -> Option<usize> {
    match size.checked_add(CHUNK_SIZE - 1) {
        Some(s) => Some(s & !(CHUNK_SIZE - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bin_count() {
        assert_eq!(NBINS, 37);
        assert_eq!(reg_size(0), 2);
        assert_eq!(reg_size(NTBINS - 1), 8);
        assert_eq!(reg_size(NTBINS), 16);
        assert_eq!(reg_size(NTBINS + NQBINS - 1), 512);
        assert_eq!(reg_size(NBINS - 1), BIN_MAXCLASS);
    }

    #[test]
    fn bin_index_is_inverse_of_reg_size() {
        for index in 0..NBINS {
            assert_eq!(bin_index(reg_size(index)), index);
        }
    }

    #[test]
    fn rounding_is_idempotent() {
        for size in 1..=BIN_MAXCLASS {
            let rounded = small_size_class(size);
            assert!(rounded >= size);
            assert_eq!(small_size_class(rounded), rounded);
        }
    }

    #[test]
    fn class_boundaries() {
        assert_eq!(small_size_class(1), 2);
        assert_eq!(small_size_class(8), 8);
        assert_eq!(small_size_class(9), 16);
        assert_eq!(small_size_class(512), 512);
        assert_eq!(small_size_class(513), 1024);
        assert_eq!(small_size_class(2048), 2048);
    }

    #[test]
    fn ceilings_round_up_and_reject_overflow() {
        assert_eq!(page_ceiling(1), Some(PAGE));
        assert_eq!(page_ceiling(PAGE), Some(PAGE));
        assert_eq!(page_ceiling(usize::MAX - 64), None);
        assert_eq!(chunk_ceiling(CHUNK_SIZE + 1), Some(2 * CHUNK_SIZE));
        assert_eq!(chunk_ceiling(usize::MAX - 64), None);
    }

    #[test]
    fn reciprocal_matches_division() {
        for index in 0..NBINS {
            let size = reg_size(index);
            // Offsets within the largest possible run.
            for regind in 0..(RUN_MAX_SMALL / size) {
                assert_eq!(region_index(size, regind * size), regind);
            }
        }
    }
}
