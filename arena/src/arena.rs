//! Arenas: the per-thread-sharded heart of the allocator.
//!
//! An arena owns a set of chunks and carves page runs out of them, either
//! directly (large allocations) or through per-size-class bins (small
//! allocations). All arena state sits behind one spin lock; the lock
//! acquisition path measures contention and asks the owning thread to move
//! to another arena when the exponentially averaged contention crosses the
//! configured threshold.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use allockit::stat::{self, AllocKind};
use allockit::util::Address;
use allockit::Plan;
use spin::{Mutex, MutexGuard};

use crate::bin::Bin;
use crate::chunk::{Chunk, PageEntry};
use crate::prng::Lcg;
use crate::run::Run;
use crate::size_class::*;

const LOG_SPIN_LIMIT: usize = 11;
const LOG_BALANCE_ALPHA_INV: usize = 9;
const LAZY_FREE_NPROBES: usize = 5;

const JUNK_ALLOC: u8 = 0xa5;
const JUNK_FREE: u8 = 0x5a;

pub struct Arena {
    inner: Mutex<ArenaInner>,
    /// Set by the lock path when this arena is overloaded; consumed by the
    /// bound thread, which then re-draws its arena assignment.
    rebalance: AtomicBool,
    /// Contention level that triggers the rebalance signal; zero disables
    /// balancing.
    balance_threshold: usize,
    /// Lock-free parking lot for small deallocations. Empty when disabled.
    lazy_free: Box<[AtomicUsize]>,
}

struct ArenaInner {
    /// All chunks owned by this arena, address ordered.
    chunks: BTreeSet<Address>,
    /// Most recently emptied chunk, cached for quick reuse.
    spare: Address,
    bins: [Bin; NBINS],
    contention: usize,
}

impl Arena {
    pub fn new(balance_threshold: usize, lazy_free_log_slots: Option<usize>) -> Self {
        let slots = lazy_free_log_slots.map_or(0, |log| 1 << log);
        Self {
            inner: Mutex::new(ArenaInner {
                chunks: BTreeSet::new(),
                spare: Address::ZERO,
                bins: std::array::from_fn(Bin::new),
                contention: 0,
            }),
            rebalance: AtomicBool::new(false),
            balance_threshold,
            lazy_free: (0..slots).map(|_| AtomicUsize::new(0)).collect(),
        }
    }

    pub fn addr(&self) -> Address {
        Address::from(self as *const Arena)
    }

    /// True once the lock path decided this thread should move elsewhere.
    pub fn take_rebalance(&self) -> bool {
        self.balance_threshold != 0 && self.rebalance.swap(false, Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        let (mut inner, rounds) = match self.inner.try_lock() {
            Some(g) => (g, 0),
            None => self.lock_slow(),
        };
        if self.balance_threshold != 0 {
            // Exponentially averaged contention; integer rounding makes it
            // decay slightly faster than the nominal alpha.
            inner.contention = (inner.contention * ((1 << LOG_BALANCE_ALPHA_INV) - 1) + rounds)
                >> LOG_BALANCE_ALPHA_INV;
            if inner.contention >= self.balance_threshold {
                inner.contention = 0;
                self.rebalance.store(true, Ordering::Relaxed);
                stat::track_rebalance();
            }
        }
        inner
    }

    #[cold]
    fn lock_slow(&self) -> (MutexGuard<'_, ArenaInner>, usize) {
        let mut backoff = 1usize;
        let mut rounds = 0usize;
        loop {
            for _ in 0..backoff {
                core::hint::spin_loop();
            }
            rounds += 1;
            if let Some(g) = self.inner.try_lock() {
                return (g, rounds);
            }
            if backoff < (1 << LOG_SPIN_LIMIT) {
                backoff <<= 1;
            } else {
                std::thread::yield_now();
            }
        }
    }

    pub fn malloc_small(&self, size: usize, zero: bool) -> Option<Address> {
        debug_assert!(size >= 1 && size <= BIN_MAXCLASS);
        let index = bin_index(size);
        let reg_size = reg_size(index);
        let region = {
            let mut inner = self.lock();
            inner.alloc_from_bin(self, index)?
        };
        let options = crate::plan().options();
        if zero {
            unsafe { std::ptr::write_bytes(region.as_mut_ptr::<u8>(), 0, reg_size) };
        } else if options.junk {
            unsafe { std::ptr::write_bytes(region.as_mut_ptr::<u8>(), JUNK_ALLOC, reg_size) };
        }
        stat::track_allocation(AllocKind::Small);
        Some(region)
    }

    /// `size` must already be page-rounded and no bigger than
    /// `ARENA_MAXCLASS`.
    pub fn malloc_large(&self, size: usize, zero: bool) -> Option<Address> {
        debug_assert!(size % PAGE == 0 && size <= crate::chunk::ARENA_MAXCLASS);
        let npages = size >> LOG_PAGE;
        let (addr, zeroed) = {
            let mut inner = self.lock();
            inner.run_alloc(self, npages)?
        };
        let options = crate::plan().options();
        if zero {
            if !zeroed {
                unsafe { std::ptr::write_bytes(addr.as_mut_ptr::<u8>(), 0, size) };
            }
        } else if options.junk {
            unsafe { std::ptr::write_bytes(addr.as_mut_ptr::<u8>(), JUNK_ALLOC, size) };
        }
        stat::track_allocation(AllocKind::Large);
        Some(addr)
    }

    /// Page-level aligned allocation: allocate an oversized run, keep the
    /// aligned middle and hand the slack pages straight back.
    pub fn palloc(&self, alignment: usize, size: usize, zero: bool) -> Option<Address> {
        debug_assert!(alignment > PAGE || size % alignment == 0);
        debug_assert!(size % PAGE == 0);
        let npages = size >> LOG_PAGE;
        let total = npages + (alignment >> LOG_PAGE) - 1;
        let (addr, zeroed) = {
            let mut inner = self.lock();
            let (start_addr, zeroed) = inner.run_alloc(self, total)?;
            let chunk = unsafe { Chunk::from_ptr(start_addr) };
            let start = chunk.page_index(start_addr);
            let keep_addr = start_addr.align_up(alignment);
            let keep = chunk.page_index(keep_addr);
            let lead = keep - start;
            let tail = (start + total) - (keep + npages);
            chunk.write_allocated(keep, npages);
            if lead > 0 {
                chunk.write_allocated(start, lead);
                inner.run_dalloc(chunk, start, lead);
            }
            if tail > 0 {
                chunk.write_allocated(keep + npages, tail);
                inner.run_dalloc(chunk, keep + npages, tail);
            }
            (keep_addr, zeroed)
        };
        if zero && !zeroed {
            unsafe { std::ptr::write_bytes(addr.as_mut_ptr::<u8>(), 0, size) };
        }
        stat::track_allocation(AllocKind::Large);
        Some(addr)
    }

    pub fn dalloc(&self, ptr: Address) {
        let chunk = unsafe { Chunk::from_ptr(ptr) };
        let page = chunk.page_index(ptr);
        match chunk.entry(page) {
            PageEntry::Allocated { pages, pos } => {
                if pos == 0 && ptr.is_aligned_to(PAGE) {
                    let npages = pages as usize;
                    if crate::plan().options().junk {
                        unsafe {
                            std::ptr::write_bytes(
                                ptr.as_mut_ptr::<u8>(),
                                JUNK_FREE,
                                npages << LOG_PAGE,
                            )
                        };
                    }
                    let mut inner = self.lock();
                    inner.run_dalloc(chunk, page, npages);
                    stat::track_deallocation(AllocKind::Large);
                } else {
                    self.dalloc_small(ptr);
                }
            }
            _ => invalid_pointer(ptr),
        }
    }

    fn dalloc_small(&self, ptr: Address) {
        if crate::plan().options().junk {
            let size = salloc(ptr);
            unsafe { std::ptr::write_bytes(ptr.as_mut_ptr::<u8>(), JUNK_FREE, size) };
        }
        let chunk = unsafe { Chunk::from_ptr(ptr) };
        let mut inner = self.lock();
        inner.dalloc_small(chunk, ptr);
        stat::track_deallocation(AllocKind::Small);
    }

    /// Park a small deallocation in a random free slot; on repeated
    /// collisions take the lock once and drain everything.
    pub fn dalloc_lazy(&self, ptr: Address, prng: &mut Lcg) {
        if self.lazy_free.len() < 2 {
            return self.dalloc_small(ptr);
        }
        if crate::plan().options().junk {
            let size = salloc(ptr);
            unsafe { std::ptr::write_bytes(ptr.as_mut_ptr::<u8>(), JUNK_FREE, size) };
        }
        let log_slots = self.lazy_free.len().trailing_zeros() as usize;
        for _ in 0..LAZY_FREE_NPROBES {
            let slot = prng.next_bits(log_slots) as usize;
            if self.lazy_free[slot]
                .compare_exchange(0, ptr.as_usize(), Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                stat::track_lazy_free_hit();
                return;
            }
        }
        self.dalloc_lazy_hard(ptr);
    }

    #[cold]
    fn dalloc_lazy_hard(&self, ptr: Address) {
        let mut inner = self.lock();
        let chunk = unsafe { Chunk::from_ptr(ptr) };
        inner.dalloc_small(chunk, ptr);
        stat::track_deallocation(AllocKind::Small);
        for slot in self.lazy_free.iter() {
            let parked = slot.swap(0, Ordering::Acquire);
            if parked != 0 {
                let parked = Address::from_usize(parked);
                let chunk = unsafe { Chunk::from_ptr(parked) };
                inner.dalloc_small(chunk, parked);
                stat::track_deallocation(AllocKind::Small);
            }
        }
        stat::track_lazy_free_sweep();
    }

    pub fn pre_fork(&self) {
        std::mem::forget(self.inner.lock());
    }

    pub fn post_fork(&self) {
        unsafe { self.inner.force_unlock() };
    }
}

impl ArenaInner {
    fn alloc_from_bin(&mut self, arena: &Arena, index: usize) -> Option<Address> {
        loop {
            let bin = &mut self.bins[index];
            if !bin.runcur.is_zero() {
                let info = bin.info;
                let run = unsafe { Run::from_addr(bin.runcur) };
                match run.alloc_region(&info) {
                    Some(reg) => return Some(run.region(reg, &info)),
                    // Full; forget it until a region comes back.
                    None => bin.runcur = Address::ZERO,
                }
                continue;
            }
            if let Some(addr) = bin.runs.pop_first() {
                bin.runcur = addr;
                continue;
            }
            let info = bin.info;
            let (run_addr, _zeroed) = self.run_alloc(arena, info.run_pages)?;
            let run = unsafe { Run::init(run_addr, index, &info) };
            self.bins[index].runcur = run.addr();
        }
    }

    fn dalloc_small(&mut self, chunk: &mut Chunk, ptr: Address) {
        let page = chunk.page_index(ptr);
        let PageEntry::Allocated { pos, .. } = chunk.entry(page) else {
            invalid_pointer(ptr);
        };
        let run_page = page - pos as usize;
        let run_addr = chunk.page_addr(run_page);
        let run = unsafe { Run::from_addr(run_addr) };
        let index = run.bin_index();
        let info = self.bins[index].info;
        let diff = ptr - (run_addr + info.reg0_offset);
        let reg = region_index(info.reg_size, diff);
        run.free_region(reg, &info);

        let bin = &mut self.bins[index];
        if run.free_count() == info.nregs {
            // Completely free; give the pages back.
            if bin.runcur == run_addr {
                bin.runcur = Address::ZERO;
            } else {
                bin.runs.remove(&run_addr);
            }
            self.run_dalloc(chunk, run_page, info.run_pages);
        } else if run.free_count() == 1 {
            // Was full; make it allocatable again. A full run may still be
            // the current run: allocation only drops it on the next attempt.
            if run_addr != bin.runcur {
                if bin.runcur.is_zero() {
                    bin.runcur = run_addr;
                } else {
                    bin.runs.insert(run_addr);
                }
            }
        } else if !bin.runcur.is_zero() && run_addr < bin.runcur && bin.runs.remove(&run_addr) {
            // Keep the current run at the lowest address, so freed runs
            // drain and allocations stay packed.
            bin.runs.insert(bin.runcur);
            bin.runcur = run_addr;
        }
    }

    fn run_alloc(&mut self, arena: &Arena, npages: usize) -> Option<(Address, bool)> {
        for &chunk_addr in self.chunks.iter() {
            let chunk = unsafe { Chunk::from_ptr(chunk_addr) };
            if chunk.max_available() < npages {
                continue;
            }
            if let Some((page, zeroed)) = chunk.alloc_run(npages) {
                return Some((chunk.page_addr(page), zeroed));
            }
        }
        let chunk = self.chunk_alloc(arena)?;
        let (page, zeroed) = chunk.alloc_run(npages)?;
        Some((chunk.page_addr(page), zeroed))
    }

    fn run_dalloc(&mut self, chunk: &mut Chunk, start: usize, npages: usize) {
        if chunk.free_run(start, npages) {
            self.chunk_dealloc(chunk.start());
        }
    }

    fn chunk_alloc(&mut self, arena: &Arena) -> Option<&'static mut Chunk> {
        if !self.spare.is_zero() {
            let addr = self.spare;
            self.spare = Address::ZERO;
            self.chunks.insert(addr);
            return Some(unsafe { Chunk::from_ptr(addr) });
        }
        let (addr, zeroed) = crate::plan().chunks.acquire(CHUNK_SIZE)?;
        let chunk = unsafe { Chunk::init(addr, arena.addr(), zeroed) };
        self.chunks.insert(addr);
        Some(chunk)
    }

    fn chunk_dealloc(&mut self, addr: Address) {
        self.chunks.remove(&addr);
        if crate::plan().options().hint {
            // Release eagerly; no spare caching.
            crate::plan().chunks.release(addr, CHUNK_SIZE);
            return;
        }
        let old_spare = self.spare;
        self.spare = addr;
        if !old_spare.is_zero() {
            crate::plan().chunks.release(old_spare, CHUNK_SIZE);
        }
    }
}

/// Usable size of an arena-backed allocation. Reads only map entries and the
/// run header, both stable while the allocation is live, so no lock is
/// needed.
pub fn salloc(ptr: Address) -> usize {
    let chunk = unsafe { Chunk::from_ptr(ptr) };
    let page = chunk.page_index(ptr);
    match chunk.entry(page) {
        PageEntry::Allocated { pages, pos } => {
            if pos == 0 && ptr.is_aligned_to(PAGE) {
                (pages as usize) << LOG_PAGE
            } else {
                let run = unsafe { Run::from_addr(chunk.page_addr(page - pos as usize)) };
                reg_size(run.bin_index())
            }
        }
        _ => invalid_pointer(ptr),
    }
}

/// True when the pointer refers to a bin region rather than a page run.
pub fn is_small(ptr: Address) -> bool {
    let chunk = unsafe { Chunk::from_ptr(ptr) };
    match chunk.entry(chunk.page_index(ptr)) {
        PageEntry::Allocated { pos, .. } => pos != 0 || !ptr.is_aligned_to(PAGE),
        _ => invalid_pointer(ptr),
    }
}

#[cold]
fn invalid_pointer(ptr: Address) -> ! {
    allockit::println!("error: invalid pointer passed to free: {:?}", ptr);
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> &'static Arena {
        crate::plan().arenas.bind()
    }

    #[test]
    fn small_regions_are_recycled_lowest_first() {
        let arena = arena();
        // A size class nothing else in this test binary touches.
        let a = arena.malloc_small(80, false).unwrap();
        let b = arena.malloc_small(80, false).unwrap();
        assert_ne!(a, b);
        arena.dalloc(a);
        let c = arena.malloc_small(80, false).unwrap();
        assert_eq!(a, c);
        arena.dalloc(b);
        arena.dalloc(c);
    }

    #[test]
    fn salloc_reports_placement_sizes() {
        let arena = arena();
        let p = arena.malloc_small(100, false).unwrap();
        assert_eq!(salloc(p), 112);
        assert!(is_small(p));
        let q = arena.malloc_large(6 * PAGE, false).unwrap();
        assert!(q.is_aligned_to(PAGE));
        assert_eq!(salloc(q), 6 * PAGE);
        assert!(!is_small(q));
        arena.dalloc(p);
        arena.dalloc(q);
    }

    #[test]
    fn aligned_runs_return_their_slack() {
        let arena = arena();
        let align = 16 * PAGE;
        let p = arena.palloc(align, 2 * PAGE, false).unwrap();
        assert!(p.is_aligned_to(align));
        assert_eq!(salloc(p), 2 * PAGE);
        // The trimmed slack is allocatable again.
        let q = arena.malloc_large(PAGE, false).unwrap();
        assert!(!q.is_zero());
        arena.dalloc(p);
        arena.dalloc(q);
    }

    #[test]
    fn lazy_frees_survive_a_sweep() {
        let arena = arena();
        let mut prng = Lcg::new(12345, 12347, 42);
        let ptrs: Vec<_> = (0..2048)
            .map(|_| arena.malloc_small(24, false).unwrap())
            .collect();
        // More frees than cache slots, so sweeps must happen (when the
        // cache is enabled at all).
        for p in ptrs {
            arena.dalloc_lazy(p, &mut prng);
        }
        let p = arena.malloc_small(24, false).unwrap();
        assert_eq!(salloc(p), 32);
        arena.dalloc(p);
    }

    #[test]
    fn emptied_runs_leave_the_bin_for_good() {
        let arena = arena();
        let info = crate::bin::BinInfo::new(2048);
        // Fill one run to the brim, then drain it completely.
        let ptrs: Vec<_> = (0..info.nregs)
            .map(|_| arena.malloc_small(2048, false).unwrap())
            .collect();
        for &p in &ptrs {
            arena.dalloc(p);
        }
        // The run's pages went back to the chunk. A new region and a fresh
        // page run must not land on top of each other.
        let q = arena.malloc_small(2048, false).unwrap();
        let r = arena.malloc_large(8 * PAGE, false).unwrap();
        assert!(q + 2048 <= r || r + 8 * PAGE <= q);
        arena.dalloc(q);
        arena.dalloc(r);
    }

    #[test]
    fn freed_regions_satisfy_new_requests_without_growth() {
        let arena = arena();
        let ptrs: Vec<_> = (0..1000)
            .map(|_| arena.malloc_small(144, false).unwrap())
            .collect();
        // Free every other region; the survivors keep every run alive.
        let mut freed = std::collections::HashSet::new();
        for &p in ptrs.iter().step_by(2) {
            arena.dalloc(p);
            freed.insert(p);
        }
        // New requests are served from the holes just opened, not from new
        // runs or chunks.
        let again: Vec<_> = (0..freed.len())
            .map(|_| arena.malloc_small(144, false).unwrap())
            .collect();
        for p in &again {
            assert!(freed.contains(p));
        }
        for &p in ptrs.iter().skip(1).step_by(2) {
            arena.dalloc(p);
        }
        for p in again {
            arena.dalloc(p);
        }
    }

    #[test]
    fn zero_requests_skip_memset_only_for_virgin_pages() {
        let arena = arena();
        let npages = 3;
        let a = arena.malloc_large(npages * PAGE, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(a.as_ptr::<u8>(), npages * PAGE) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { std::ptr::write_bytes(a.as_mut_ptr::<u8>(), 0xee, npages * PAGE) };
        arena.dalloc(a);
        let b = arena.malloc_large(npages * PAGE, true).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(b.as_ptr::<u8>(), npages * PAGE) };
        assert!(bytes.iter().all(|&b| b == 0));
        arena.dalloc(b);
    }
}
