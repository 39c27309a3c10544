//! The arena table.
//!
//! The number of arenas is fixed at startup from the CPU count (four per
//! CPU on multiprocessors, adjustable by the `narenas_shift` option), but
//! arenas other than the first are only constructed when a thread is first
//! pointed at them. Threads start out assigned round-robin and may later be
//! redirected by the contention balancer to a uniformly random arena.

use std::sync::atomic::{AtomicUsize, Ordering};

use allockit::options::Options;
use spin::Mutex;

use crate::arena::Arena;
use crate::prng::Lcg;

const MAX_ARENAS: usize = 1 << 12;

pub struct ArenaSet {
    table: Mutex<Vec<Option<&'static Arena>>>,
    narenas: usize,
    log_narenas: usize,
    next: AtomicUsize,
    balance_threshold: usize,
    lazy_free_log_slots: Option<usize>,
}

impl ArenaSet {
    pub fn new(options: &Options) -> Self {
        let mut n = num_cpus::get();
        if n > 1 {
            n <<= 2;
        }
        let shift = options.narenas_shift;
        if shift >= 0 {
            n = n.checked_shl(shift as u32).unwrap_or(MAX_ARENAS);
        } else {
            n >>= (-shift) as u32;
        }
        let narenas = n.clamp(1, MAX_ARENAS);
        // Contention balancing and the lazy-free cache are pointless with a
        // single arena.
        let balance_threshold = if narenas > 1 {
            options.balance_threshold
        } else {
            0
        };
        let lazy_free_log_slots = if narenas > 1 {
            options.lazy_free_log_slots
        } else {
            None
        };
        let set = Self {
            table: Mutex::new(vec![None; narenas]),
            narenas,
            log_narenas: narenas.ilog2() as usize,
            next: AtomicUsize::new(1),
            balance_threshold,
            lazy_free_log_slots,
        };
        // Arena 0 exists from the start; it serves early allocations and
        // single-arena configurations.
        set.get(0);
        set
    }

    pub fn narenas(&self) -> usize {
        self.narenas
    }

    /// Initial arena assignment for a new thread.
    pub fn bind(&self) -> &'static Arena {
        if self.narenas == 1 {
            return self.get(0);
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.narenas;
        self.get(index)
    }

    /// Re-draw an arena assignment for an overloaded thread.
    pub fn rebalance(&self, prng: &mut Lcg) -> &'static Arena {
        let bits = usize::max(self.log_narenas, 1);
        let index = prng.next_bits(bits) as usize % self.narenas;
        self.get(index)
    }

    fn get(&self, index: usize) -> &'static Arena {
        let mut table = self.table.lock();
        if let Some(arena) = table[index] {
            return arena;
        }
        let arena: &'static Arena = Box::leak(Box::new(Arena::new(
            self.balance_threshold,
            self.lazy_free_log_slots,
        )));
        table[index] = Some(arena);
        arena
    }

    pub fn pre_fork(&self) {
        let table = self.table.lock();
        for arena in table.iter().flatten() {
            arena.pre_fork();
        }
        std::mem::forget(table);
    }

    pub fn post_fork(&self) {
        // The table lock is still held from pre_fork. Nothing that holds it
        // ever waits on an arena lock, so re-acquiring it here is safe.
        unsafe { self.table.force_unlock() };
        let table = self.table.lock();
        for arena in table.iter().flatten() {
            arena.post_fork();
        }
    }
}
