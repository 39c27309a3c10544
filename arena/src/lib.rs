//! A multi-arena malloc.
//!
//! Requests are split three ways by size: small requests are rounded to a
//! size class and served from bitmap-managed runs, large requests get whole
//! page runs, and anything past `ARENA_MAXCLASS` gets its own chunk-multiple
//! mapping. Threads are spread across arenas sized to the CPU count, with
//! contention-driven rebalancing and a lock-free lazy-free cache for
//! cross-arena frees.
#![feature(thread_local)]
#![feature(allocator_api)]

mod arena;
mod arenas;
mod bin;
mod chunk;
mod chunks;
mod huge;
mod prng;
mod run;
pub mod size_class;

use std::alloc::Layout;

use allockit::options::Options;
use allockit::util::Address;
use allockit::{Mutator, Plan};

use crate::arena::Arena;
use crate::arenas::ArenaSet;
use crate::chunk::{Chunk, ARENA_MAXCLASS};
use crate::chunks::ChunkManager;
use crate::huge::Huge;
use crate::prng::Lcg;
use crate::size_class::*;

#[allockit::plan]
pub struct ArenaMalloc {
    options: Options,
    chunks: ChunkManager,
    huge: Huge,
    arenas: ArenaSet,
}

pub(crate) fn plan() -> &'static ArenaMalloc {
    ArenaMalloc::get()
}

impl Plan for ArenaMalloc {
    type Mutator = ArenaMutator;

    fn new() -> Self {
        let options = Options::default();
        Self {
            chunks: ChunkManager::new(options.segment, options.segment_log_size, options.hint),
            huge: Huge::new(),
            arenas: ArenaSet::new(&options),
            options,
        }
    }

    fn get_layout(ptr: Address) -> Layout {
        let plan = Self::get();
        let size = if ptr.is_aligned_to(CHUNK_SIZE) {
            plan.huge.size(ptr)
        } else {
            arena::salloc(ptr)
        };
        // Alignment is not recorded per allocation; the address itself is
        // the best truthful answer.
        let align = 1usize << usize::min(ptr.as_usize().trailing_zeros() as usize, LOG_CHUNK);
        unsafe { Layout::from_size_align_unchecked(size, align) }
    }

    fn options(&self) -> &Options {
        &self.options
    }

    fn pre_fork(&self) {
        self.arenas.pre_fork();
        self.huge.pre_fork();
        self.chunks.pre_fork();
    }

    fn post_fork(&self) {
        self.chunks.post_fork();
        self.huge.post_fork();
        self.arenas.post_fork();
    }
}

#[allockit::mutator]
pub struct ArenaMutator {
    arena: &'static Arena,
    lazy_prng: Lcg,
    balance_prng: Lcg,
}

impl ArenaMutator {
    fn alloc_impl(&mut self, layout: Layout, zero: bool) -> Option<Address> {
        let plan = Self::plan();
        let zero = zero || plan.options.zero;
        let align = layout.align();
        if align > QUANTUM {
            return self.alloc_aligned(usize::max(layout.size(), 1), align, zero);
        }
        // Sub-quantum alignments still bind: a zero-size or undersized
        // request must not come back from a bin smaller than its alignment.
        let size = usize::max(usize::max(layout.size(), 1), align);
        if size <= BIN_MAXCLASS {
            self.arena.malloc_small(size, zero)
        } else if size <= ARENA_MAXCLASS {
            self.arena.malloc_large(page_ceiling(size)?, zero)
        } else {
            plan.huge.malloc(&plan.chunks, size, zero)
        }
    }

    fn alloc_aligned(&mut self, size: usize, align: usize, zero: bool) -> Option<Address> {
        let plan = Self::plan();
        if let Some(pow2) = usize::max(size, align).checked_next_power_of_two() {
            if align <= PAGE && pow2 <= BIN_MAXCLASS {
                // Power-of-two classes are naturally aligned to their size.
                return self.arena.malloc_small(pow2, zero);
            }
        }
        let psize = page_ceiling(size)?;
        if align <= PAGE && psize <= ARENA_MAXCLASS {
            return self.arena.malloc_large(psize, zero);
        }
        if align < CHUNK_SIZE {
            if let Some(padded) = psize.checked_add(align) {
                if padded - PAGE <= ARENA_MAXCLASS {
                    return self.arena.palloc(align, psize, zero);
                }
            }
        }
        if align <= CHUNK_SIZE {
            return plan.huge.malloc(&plan.chunks, size, zero);
        }
        plan.huge.palloc(&plan.chunks, align, size, zero)
    }

    /// Move an allocation because its placement no longer fits the request.
    fn realloc_move(&mut self, ptr: Address, new_layout: Layout) -> Option<Address> {
        let old_size = ArenaMalloc::get_layout(ptr).size();
        let new_ptr = self.alloc(new_layout)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr.as_ptr::<u8>(),
                new_ptr.as_mut_ptr::<u8>(),
                usize::min(old_size, new_layout.size()),
            );
        }
        self.dealloc(ptr);
        Some(new_ptr)
    }

    fn maybe_rebalance(&mut self) {
        if self.arena.take_rebalance() {
            self.arena = Self::plan().arenas.rebalance(&mut self.balance_prng);
        }
    }
}

impl Mutator for ArenaMutator {
    type Plan = ArenaMalloc;

    fn new() -> Self {
        let seed = prng::thread_seed();
        Self {
            arena: Self::plan().arenas.bind(),
            lazy_prng: Lcg::new(12345, 12347, seed),
            balance_prng: Lcg::new(1297, 1301, seed ^ 0x5555_5555),
        }
    }

    fn alloc(&mut self, layout: Layout) -> Option<Address> {
        let result = self.alloc_impl(layout, false);
        self.maybe_rebalance();
        result
    }

    fn alloc_zeroed(&mut self, layout: Layout) -> Option<Address> {
        let result = self.alloc_impl(layout, true);
        self.maybe_rebalance();
        result
    }

    fn dealloc(&mut self, ptr: Address) {
        let plan = Self::plan();
        if ptr.is_aligned_to(CHUNK_SIZE) {
            plan.huge.dalloc(&plan.chunks, ptr);
        } else {
            let owner = unsafe {
                let chunk = Chunk::from_ptr(ptr);
                chunk.arena().as_ref::<Arena>()
            };
            if plan.arenas.narenas() > 1
                && plan.options.lazy_free_log_slots.is_some()
                && arena::is_small(ptr)
            {
                owner.dalloc_lazy(ptr, &mut self.lazy_prng);
            } else {
                owner.dalloc(ptr);
            }
            self.maybe_rebalance();
        }
    }

    fn realloc(&mut self, ptr: Address, new_layout: Layout) -> Option<Address> {
        let plan = Self::plan();
        let size = usize::max(new_layout.size(), 1);
        let align = new_layout.align();
        if ptr.is_aligned_to(CHUNK_SIZE) {
            if align <= CHUNK_SIZE && size > ARENA_MAXCLASS {
                let old_size = plan.huge.size(ptr);
                return plan.huge.ralloc(&plan.chunks, ptr, size, old_size);
            }
        } else if ptr.is_aligned_to(align) {
            // Stay in place when the size class does not change.
            let old_size = arena::salloc(ptr);
            if old_size <= BIN_MAXCLASS {
                if size <= BIN_MAXCLASS && small_size_class(size) == old_size {
                    return Some(ptr);
                }
            } else if size > BIN_MAXCLASS
                && size <= ARENA_MAXCLASS
                && page_ceiling(size) == Some(old_size)
            {
                return Some(ptr);
            }
        }
        self.realloc_move(ptr, new_layout)
    }
}

#[cfg(test)]
mod tests {
    allockit::rust_allocator_tests!(crate::Global);
}
