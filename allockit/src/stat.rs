use std::sync::atomic::{AtomicUsize, Ordering};

static SMALL_ALLOCATIONS: Counter = Counter::new();
static LARGE_ALLOCATIONS: Counter = Counter::new();
static HUGE_ALLOCATIONS: Counter = Counter::new();
static SMALL_DEALLOCATIONS: Counter = Counter::new();
static LARGE_DEALLOCATIONS: Counter = Counter::new();
static HUGE_DEALLOCATIONS: Counter = Counter::new();
static LAZY_FREE_HITS: Counter = Counter::new();
static LAZY_FREE_SWEEPS: Counter = Counter::new();
static CHUNK_MAPS: Counter = Counter::new();
static CHUNK_RECYCLES: Counter = Counter::new();
static CHUNK_UNMAPS: Counter = Counter::new();
static ARENA_REBALANCES: Counter = Counter::new();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocKind {
    Small,
    Large,
    Huge,
}

pub fn track_allocation(kind: AllocKind) {
    match kind {
        AllocKind::Small => SMALL_ALLOCATIONS.inc(1),
        AllocKind::Large => LARGE_ALLOCATIONS.inc(1),
        AllocKind::Huge => HUGE_ALLOCATIONS.inc(1),
    }
}

pub fn track_deallocation(kind: AllocKind) {
    match kind {
        AllocKind::Small => SMALL_DEALLOCATIONS.inc(1),
        AllocKind::Large => LARGE_DEALLOCATIONS.inc(1),
        AllocKind::Huge => HUGE_DEALLOCATIONS.inc(1),
    }
}

pub fn track_lazy_free_hit() {
    LAZY_FREE_HITS.inc(1);
}

pub fn track_lazy_free_sweep() {
    LAZY_FREE_SWEEPS.inc(1);
}

pub fn track_chunk_map() {
    CHUNK_MAPS.inc(1);
}

pub fn track_chunk_recycle() {
    CHUNK_RECYCLES.inc(1);
}

pub fn track_chunk_unmap() {
    CHUNK_UNMAPS.inc(1);
}

pub fn track_rebalance() {
    ARENA_REBALANCES.inc(1);
}

pub struct Counter(AtomicUsize);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    pub fn get(&self) -> usize {
        if cfg!(not(feature = "stat")) {
            return 0;
        }
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self, delta: usize) {
        if cfg!(not(feature = "stat")) {
            return;
        }
        self.0.fetch_add(delta, Ordering::Relaxed);
    }
}

#[cfg(not(feature = "stat"))]
pub(crate) fn report() {}

#[cfg(feature = "stat")]
pub(crate) fn report() {
    println!(
        "alloc: small {} / large {} / huge {}",
        SMALL_ALLOCATIONS.get(),
        LARGE_ALLOCATIONS.get(),
        HUGE_ALLOCATIONS.get()
    );
    println!(
        "dealloc: small {} / large {} / huge {}",
        SMALL_DEALLOCATIONS.get(),
        LARGE_DEALLOCATIONS.get(),
        HUGE_DEALLOCATIONS.get()
    );
    println!(
        "lazy free: {} hits, {} sweeps",
        LAZY_FREE_HITS.get(),
        LAZY_FREE_SWEEPS.get()
    );
    println!(
        "chunks: {} mapped, {} recycled, {} unmapped",
        CHUNK_MAPS.get(),
        CHUNK_RECYCLES.get(),
        CHUNK_UNMAPS.get()
    );
    println!("arena rebalances: {}", ARENA_REBALANCES.get());
}
