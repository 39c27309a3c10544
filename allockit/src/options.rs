/// Runtime policy knobs, fixed at plan construction time.
#[derive(Clone, Debug)]
pub struct Options {
    /// Return null for zero-sized requests instead of a minimal allocation.
    pub zero_size_null: bool,
    /// Abort on exhaustion instead of returning null.
    pub fail_fast: bool,
    /// Fill new allocations with 0xa5 and freed memory with 0x5a.
    pub junk: bool,
    /// Zero-fill every allocation.
    pub zero: bool,
    /// Release cached memory eagerly and hand reusable pages to the kernel.
    pub hint: bool,
    /// log2 of the per-arena lazy-free slot count; `None` disables the cache.
    pub lazy_free_log_slots: Option<usize>,
    /// Exponentially-averaged contention level that triggers arena
    /// reassignment.
    pub balance_threshold: usize,
    /// Signed shift applied to the derived arena count.
    pub narenas_shift: i32,
    /// Serve chunks from one contiguous reserved segment instead of
    /// scattered mappings.
    pub segment: bool,
    /// log2 of the reserved segment size.
    pub segment_log_size: usize,
}

impl Options {
    pub const DEFAULT: Self = Self {
        zero_size_null: false,
        fail_fast: false,
        junk: false,
        zero: false,
        hint: false,
        lazy_free_log_slots: Some(8),
        balance_threshold: 128,
        narenas_shift: 0,
        segment: false,
        segment_log_size: 36,
    };
}

impl Default for Options {
    fn default() -> Self {
        Self::DEFAULT
    }
}
