pub const MIN_ALIGNMENT: usize = 16;

pub const LOG_PAGE_SIZE: usize = 12;
pub const PAGE_SIZE: usize = 1 << LOG_PAGE_SIZE;

pub const LOG_CACHELINE_SIZE: usize = 6;
pub const CACHELINE_SIZE: usize = 1 << LOG_CACHELINE_SIZE;
