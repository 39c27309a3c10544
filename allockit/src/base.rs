//! Bootstrap metadata allocator.
//!
//! Everything the allocator itself allocates at the Rust level (index nodes,
//! arena objects, boxed slices) is served here, straight out of private
//! mappings. Small blocks are bump-allocated in cacheline-rounded
//! power-of-two classes and recycled through per-class LIFO free lists;
//! anything larger than a page gets its own mapping.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr;

use spin::Mutex;

use crate::util::constants::{CACHELINE_SIZE, LOG_CACHELINE_SIZE, PAGE_SIZE};
use crate::util::{Address, RawMemory};

const LOG_REGION_SIZE: usize = 20;
const REGION_SIZE: usize = 1 << LOG_REGION_SIZE;

// Classes 64, 128, 256, 512, 1024, 2048.
const NUM_CLASSES: usize = 6;
const MAX_CLASS_SIZE: usize = CACHELINE_SIZE << (NUM_CLASSES - 1);

struct BaseSpace {
    cursor: Address,
    limit: Address,
    free_lists: [Address; NUM_CLASSES],
}

static SPACE: Mutex<BaseSpace> = Mutex::new(BaseSpace {
    cursor: Address::ZERO,
    limit: Address::ZERO,
    free_lists: [Address::ZERO; NUM_CLASSES],
});

fn size_class(layout: Layout) -> Option<usize> {
    let size = usize::max(layout.size(), layout.align())
        .next_power_of_two()
        .max(CACHELINE_SIZE);
    if size > MAX_CLASS_SIZE {
        None
    } else {
        Some(size.trailing_zeros() as usize - LOG_CACHELINE_SIZE)
    }
}

impl BaseSpace {
    fn alloc_small(&mut self, class: usize) -> Option<Address> {
        let head = self.free_lists[class];
        if !head.is_zero() {
            self.free_lists[class] = unsafe { head.load::<Address>() };
            return Some(head);
        }
        let size = CACHELINE_SIZE << class;
        let mut cursor = self.cursor.align_up(size);
        if cursor.is_zero() || cursor + size > self.limit {
            let region = RawMemory::map_anonymous(REGION_SIZE).ok()?;
            self.cursor = region;
            self.limit = region + REGION_SIZE;
            cursor = region;
        }
        self.cursor = cursor + size;
        Some(cursor)
    }

    fn dealloc_small(&mut self, ptr: Address, class: usize) {
        unsafe { ptr.store(self.free_lists[class]) };
        self.free_lists[class] = ptr;
    }
}

fn alloc_large(layout: Layout) -> Option<Address> {
    let size = (layout.size() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    if layout.align() <= PAGE_SIZE {
        return RawMemory::map_anonymous(size).ok();
    }
    // Over-map, then trim down to an aligned span.
    let padded = size + layout.align();
    let raw = RawMemory::map_anonymous(padded).ok()?;
    let start = raw.align_up(layout.align());
    if start > raw {
        RawMemory::unmap(raw, start - raw);
    }
    let end = start + size;
    let raw_end = raw + padded;
    if raw_end > end {
        RawMemory::unmap(end, raw_end - end);
    }
    Some(start)
}

pub struct Base;

impl Base {
    pub(crate) fn pre_fork() {
        std::mem::forget(SPACE.lock());
    }

    pub(crate) fn post_fork() {
        unsafe { SPACE.force_unlock() };
    }
}

unsafe impl GlobalAlloc for Base {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = match size_class(layout) {
            Some(class) => SPACE.lock().alloc_small(class),
            None => alloc_large(layout),
        };
        match result {
            Some(a) => a.as_mut_ptr(),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        match size_class(layout) {
            Some(class) => SPACE.lock().dealloc_small(ptr.into(), class),
            None => {
                let size = (layout.size() + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
                RawMemory::unmap(ptr.into(), size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_blocks_are_recycled() {
        let layout = Layout::from_size_align(48, 8).unwrap();
        unsafe {
            let a = Base.alloc(layout);
            assert!(!a.is_null());
            assert_eq!(a as usize % CACHELINE_SIZE, 0);
            Base.dealloc(a, layout);
            let b = Base.alloc(layout);
            assert_eq!(a, b);
            Base.dealloc(b, layout);
        }
    }

    #[test]
    fn large_blocks_come_from_fresh_pages() {
        let layout = Layout::from_size_align(3 * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe {
            let a = Base.alloc(layout);
            assert!(!a.is_null());
            assert_eq!(a as usize % PAGE_SIZE, 0);
            std::ptr::write_bytes(a, 0xab, 3 * PAGE_SIZE);
            Base.dealloc(a, layout);
        }
    }
}
