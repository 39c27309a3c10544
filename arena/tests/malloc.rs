#![feature(allocator_api)]

use std::alloc::{Allocator, Layout};
use std::collections::HashSet;
use std::ptr::NonNull;

use allockit::Plan;
use arena::size_class::CHUNK_SIZE;
use arena::{ArenaMalloc, Global};

fn alloc(size: usize, align: usize) -> NonNull<u8> {
    let layout = Layout::from_size_align(size, align).unwrap();
    Global.allocate(layout).unwrap().cast()
}

fn free(ptr: NonNull<u8>, size: usize, align: usize) {
    let layout = Layout::from_size_align(size, align).unwrap();
    unsafe { Global.deallocate(ptr, layout) };
}

#[test]
fn small_allocations_are_distinct_and_stable() {
    const N: usize = 1000;
    const SIZE: usize = 16;
    let mut ptrs = Vec::with_capacity(N);
    let mut seen = HashSet::new();
    for i in 0..N {
        let p = alloc(SIZE, 16);
        assert!(seen.insert(p.as_ptr() as usize));
        unsafe { std::ptr::write_bytes(p.as_ptr(), i as u8, SIZE) };
        ptrs.push(p);
    }
    // No allocation overwrote another.
    for (i, p) in ptrs.iter().enumerate() {
        let got = unsafe { std::slice::from_raw_parts(p.as_ptr(), SIZE) };
        assert!(got.iter().all(|&b| b == i as u8));
    }
    for p in ptrs {
        free(p, SIZE, 16);
    }
}

#[test]
fn shrinking_across_classes_moves_and_preserves_data() {
    let old_layout = Layout::from_size_align(1024, 16).unwrap();
    let new_layout = Layout::from_size_align(64, 16).unwrap();
    let p = Global.allocate(old_layout).unwrap().cast::<u8>();
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0x42, 1024) };
    let q = unsafe { Global.shrink(p, old_layout, new_layout) }
        .unwrap()
        .cast::<u8>();
    let got = unsafe { std::slice::from_raw_parts(q.as_ptr(), 64) };
    assert!(got.iter().all(|&b| b == 0x42));
    unsafe { Global.deallocate(q, new_layout) };
}

#[test]
fn usable_size_covers_the_request() {
    for size in [1usize, 7, 16, 100, 512, 1000, 2048, 4096, 100_000, 2 << 20] {
        let p = alloc(size, 16);
        let layout = ArenaMalloc::get_layout(allockit::util::Address::from_usize(
            p.as_ptr() as usize,
        ));
        assert!(layout.size() >= size, "usable {} < requested {}", layout.size(), size);
        free(p, size, 16);
    }
}

#[test]
fn alignment_is_honored() {
    for align in [32usize, 64, 256, 4096, 1 << 15, CHUNK_SIZE, 4 * CHUNK_SIZE] {
        let p = alloc(100, align);
        assert_eq!(p.as_ptr() as usize % align, 0, "align {}", align);
        unsafe { std::ptr::write_bytes(p.as_ptr(), 0xab, 100) };
        free(p, 100, align);
    }
}

#[test]
fn huge_allocations_are_chunk_aligned() {
    let size = 3 * CHUNK_SIZE / 2;
    let p = alloc(size, 16);
    assert_eq!(p.as_ptr() as usize % CHUNK_SIZE, 0);
    let layout =
        ArenaMalloc::get_layout(allockit::util::Address::from_usize(p.as_ptr() as usize));
    assert_eq!(layout.size(), 2 * CHUNK_SIZE);
    free(p, size, 16);
}

#[test]
fn growing_within_a_size_class_keeps_the_pointer() {
    let old_layout = Layout::from_size_align(120, 16).unwrap();
    let new_layout = Layout::from_size_align(128, 16).unwrap();
    let p = Global.allocate(old_layout).unwrap().cast::<u8>();
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0x17, 120) };
    let q = unsafe { Global.grow(p, old_layout, new_layout) }.unwrap().cast::<u8>();
    assert_eq!(p, q);
    let got = unsafe { std::slice::from_raw_parts(q.as_ptr(), 120) };
    assert!(got.iter().all(|&b| b == 0x17));
    unsafe { Global.deallocate(q, new_layout) };
}

#[test]
fn grow_zeroed_clears_the_tail() {
    let old_layout = Layout::from_size_align(100, 16).unwrap();
    let new_layout = Layout::from_size_align(112, 16).unwrap();
    let block = Global.allocate(old_layout).unwrap();
    let p = block.cast::<u8>();
    // Dirty the whole usable block, class padding included.
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0xff, block.len()) };
    let q = unsafe { Global.grow_zeroed(p, old_layout, new_layout) }
        .unwrap()
        .cast::<u8>();
    let got = unsafe { std::slice::from_raw_parts(q.as_ptr(), 112) };
    assert!(got[..100].iter().all(|&b| b == 0xff));
    // Everything past the old requested size must read as zero, even when
    // the reallocation stayed in place.
    assert!(got[100..].iter().all(|&b| b == 0));
    unsafe { Global.deallocate(q, new_layout) };
}

#[test]
fn zero_size_allocations_are_aligned() {
    let layout = Layout::from_size_align(0, 16).unwrap();
    let mut ptrs = Vec::new();
    for _ in 0..64 {
        let p = Global.allocate(layout).unwrap().cast::<u8>();
        assert_eq!(p.as_ptr() as usize % 16, 0);
        ptrs.push(p);
    }
    for p in ptrs {
        unsafe { Global.deallocate(p, layout) };
    }
}

#[test]
fn zeroed_allocations_are_zero() {
    // Dirty a small region, free it, and ask for zeroed memory of the same
    // class; the recycled region must come back clean.
    let p = alloc(64, 16);
    unsafe { std::ptr::write_bytes(p.as_ptr(), 0xff, 64) };
    free(p, 64, 16);
    let layout = Layout::from_size_align(64, 16).unwrap();
    let q = Global.allocate_zeroed(layout).unwrap().cast::<u8>();
    let got = unsafe { std::slice::from_raw_parts(q.as_ptr(), 64) };
    assert!(got.iter().all(|&b| b == 0));
    unsafe { Global.deallocate(q, layout) };

    // Large path, where zero-avoidance tracking kicks in.
    let layout = Layout::from_size_align(300_000, 16).unwrap();
    let r = Global.allocate_zeroed(layout).unwrap().cast::<u8>();
    let got = unsafe { std::slice::from_raw_parts(r.as_ptr(), 300_000) };
    assert!(got.iter().all(|&b| b == 0));
    unsafe { Global.deallocate(r, layout) };
}

#[test]
fn concurrent_allocation_stress() {
    let threads: Vec<_> = (0..8)
        .map(|t| {
            std::thread::spawn(move || {
                let sizes = [8usize, 16, 48, 100, 512, 2048, 5000, 40_000];
                let mut live: Vec<(NonNull<u8>, usize)> = Vec::new();
                for i in 0..10_000 {
                    let size = sizes[(i + t) % sizes.len()];
                    let p = alloc(size, 16);
                    unsafe { std::ptr::write_bytes(p.as_ptr(), (i % 251) as u8, size) };
                    live.push((p, size));
                    if live.len() >= 64 {
                        let (q, qsize) = live.swap_remove(i % live.len());
                        free(q, qsize, 16);
                    }
                }
                for (p, size) in live {
                    free(p, size, 16);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn frees_from_another_thread_are_safe() {
    let ptrs: Vec<(usize, usize)> = std::thread::spawn(|| {
        let sizes = [16usize, 96, 1024, 8192];
        let mut out = Vec::new();
        for i in 0..400 {
            let size = sizes[i % sizes.len()];
            let p = alloc(size, 16);
            unsafe { std::ptr::write_bytes(p.as_ptr(), 0x3c, size) };
            out.push((p.as_ptr() as usize, size));
        }
        out
    })
    .join()
    .unwrap();
    for (addr, size) in ptrs {
        let p = NonNull::new(addr as *mut u8).unwrap();
        let got = unsafe { std::slice::from_raw_parts(p.as_ptr(), size) };
        assert!(got.iter().all(|&b| b == 0x3c));
        free(p, size, 16);
    }
}
