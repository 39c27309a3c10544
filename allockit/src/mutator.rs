use std::alloc::Layout;
use std::ptr;

use crate::plan::Plan;
use crate::util::Address;

pub trait Mutator: Sized + 'static + TLS {
    type Plan: Plan<Mutator = Self>;

    fn new() -> Self;

    fn current() -> &'static mut Self {
        <Self as TLS>::current()
    }

    fn plan() -> &'static Self::Plan {
        Self::Plan::get()
    }

    fn alloc(&mut self, layout: Layout) -> Option<Address>;

    fn alloc_zeroed(&mut self, layout: Layout) -> Option<Address> {
        let size = layout.size();
        let ptr = self.alloc(layout);
        if let Some(ptr) = ptr {
            unsafe { ptr::write_bytes(ptr.as_mut_ptr::<u8>(), 0, size) };
        }
        ptr
    }

    fn dealloc(&mut self, ptr: Address);

    fn realloc(&mut self, ptr: Address, new_layout: Layout) -> Option<Address> {
        let layout = Self::Plan::get_layout(ptr);
        if layout.size() >= new_layout.size() && layout.align() >= new_layout.align() {
            return Some(ptr);
        }
        let new_ptr = self.alloc(new_layout);
        if let Some(new_ptr) = new_ptr {
            unsafe {
                ptr::copy_nonoverlapping(
                    ptr.as_ptr::<u8>(),
                    new_ptr.as_mut_ptr::<u8>(),
                    usize::min(layout.size(), new_layout.size()),
                );
            }
            self.dealloc(ptr);
        }
        new_ptr
    }
}

pub trait TLS: Sized {
    fn current() -> &'static mut Self;
}
