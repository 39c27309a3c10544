/// Exports a `Global` handle implementing the Rust `Allocator` and
/// `GlobalAlloc` traits on top of a plan's mutator, mainly so the allocator
/// can be exercised in-process by the test harness.
#[macro_export]
#[doc(hidden)]
macro_rules! export_rust_global_alloc_api {
    ($plan_ty: ty) => {
        pub mod __allockit_rust_api {
            use ::std::alloc::Layout;
            use $crate::Mutator;
            use $crate::Plan;

            type ConcretePlan = $plan_ty;

            pub struct Global;

            impl Global {
                pub fn __fix_layout(mut layout: Layout) -> Layout {
                    if layout.align() < $crate::util::constants::MIN_ALIGNMENT {
                        layout = layout
                            .align_to($crate::util::constants::MIN_ALIGNMENT)
                            .unwrap();
                    }
                    layout.pad_to_align()
                }

                fn slice(
                    start: $crate::util::Address,
                    len: usize,
                ) -> ::std::result::Result<::std::ptr::NonNull<[u8]>, ::std::alloc::AllocError>
                {
                    if start.is_zero() {
                        return ::std::result::Result::Err(::std::alloc::AllocError);
                    }
                    let slice = unsafe {
                        ::std::slice::from_raw_parts_mut(start.as_mut_ptr::<u8>(), len)
                    };
                    ::std::result::Result::Ok(::std::ptr::NonNull::from(slice))
                }
            }

            unsafe impl ::std::alloc::Allocator for Global {
                fn allocate(
                    &self,
                    mut layout: Layout,
                ) -> ::std::result::Result<::std::ptr::NonNull<[u8]>, ::std::alloc::AllocError>
                {
                    layout = Self::__fix_layout(layout);
                    let start = <ConcretePlan as Plan>::Mutator::current()
                        .alloc(layout)
                        .unwrap_or($crate::util::Address::ZERO);
                    Self::slice(start, layout.size())
                }

                fn allocate_zeroed(
                    &self,
                    mut layout: Layout,
                ) -> ::std::result::Result<::std::ptr::NonNull<[u8]>, ::std::alloc::AllocError>
                {
                    layout = Self::__fix_layout(layout);
                    let start = <ConcretePlan as Plan>::Mutator::current()
                        .alloc_zeroed(layout)
                        .unwrap_or($crate::util::Address::ZERO);
                    Self::slice(start, layout.size())
                }

                unsafe fn deallocate(&self, ptr: ::std::ptr::NonNull<u8>, _layout: Layout) {
                    <ConcretePlan as Plan>::Mutator::current().dealloc(ptr.as_ptr().into())
                }

                unsafe fn grow(
                    &self,
                    ptr: ::std::ptr::NonNull<u8>,
                    old_layout: Layout,
                    mut new_layout: Layout,
                ) -> ::std::result::Result<::std::ptr::NonNull<[u8]>, ::std::alloc::AllocError>
                {
                    debug_assert!(new_layout.size() >= old_layout.size());
                    new_layout = Self::__fix_layout(new_layout);
                    let start = <ConcretePlan as Plan>::Mutator::current()
                        .realloc(ptr.as_ptr().into(), new_layout)
                        .unwrap_or($crate::util::Address::ZERO);
                    Self::slice(start, new_layout.size())
                }

                unsafe fn grow_zeroed(
                    &self,
                    ptr: ::std::ptr::NonNull<u8>,
                    old_layout: Layout,
                    mut new_layout: Layout,
                ) -> ::std::result::Result<::std::ptr::NonNull<[u8]>, ::std::alloc::AllocError>
                {
                    debug_assert!(new_layout.size() >= old_layout.size());
                    new_layout = Self::__fix_layout(new_layout);
                    let start = <ConcretePlan as Plan>::Mutator::current()
                        .realloc(ptr.as_ptr().into(), new_layout)
                        .unwrap_or($crate::util::Address::ZERO);
                    // The caller only owns the first `old_layout.size()`
                    // bytes; everything past them must read as zero, even
                    // when the reallocation stayed in place inside a larger
                    // usable size.
                    if !start.is_zero() && new_layout.size() > old_layout.size() {
                        unsafe {
                            ::std::ptr::write_bytes(
                                (start + old_layout.size()).as_mut_ptr::<u8>(),
                                0,
                                new_layout.size() - old_layout.size(),
                            )
                        };
                    }
                    Self::slice(start, new_layout.size())
                }

                unsafe fn shrink(
                    &self,
                    ptr: ::std::ptr::NonNull<u8>,
                    old_layout: Layout,
                    mut new_layout: Layout,
                ) -> ::std::result::Result<::std::ptr::NonNull<[u8]>, ::std::alloc::AllocError>
                {
                    debug_assert!(new_layout.size() <= old_layout.size());
                    new_layout = Self::__fix_layout(new_layout);
                    let start = <ConcretePlan as Plan>::Mutator::current()
                        .realloc(ptr.as_ptr().into(), new_layout)
                        .unwrap_or($crate::util::Address::ZERO);
                    Self::slice(start, new_layout.size())
                }
            }

            unsafe impl ::std::alloc::GlobalAlloc for Global {
                unsafe fn alloc(&self, mut layout: Layout) -> *mut u8 {
                    layout = Self::__fix_layout(layout);
                    <ConcretePlan as Plan>::Mutator::current()
                        .alloc(layout)
                        .unwrap_or($crate::util::Address::ZERO)
                        .as_mut_ptr()
                }

                unsafe fn alloc_zeroed(&self, mut layout: Layout) -> *mut u8 {
                    layout = Self::__fix_layout(layout);
                    <ConcretePlan as Plan>::Mutator::current()
                        .alloc_zeroed(layout)
                        .unwrap_or($crate::util::Address::ZERO)
                        .as_mut_ptr()
                }

                unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
                    <ConcretePlan as Plan>::Mutator::current().dealloc(ptr.into())
                }

                unsafe fn realloc(
                    &self,
                    ptr: *mut u8,
                    layout: Layout,
                    new_size: usize,
                ) -> *mut u8 {
                    let mut new_layout =
                        Layout::from_size_align_unchecked(new_size, layout.align());
                    new_layout = Self::__fix_layout(new_layout);
                    <ConcretePlan as Plan>::Mutator::current()
                        .realloc(ptr.into(), new_layout)
                        .unwrap_or($crate::util::Address::ZERO)
                        .as_mut_ptr()
                }
            }
        }
    };
}
