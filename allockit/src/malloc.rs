use crate::util::constants::MIN_ALIGNMENT;
use crate::util::Lazy;
use crate::Mutator;
use crate::Plan;
use core::{alloc::Layout, ptr};

pub struct MallocAPI<P: Plan>(&'static Lazy<P>);

#[allow(unused)]
impl<P: Plan> MallocAPI<P> {
    pub const MIN_ALIGNMENT: usize = MIN_ALIGNMENT;
    pub const PAGE_SIZE: usize = crate::util::constants::PAGE_SIZE;

    pub const fn new(plan: &'static Lazy<P>) -> Self {
        Self(plan)
    }

    pub fn mutator(&self) -> &'static mut P::Mutator {
        P::Mutator::current()
    }

    /// `None` when rounding `value` up would overflow.
    pub const fn align_up(value: usize, align: usize) -> Option<usize> {
        let mask = align - 1;
        match value.checked_add(mask) {
            Some(v) => Some(v & !mask),
            None => None,
        }
    }

    pub fn set_error(e: i32) {
        errno::set_errno(errno::Errno(e));
    }

    pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        P::get_layout(ptr.into()).size()
    }

    pub unsafe fn alloc(&self, size: usize, align: usize) -> Result<Option<*mut u8>, i32> {
        let mut size = size;
        if size == 0 {
            if self.0.options().zero_size_null {
                return Ok(None);
            }
            size = 1;
        }
        let Some(size) = Self::align_up(size, align) else {
            return Err(libc::ENOMEM);
        };
        let layout = Layout::from_size_align_unchecked(size, align);
        match self.mutator().alloc(layout) {
            Some(ptr) => Ok(Some(ptr.as_mut_ptr())),
            None => Err(libc::ENOMEM),
        }
    }

    #[cold]
    pub fn exhausted(&self) -> *mut u8 {
        if self.0.options().fail_fast {
            println!("error: out of memory");
            std::process::abort();
        }
        Self::set_error(libc::ENOMEM);
        ptr::null_mut()
    }

    pub unsafe fn alloc_or_enomem(&self, size: usize, align: usize) -> *mut u8 {
        match self.alloc(size, align) {
            Ok(ptr) => ptr.unwrap_or(ptr::null_mut()),
            Err(_) => self.exhausted(),
        }
    }

    pub unsafe fn calloc_or_enomem(&self, count: usize, size: usize) -> *mut u8 {
        let Some(mut total) = count.checked_mul(size) else {
            return self.exhausted();
        };
        if total == 0 {
            if self.0.options().zero_size_null {
                return ptr::null_mut();
            }
            total = 1;
        }
        let Some(total) = Self::align_up(total, Self::MIN_ALIGNMENT) else {
            return self.exhausted();
        };
        let layout = Layout::from_size_align_unchecked(total, Self::MIN_ALIGNMENT);
        match self.mutator().alloc_zeroed(layout) {
            Some(ptr) => ptr.as_mut_ptr(),
            None => self.exhausted(),
        }
    }

    pub unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        self.mutator().dealloc(ptr.into());
    }

    pub unsafe fn reallocate_or_enomem(
        &self,
        ptr: *mut u8,
        new_size: usize,
        free_if_new_size_is_zero: bool,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc_or_enomem(new_size, Self::MIN_ALIGNMENT);
        }
        if free_if_new_size_is_zero && new_size == 0 {
            self.free(ptr);
            return ptr::null_mut();
        }
        let Some(new_size) = Self::align_up(usize::max(new_size, 1), Self::MIN_ALIGNMENT) else {
            return self.exhausted();
        };
        let new_layout = Layout::from_size_align_unchecked(new_size, Self::MIN_ALIGNMENT);
        match self.mutator().realloc(ptr.into(), new_layout) {
            Some(ptr) => ptr.as_mut_ptr(),
            None => self.exhausted(),
        }
    }

    pub unsafe fn posix_memalign(
        &self,
        result: *mut *mut u8,
        alignment: usize,
        size: usize,
    ) -> i32 {
        if alignment < std::mem::size_of::<usize>() || !alignment.is_power_of_two() {
            return libc::EINVAL;
        }
        match self.alloc(size, usize::max(alignment, Self::MIN_ALIGNMENT)) {
            Ok(ptr) => {
                *result = ptr.unwrap_or(ptr::null_mut());
                0
            }
            Err(e) => e,
        }
    }

    pub unsafe fn memalign(&self, alignment: usize, size: usize) -> *mut u8 {
        let mut result = ptr::null_mut();
        let errno = self.posix_memalign(&mut result, alignment, size);
        if result.is_null() && errno != 0 {
            Self::set_error(errno)
        }
        result
    }

    pub unsafe fn aligned_alloc(
        &self,
        size: usize,
        alignment: usize,
        einval_if_size_is_not_aligned: bool,
    ) -> *mut u8 {
        if !alignment.is_power_of_two()
            || (einval_if_size_is_not_aligned && (size & (alignment - 1)) != 0)
        {
            Self::set_error(libc::EINVAL);
            return ptr::null_mut();
        }
        self.memalign(alignment, size)
    }
}

#[macro_export]
macro_rules! export_malloc_api {
    ($plan: ident, $plan_ty: ty) => {
        #[cfg(feature = "malloc")]
        pub mod __allockit_c_api {
            use $crate::Plan;
            type ConcretePlan = $plan_ty;
            type Malloc = $crate::malloc::MallocAPI<ConcretePlan>;
            static MALLOC_IMPL: Malloc =
                $crate::malloc::MallocAPI::<ConcretePlan>::new(&super::$plan);

            #[$crate::ctor]
            unsafe fn ctor() {
                $crate::hooks::process_start::<ConcretePlan>(&super::$plan);
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
                MALLOC_IMPL.alloc_or_enomem(size, Malloc::MIN_ALIGNMENT)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
                MALLOC_IMPL.usable_size(ptr)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn free(ptr: *mut u8) {
                MALLOC_IMPL.free(ptr)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn cfree(ptr: *mut u8) {
                MALLOC_IMPL.free(ptr)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut u8 {
                MALLOC_IMPL.calloc_or_enomem(count, size)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn valloc(size: usize) -> *mut u8 {
                MALLOC_IMPL.alloc_or_enomem(size, Malloc::PAGE_SIZE)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn pvalloc(size: usize) -> *mut u8 {
                match Malloc::align_up(size, Malloc::PAGE_SIZE) {
                    Some(size) => MALLOC_IMPL.alloc_or_enomem(size, Malloc::PAGE_SIZE),
                    None => MALLOC_IMPL.exhausted(),
                }
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
                MALLOC_IMPL.reallocate_or_enomem(ptr, size, true)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn posix_memalign(
                ptr: *mut *mut u8,
                alignment: usize,
                size: usize,
            ) -> i32 {
                MALLOC_IMPL.posix_memalign(ptr, alignment, size)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
                MALLOC_IMPL.memalign(alignment, size)
            }

            #[$crate::interpose]
            pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
                MALLOC_IMPL.aligned_alloc(size, alignment, true)
            }
        }
    };
}
