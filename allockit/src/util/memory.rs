use super::constants::PAGE_SIZE;
use super::Address;

#[derive(Debug)]
pub struct MemoryMapError;

/// The only gateway to mmap/munmap/madvise/mprotect.
pub struct RawMemory {
    _private: (),
}

impl RawMemory {
    /// Map pages at exactly `start`. Fails without clobbering existing
    /// mappings if the range is already in use.
    pub fn map(start: Address, size: usize) -> Result<Address, MemoryMapError> {
        debug_assert!((size & (PAGE_SIZE - 1)) == 0, "mmap size is not page aligned");
        let ptr = unsafe {
            libc::mmap(
                start.as_mut_ptr(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED || ptr != start.as_mut_ptr() {
            if ptr != libc::MAP_FAILED {
                // Old kernels may ignore MAP_FIXED_NOREPLACE and place the
                // mapping elsewhere.
                unsafe { libc::munmap(ptr, size) };
            }
            Err(MemoryMapError)
        } else {
            Ok(ptr.into())
        }
    }

    pub fn map_anonymous(size: usize) -> Result<Address, MemoryMapError> {
        debug_assert!((size & (PAGE_SIZE - 1)) == 0, "mmap size is not page aligned");
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(MemoryMapError)
        } else {
            Ok(ptr.into())
        }
    }

    /// Reserve a range of address space with no access permissions.
    pub fn reserve(size: usize) -> Result<Address, MemoryMapError> {
        debug_assert!((size & (PAGE_SIZE - 1)) == 0);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            Err(MemoryMapError)
        } else {
            Ok(ptr.into())
        }
    }

    /// Commit previously reserved pages.
    pub fn commit(start: Address, size: usize) -> Result<(), MemoryMapError> {
        debug_assert!((size & (PAGE_SIZE - 1)) == 0);
        let r = unsafe {
            libc::mprotect(start.as_mut_ptr(), size, libc::PROT_READ | libc::PROT_WRITE)
        };
        if r == 0 {
            Ok(())
        } else {
            Err(MemoryMapError)
        }
    }

    /// Tell the kernel the pages may be reclaimed, keeping the mapping.
    pub fn discard(start: Address, size: usize) {
        debug_assert!((size & (PAGE_SIZE - 1)) == 0);
        unsafe {
            libc::madvise(start.as_mut_ptr(), size, libc::MADV_FREE);
        }
    }

    #[cfg(feature = "transparent_huge_page")]
    pub fn advise_huge_page(start: Address, size: usize) {
        unsafe {
            libc::madvise(start.as_mut_ptr(), size, libc::MADV_HUGEPAGE);
        }
    }

    #[cfg(not(feature = "transparent_huge_page"))]
    pub fn advise_huge_page(_start: Address, _size: usize) {}

    pub fn unmap(start: Address, size: usize) {
        debug_assert!((size & (PAGE_SIZE - 1)) == 0, "mmap size is not page aligned");
        unsafe {
            libc::munmap(start.as_mut_ptr(), size);
        }
    }
}
