//! Kernel heap.
//!
//! Bare-metal targets register a `linked_list_allocator` heap over a static
//! carve-out as the global allocator. Hosted builds (unit tests) use the
//! platform allocator, so the aligned-allocation helpers below work in both
//! worlds. The MMU engine uses them for page-table nodes smaller than a
//! page and for user top-level translation tables.

use core::alloc::Layout;

#[cfg(target_os = "none")]
mod global {
    use linked_list_allocator::LockedHeap;

    const HEAP_SIZE: usize = 2 * 1024 * 1024;

    #[repr(align(4096))]
    struct HeapArea([u8; HEAP_SIZE]);

    static mut HEAP_AREA: HeapArea = HeapArea([0; HEAP_SIZE]);

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    /// Bring the heap online. Must run once, before the first allocation.
    pub unsafe fn init() {
        let base = core::ptr::addr_of_mut!(HEAP_AREA) as *mut u8;
        ALLOCATOR.lock().init(base, HEAP_SIZE);
    }
}

#[cfg(target_os = "none")]
pub unsafe fn init() {
    global::init();
}

/// Allocate `size` bytes aligned to `align`. Returns null on exhaustion or
/// nonsensical arguments.
pub fn memalign(align: usize, size: usize) -> *mut u8 {
    match Layout::from_size_align(size, align) {
        Ok(layout) => unsafe { alloc::alloc::alloc_zeroed(layout) },
        Err(_) => core::ptr::null_mut(),
    }
}

/// Release memory from [`memalign`]. `align` and `size` must match the
/// original request.
pub unsafe fn free_aligned(ptr: *mut u8, align: usize, size: usize) {
    if let Ok(layout) = Layout::from_size_align(size, align) {
        alloc::alloc::dealloc(ptr, layout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memalign_honors_alignment() {
        let p = memalign(4096, 4096);
        assert!(!p.is_null());
        assert_eq!(p as usize % 4096, 0);
        unsafe { free_aligned(p, 4096, 4096) };
    }

    #[test]
    fn bad_layout_returns_null() {
        assert!(memalign(3, 64).is_null());
    }
}
