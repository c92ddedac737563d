//! Physical frame allocator.
//!
//! Hands out naturally aligned, physically contiguous runs of 4 KiB frames
//! from a single managed region. The MMU engine draws its page-table frames
//! from here; callers of `map` own the frames they map. A bitmap over the
//! region keeps the allocator simple and makes the live-frame count exact,
//! which the leak tests rely on.

use super::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};
use crate::lib::error::KernelError;
use spin::Mutex;

/// Largest managed region: 32768 frames = 128 MiB.
const MAX_FRAMES: usize = 32768;

struct FrameRegion {
    base: PhysAddr,
    frame_count: usize,
    bitmap: [u64; MAX_FRAMES / 64],
    in_use: usize,
}

impl FrameRegion {
    const fn new() -> Self {
        Self {
            base: 0,
            frame_count: 0,
            bitmap: [0; MAX_FRAMES / 64],
            in_use: 0,
        }
    }

    fn is_set(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    fn set(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1 << (frame % 64);
    }

    fn clear(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }

    fn alloc_run(&mut self, count: usize, align_shift: u32) -> Option<usize> {
        if count == 0 || count > self.frame_count {
            return None;
        }
        let align_mask = (1u64 << align_shift) - 1;
        let mut start = 0;
        while start + count <= self.frame_count {
            // alignment is a property of the absolute physical address
            if (self.base + (start * PAGE_SIZE) as u64) & align_mask != 0 {
                start += 1;
                continue;
            }
            match (start..start + count).find(|&f| self.is_set(f)) {
                Some(busy) => start = busy + 1,
                None => {
                    for f in start..start + count {
                        self.set(f);
                    }
                    self.in_use += count;
                    return Some(start);
                }
            }
        }
        None
    }
}

static REGION: Mutex<FrameRegion> = Mutex::new(FrameRegion::new());

#[cfg(test)]
static FAIL_AFTER: core::sync::atomic::AtomicIsize = core::sync::atomic::AtomicIsize::new(-1);

/// Hand a physical region to the allocator. `base` and `size` must be page
/// aligned; frames beyond [`MAX_FRAMES`] are ignored.
pub fn init(base: PhysAddr, size: usize) {
    debug_assert!(super::is_page_aligned(base));
    debug_assert!(super::is_page_aligned(size as u64));

    let mut region = REGION.lock();
    region.base = base;
    region.frame_count = core::cmp::min(size / PAGE_SIZE, MAX_FRAMES);
    region.bitmap = [0; MAX_FRAMES / 64];
    region.in_use = 0;
}

/// Allocate `count` physically contiguous frames whose base is aligned to
/// `1 << align_shift` bytes.
pub fn alloc_contiguous(count: usize, align_shift: u32) -> Result<PhysAddr, KernelError> {
    debug_assert!(align_shift >= PAGE_SHIFT);

    #[cfg(test)]
    {
        use core::sync::atomic::Ordering;
        if FAIL_AFTER.load(Ordering::Relaxed) >= 0
            && FAIL_AFTER.fetch_sub(1, Ordering::Relaxed) == 0
        {
            return Err(KernelError::NoMemory);
        }
    }

    let mut region = REGION.lock();
    let start = region
        .alloc_run(count, align_shift)
        .ok_or(KernelError::NoMemory)?;
    Ok(region.base + (start * PAGE_SIZE) as u64)
}

pub fn free_pages(paddr: PhysAddr, count: usize) {
    let mut region = REGION.lock();
    debug_assert!(paddr >= region.base);
    let start = ((paddr - region.base) as usize) / PAGE_SIZE;
    debug_assert!(start + count <= region.frame_count);
    for f in start..start + count {
        debug_assert!(region.is_set(f), "double free of frame {}", f);
        region.clear(f);
    }
    region.in_use -= count;
}

pub fn free_page(paddr: PhysAddr) {
    free_pages(paddr, 1);
}

/// Number of frames currently allocated.
pub fn pages_in_use() -> usize {
    REGION.lock().in_use
}

#[cfg(test)]
pub mod test_support {
    //! Host-side harness: backs the "physical" region with leaked heap
    //! memory so page-table frames are real, dereferenceable storage.

    use super::*;
    use core::sync::atomic::Ordering;

    /// Serializes tests that reconfigure the global region.
    pub static PMM_TEST_LOCK: Mutex<()> = Mutex::new(());

    pub fn reset(frames: usize) {
        let bytes = frames * PAGE_SIZE;
        let layout = core::alloc::Layout::from_size_align(bytes, PAGE_SIZE).unwrap();
        let arena = unsafe { alloc::alloc::alloc_zeroed(layout) };
        assert!(!arena.is_null());
        FAIL_AFTER.store(-1, Ordering::Relaxed);
        init(arena as u64, bytes);
    }

    /// Make the n-th upcoming allocation fail (0 = the very next one).
    pub fn fail_after(n: isize) {
        FAIL_AFTER.store(n, Ordering::Relaxed);
    }

    pub fn clear_failure() {
        FAIL_AFTER.store(-1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_runs_are_aligned() {
        let _guard = test_support::PMM_TEST_LOCK.lock();
        test_support::reset(64);
        let a = alloc_contiguous(1, PAGE_SHIFT).unwrap();
        let b = alloc_contiguous(4, PAGE_SHIFT + 2).unwrap();
        assert_eq!(a % PAGE_SIZE as u64, 0);
        assert_eq!(b % (4 * PAGE_SIZE) as u64, 0);
        assert_eq!(pages_in_use(), 5);
        free_page(a);
        free_pages(b, 4);
        assert_eq!(pages_in_use(), 0);
    }

    #[test]
    fn exhaustion_reports_no_memory() {
        let _guard = test_support::PMM_TEST_LOCK.lock();
        test_support::reset(4);
        let run = alloc_contiguous(4, PAGE_SHIFT).unwrap();
        assert_eq!(alloc_contiguous(1, PAGE_SHIFT), Err(KernelError::NoMemory));
        free_pages(run, 4);
    }

    #[test]
    fn injected_failure_fires_on_requested_allocation() {
        let _guard = test_support::PMM_TEST_LOCK.lock();
        test_support::reset(16);
        test_support::fail_after(1);
        let first = alloc_contiguous(1, PAGE_SHIFT).unwrap();
        assert_eq!(alloc_contiguous(1, PAGE_SHIFT), Err(KernelError::NoMemory));
        // injection is one-shot
        let third = alloc_contiguous(1, PAGE_SHIFT).unwrap();
        free_page(first);
        free_page(third);
        test_support::clear_failure();
    }
}
