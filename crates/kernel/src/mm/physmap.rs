//! Kernel physical map: fixed-offset translation between physical frames
//! and kernel virtual addresses.
//!
//! The kernel maps all of RAM at a constant offset, so a physical address is
//! always convertible to a dereferenceable kernel pointer without a table
//! walk. Hosted builds (unit tests) run with an identity offset, where
//! "physical" addresses are simply host pointers.

use super::PhysAddr;

/// Base of the kernel's linear map of physical memory.
#[cfg(target_os = "none")]
pub const PHYSMAP_BASE: u64 = 0xffff_0000_0000_0000;

#[cfg(not(target_os = "none"))]
pub const PHYSMAP_BASE: u64 = 0;

#[inline]
pub fn paddr_to_kvaddr(paddr: PhysAddr) -> *mut u8 {
    (PHYSMAP_BASE + paddr) as *mut u8
}

#[inline]
pub fn vaddr_to_paddr(vaddr: *const u8) -> PhysAddr {
    (vaddr as u64).wrapping_sub(PHYSMAP_BASE)
}
