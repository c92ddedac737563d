//! TLB maintenance.
//!
//! All invalidations broadcast across the inner-shareable domain unless
//! noted. On hosted builds the operations are recorded (for the unit tests)
//! instead of executed.

#[cfg(test)]
pub mod stats {
    use core::sync::atomic::{AtomicUsize, Ordering};

    pub static VA_ASID: AtomicUsize = AtomicUsize::new(0);
    pub static VA_GLOBAL: AtomicUsize = AtomicUsize::new(0);
    pub static ALL: AtomicUsize = AtomicUsize::new(0);
    pub static ASID: AtomicUsize = AtomicUsize::new(0);

    pub fn reset() {
        VA_ASID.store(0, Ordering::Relaxed);
        VA_GLOBAL.store(0, Ordering::Relaxed);
        ALL.store(0, Ordering::Relaxed);
        ASID.store(0, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// TLBI VA operand: VA[55:12] in bits [43:0].
#[cfg_attr(
    not(all(target_arch = "aarch64", target_os = "none")),
    allow(dead_code)
)]
const TLBI_VADDR_MASK: u64 = (1u64 << 44) - 1;

/// Invalidate one page for a specific ASID, inner shareable.
#[inline]
pub fn flush_vaddr_asid(vaddr: u64, asid: u16) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        let op = ((vaddr >> 12) & TLBI_VADDR_MASK) | ((asid as u64) << 48);
        core::arch::asm!("tlbi vae1is, {}", in(reg) op, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = (vaddr, asid);
    #[cfg(test)]
    stats::bump(&stats::VA_ASID);
}

/// Invalidate one page for all ASIDs, inner shareable. Used for global
/// (kernel) translations.
#[inline]
pub fn flush_vaddr_global(vaddr: u64) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        let op = (vaddr >> 12) & TLBI_VADDR_MASK;
        core::arch::asm!("tlbi vaae1is, {}", in(reg) op, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = vaddr;
    #[cfg(test)]
    stats::bump(&stats::VA_GLOBAL);
}

/// Invalidate every entry for one ASID, inner shareable.
#[inline]
pub fn flush_asid(asid: u16) {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        let op = (asid as u64) << 48;
        core::arch::asm!("tlbi aside1is, {}", in(reg) op, options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = asid;
    #[cfg(test)]
    stats::bump(&stats::ASID);
}

/// Invalidate the whole TLB, inner shareable.
#[inline]
pub fn flush_all_is() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("tlbi vmalle1is", options(nostack, preserves_flags));
    }
    #[cfg(test)]
    stats::bump(&stats::ALL);
}

/// Invalidate the whole TLB on this CPU only.
#[inline]
pub fn flush_all_local() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("tlbi vmalle1", options(nostack, preserves_flags));
    }
    #[cfg(test)]
    stats::bump(&stats::ALL);
}
