//! AArch64 architectural primitives: interrupt mask, memory barriers,
//! per-CPU state, cycle counter.
//!
//! Interrupt masking toggles the DAIF bits. With the `merge-irq-fiq`
//! feature IRQ and FIQ are masked and unmasked as one class; otherwise they
//! are independent and both report separately. Masking pairs with a
//! compiler fence on the side facing the critical section: `disable_ints`
//! fences after masking, `enable_ints` fences before unmasking.

#![cfg_attr(
    not(all(target_arch = "aarch64", target_os = "none")),
    allow(dead_code, unused_imports)
)]

use core::sync::atomic::{compiler_fence, Ordering};

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
mod daif {
    /// DAIF bit positions as read from the `daif` register.
    pub const DAIF_I: u64 = 1 << 7;
    pub const DAIF_F: u64 = 1 << 6;

    #[inline(always)]
    pub fn read() -> u64 {
        let state: u64;
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) state, options(nomem, nostack));
        }
        state
    }

    #[cfg(feature = "merge-irq-fiq")]
    #[inline(always)]
    pub fn check_irq_fiq_state(state: u64) {
        // the two masks must never diverge when driven as one class
        debug_assert_eq!((state >> 6) & 1, (state >> 7) & 1);
    }

    #[cfg(not(feature = "merge-irq-fiq"))]
    #[inline(always)]
    pub fn check_irq_fiq_state(_state: u64) {}
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn enable_ints() {
    compiler_fence(Ordering::SeqCst);
    unsafe {
        #[cfg(feature = "merge-irq-fiq")]
        core::arch::asm!("msr daifclr, #3", options(nomem, nostack));
        #[cfg(not(feature = "merge-irq-fiq"))]
        core::arch::asm!("msr daifclr, #2", options(nomem, nostack));
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn disable_ints() {
    unsafe {
        #[cfg(feature = "merge-irq-fiq")]
        core::arch::asm!("msr daifset, #3", options(nomem, nostack));
        #[cfg(not(feature = "merge-irq-fiq"))]
        core::arch::asm!("msr daifset, #2", options(nomem, nostack));
    }
    compiler_fence(Ordering::SeqCst);
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn ints_disabled() -> bool {
    let state = daif::read();
    daif::check_irq_fiq_state(state);
    state & daif::DAIF_I != 0
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn enable_fiqs() {
    compiler_fence(Ordering::SeqCst);
    unsafe {
        #[cfg(feature = "merge-irq-fiq")]
        core::arch::asm!("msr daifclr, #0", options(nomem, nostack));
        #[cfg(not(feature = "merge-irq-fiq"))]
        core::arch::asm!("msr daifclr, #1", options(nomem, nostack));
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn disable_fiqs() {
    unsafe {
        #[cfg(feature = "merge-irq-fiq")]
        core::arch::asm!("msr daifset, #0", options(nomem, nostack));
        #[cfg(not(feature = "merge-irq-fiq"))]
        core::arch::asm!("msr daifset, #1", options(nomem, nostack));
    }
    compiler_fence(Ordering::SeqCst);
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn fiqs_disabled() -> bool {
    let state = daif::read();
    daif::check_irq_fiq_state(state);
    state & daif::DAIF_F != 0
}

/// Full-system barriers.
#[cfg(target_arch = "aarch64")]
pub fn mb() {
    unsafe { core::arch::asm!("dsb sy", options(nostack, preserves_flags)) }
}

#[cfg(target_arch = "aarch64")]
pub fn rmb() {
    unsafe { core::arch::asm!("dsb ld", options(nostack, preserves_flags)) }
}

#[cfg(target_arch = "aarch64")]
pub fn wmb() {
    unsafe { core::arch::asm!("dsb st", options(nostack, preserves_flags)) }
}

/// Inter-CPU ordering barriers; compiler-only on UP builds.
#[cfg(target_arch = "aarch64")]
pub fn smp_mb() {
    #[cfg(feature = "smp")]
    unsafe {
        core::arch::asm!("dmb ish", options(nostack, preserves_flags))
    }
    #[cfg(not(feature = "smp"))]
    compiler_fence(Ordering::SeqCst);
}

#[cfg(target_arch = "aarch64")]
pub fn smp_rmb() {
    #[cfg(feature = "smp")]
    unsafe {
        core::arch::asm!("dmb ishld", options(nostack, preserves_flags))
    }
    #[cfg(not(feature = "smp"))]
    compiler_fence(Ordering::SeqCst);
}

#[cfg(target_arch = "aarch64")]
pub fn smp_wmb() {
    #[cfg(feature = "smp")]
    unsafe {
        core::arch::asm!("dmb ishst", options(nostack, preserves_flags))
    }
    #[cfg(not(feature = "smp"))]
    compiler_fence(Ordering::SeqCst);
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn curr_cpu_num() -> u32 {
    #[cfg(feature = "smp")]
    {
        let mpidr: u64;
        unsafe {
            core::arch::asm!("mrs {}, mpidr_el1", out(reg) mpidr, options(nomem, nostack));
        }
        (mpidr & 0xff) as u32
    }
    #[cfg(not(feature = "smp"))]
    {
        0
    }
}

/// The current thread lives in TPIDR_EL1, so it is readable without a
/// memory dereference even before the stack is valid.
#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn get_current_thread() -> *mut crate::thread::Thread {
    let ptr: u64;
    unsafe {
        core::arch::asm!("mrs {}, tpidr_el1", out(reg) ptr, options(nomem, nostack));
    }
    ptr as *mut crate::thread::Thread
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn set_current_thread(t: *mut crate::thread::Thread) {
    unsafe {
        core::arch::asm!("msr tpidr_el1, {}", in(reg) t as u64, options(nomem, nostack));
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn cycle_count() -> u32 {
    let count: u64;
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) count, options(nomem, nostack));
    }
    count as u32
}

#[cfg(all(target_arch = "aarch64", target_os = "none"))]
pub fn idle() {
    unsafe { core::arch::asm!("wfi", options(nomem, nostack)) }
}
