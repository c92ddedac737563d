//! x86_64 architectural primitives.

#![cfg_attr(not(target_os = "none"), allow(dead_code))]

use core::sync::atomic::{compiler_fence, Ordering};

const RFLAGS_IF: u64 = 1 << 9;

#[cfg(target_os = "none")]
pub fn enable_ints() {
    compiler_fence(Ordering::SeqCst);
    unsafe { core::arch::asm!("sti", options(nomem, nostack)) }
}

#[cfg(target_os = "none")]
pub fn disable_ints() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack)) }
    compiler_fence(Ordering::SeqCst);
}

#[cfg(target_os = "none")]
pub fn ints_disabled() -> bool {
    let rflags: u64;
    unsafe {
        core::arch::asm!("pushfq; pop {}", out(reg) rflags, options(nomem, preserves_flags));
    }
    rflags & RFLAGS_IF == 0
}

pub fn mb() {
    unsafe { core::arch::asm!("mfence", options(nomem, nostack, preserves_flags)) }
}

pub fn rmb() {
    unsafe { core::arch::asm!("lfence", options(nomem, nostack, preserves_flags)) }
}

pub fn wmb() {
    unsafe { core::arch::asm!("sfence", options(nomem, nostack, preserves_flags)) }
}

// TSO already orders load-load and store-store between CPUs; only the
// full barrier needs an instruction.
pub fn smp_mb() {
    #[cfg(feature = "smp")]
    mb();
    #[cfg(not(feature = "smp"))]
    compiler_fence(Ordering::SeqCst);
}

pub fn smp_rmb() {
    compiler_fence(Ordering::SeqCst);
}

pub fn smp_wmb() {
    compiler_fence(Ordering::SeqCst);
}

#[cfg(target_os = "none")]
pub fn curr_cpu_num() -> u32 {
    #[cfg(feature = "smp")]
    {
        super::percpu::CpuLocal::current().cpu_id
    }
    #[cfg(not(feature = "smp"))]
    {
        0
    }
}

/// The current thread rides in the GS-addressed per-CPU block, readable
/// without a valid stack.
#[cfg(target_os = "none")]
pub fn get_current_thread() -> *mut crate::thread::Thread {
    super::percpu::CpuLocal::current().current_thread
}

#[cfg(target_os = "none")]
pub fn set_current_thread(t: *mut crate::thread::Thread) {
    super::percpu::CpuLocal::current().current_thread = t;
}

#[cfg(target_os = "none")]
pub fn cycle_count() -> u32 {
    let lo: u32;
    unsafe {
        core::arch::asm!("rdtsc", out("eax") lo, out("edx") _, options(nomem, nostack));
    }
    lo
}

#[cfg(target_os = "none")]
pub fn idle() {
    unsafe { core::arch::asm!("hlt", options(nomem, nostack)) }
}
