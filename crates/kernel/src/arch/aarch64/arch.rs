//! AArch64 boot hooks and privileged-mode transitions.

use super::mmu_defs::{MMU_MAIR_VAL, MMU_TCR_FLAGS_KERNEL};

/// First boot phase: program the memory-attribute indirection and the
/// kernel translation control before any mapping work happens.
pub fn early_init() {
    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!("msr mair_el1, {}", in(reg) MMU_MAIR_VAL, options(nomem, nostack));
        core::arch::asm!("msr tcr_el1, {}", in(reg) MMU_TCR_FLAGS_KERNEL, options(nomem, nostack));
        core::arch::asm!("isb", options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    let _ = (MMU_MAIR_VAL, MMU_TCR_FLAGS_KERNEL);
}

pub fn init() {
    crate::info!("arch: aarch64 core online, cpu {}", crate::arch::curr_cpu_num());
}

pub fn quiesce() {}

/// Hand this CPU to another image. Interrupts are masked and the four
/// arguments arrive in x0-x3. Does not return.
pub fn chain_load(entry: usize, arg0: usize, arg1: usize, arg2: usize, arg3: usize) -> ! {
    crate::arch::disable_ints();

    #[cfg(all(target_arch = "aarch64", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "br {entry}",
            entry = in(reg) entry,
            in("x0") arg0,
            in("x1") arg1,
            in("x2") arg2,
            in("x3") arg3,
            options(noreturn),
        );
    }
    #[cfg(not(all(target_arch = "aarch64", target_os = "none")))]
    {
        let _ = (entry, arg0, arg1, arg2, arg3);
        panic!("chain load is only possible on bare metal");
    }
}

/// Drop to unprivileged execution at `entry`.
///
/// User-mode entry is a planned surface that is not wired up yet; the
/// ERET path needs a crafted SPSR/ELR pair and a committed user aspace.
/// TODO: build the SPSR/ELR frame and eret once user address spaces land.
pub fn enter_uspace(
    _entry: u64,
    _ustack_top: u64,
    shadow_stack_base: u64,
    flags: u32,
    _arg0: u64,
) -> ! {
    debug_assert_eq!(shadow_stack_base, 0);
    debug_assert_eq!(flags & !crate::arch::ENTER_USPACE_FLAG_32BIT, 0);

    unimplemented!("user mode entry");
}

/// Update the calling thread's TLS base and the live register.
#[cfg(target_arch = "aarch64")]
pub fn set_user_tls(tls_ptr: u64) {
    let thread = crate::arch::get_current_thread();
    if !thread.is_null() {
        unsafe { (*thread).arch.tls = tls_ptr };
    }

    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("msr tpidr_el0, {}", in(reg) tls_ptr, options(nomem, nostack));
    }
}
