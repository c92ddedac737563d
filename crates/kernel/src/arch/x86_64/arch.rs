//! x86_64 boot hooks and privileged-mode transitions.

use core::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_os = "none")]
const IA32_FS_BASE: u32 = 0xC000_0100;

/// Sequential CPU numbering claimed as each CPU arrives in `early_init`.
static CPU_WOKEN_UP: AtomicU32 = AtomicU32::new(0);

/// First boot phase for each CPU: claim a CPU number, wire the per-CPU
/// block, enable FSGSBASE where present, and turn the caches on.
pub fn early_init() {
    let cpu_id = CPU_WOKEN_UP.fetch_add(1, Ordering::Relaxed);

    #[cfg(target_os = "none")]
    unsafe {
        super::percpu::init(cpu_id);

        use x86_64::registers::control::{Cr0, Cr0Flags, Cr4, Cr4Flags};
        if raw_cpuid::CpuId::new()
            .get_extended_feature_info()
            .map(|f| f.has_fsgsbase())
            .unwrap_or(false)
        {
            Cr4::update(|cr4| cr4.insert(Cr4Flags::FSGSBASE));
        }

        Cr0::update(|cr0| {
            cr0.remove(Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE)
        });
    }
    #[cfg(not(target_os = "none"))]
    let _ = cpu_id;
}

pub fn init() {
    crate::info!("arch: x86_64 core online");
}

pub fn quiesce() {}

/// Chain loading is not supported on this architecture.
pub fn chain_load(_entry: usize, _a0: usize, _a1: usize, _a2: usize, _a3: usize) -> ! {
    panic!("not implemented: chain load");
}

/// Drop to unprivileged execution. Not wired up; see the aarch64 notes.
pub fn enter_uspace(
    _entry: u64,
    _ustack_top: u64,
    shadow_stack_base: u64,
    _flags: u32,
    _arg0: u64,
) -> ! {
    debug_assert_eq!(shadow_stack_base, 0);

    unimplemented!("user mode entry");
}

/// Update the calling thread's TLS base and the live FS base.
#[cfg(target_arch = "x86_64")]
pub fn set_user_tls(tls_ptr: u64) {
    #[cfg(target_os = "none")]
    {
        let thread = crate::arch::get_current_thread();
        if !thread.is_null() {
            unsafe { (*thread).arch.fs_base = tls_ptr };
        }
        unsafe { super::percpu::wrmsr(IA32_FS_BASE, tls_ptr) };
    }
    #[cfg(not(target_os = "none"))]
    let _ = tls_ptr;
}
