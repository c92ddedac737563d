//! Architecture layer: per-arch implementations plus the arch-neutral
//! surface the rest of the kernel consumes.
//!
//! Privileged operations (interrupt mask, per-CPU registers) dispatch to
//! the target architecture on bare-metal builds; hosted builds get
//! simulated equivalents so the engine code and its tests run anywhere.

use bitflags::bitflags;
use core::sync::atomic::{AtomicU32, Ordering};

pub mod aarch64;
#[cfg(target_arch = "x86_64")]
pub mod x86_64;

bitflags! {
    /// Abstract mapping flags accepted by the MMU surface. The cache mode
    /// is a three-way choice: no cache bit set means fully cached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MmuFlags: u32 {
        const UNCACHED = 1 << 0;
        const UNCACHED_DEVICE = 1 << 1;
        const PERM_USER = 1 << 2;
        const PERM_RO = 1 << 3;
        const PERM_NO_EXECUTE = 1 << 4;
        const NS = 1 << 5;
    }
}

impl MmuFlags {
    pub const CACHED: MmuFlags = MmuFlags::empty();
    pub const CACHE_MASK: MmuFlags = MmuFlags::UNCACHED.union(MmuFlags::UNCACHED_DEVICE);
}

bitflags! {
    /// Address-space creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AspaceFlags: u32 {
        const KERNEL = 1 << 0;
    }
}

/// `enter_uspace` flag selecting 32-bit execution state where the
/// architecture supports both widths.
pub const ENTER_USPACE_FLAG_32BIT: u32 = 1 << 0;

// Relaxed read-modify-write primitives on a 32-bit word. Every operation
// returns the prior value; cmpxchg callers detect success by comparing the
// result against the expected value.

pub fn atomic_add(v: &AtomicU32, val: u32) -> u32 {
    v.fetch_add(val, Ordering::Relaxed)
}

pub fn atomic_or(v: &AtomicU32, val: u32) -> u32 {
    v.fetch_or(val, Ordering::Relaxed)
}

pub fn atomic_and(v: &AtomicU32, val: u32) -> u32 {
    v.fetch_and(val, Ordering::Relaxed)
}

pub fn atomic_swap(v: &AtomicU32, val: u32) -> u32 {
    v.swap(val, Ordering::Relaxed)
}

pub fn atomic_cmpxchg(v: &AtomicU32, oldval: u32, newval: u32) -> u32 {
    match v.compare_exchange(oldval, newval, Ordering::Relaxed, Ordering::Relaxed) {
        Ok(prior) => prior,
        Err(prior) => prior,
    }
}

// Memory barriers come from the target architecture.
#[cfg(target_arch = "aarch64")]
pub use aarch64::ops::{mb, rmb, smp_mb, smp_rmb, smp_wmb, wmb};
#[cfg(target_arch = "x86_64")]
pub use x86_64::ops::{mb, rmb, smp_mb, smp_rmb, smp_wmb, wmb};

// Privileged primitives: real on bare metal, simulated on hosted builds.
#[cfg(all(target_os = "none", target_arch = "aarch64"))]
pub use aarch64::ops::{
    curr_cpu_num, cycle_count, disable_fiqs, disable_ints, enable_fiqs, enable_ints,
    fiqs_disabled, get_current_thread, idle, ints_disabled, set_current_thread,
};
#[cfg(all(target_os = "none", target_arch = "x86_64"))]
pub use x86_64::ops::{
    curr_cpu_num, cycle_count, disable_ints, enable_ints, get_current_thread, idle,
    ints_disabled, set_current_thread,
};
#[cfg(not(target_os = "none"))]
pub use hosted::{
    curr_cpu_num, cycle_count, disable_ints, enable_ints, get_current_thread, idle,
    ints_disabled, set_current_thread,
};

// Boot hooks and privileged-mode transitions.
#[cfg(target_arch = "aarch64")]
pub use aarch64::arch::{chain_load, early_init, enter_uspace, init, quiesce, set_user_tls};
#[cfg(target_arch = "x86_64")]
pub use x86_64::arch::{chain_load, early_init, enter_uspace, init, quiesce, set_user_tls};

// Thread context management.
#[cfg(target_arch = "aarch64")]
pub use aarch64::thread::{arch_context_switch, arch_thread_initialize, ArchThread};
#[cfg(target_arch = "x86_64")]
pub use x86_64::thread::{arch_context_switch, arch_thread_initialize, ArchThread};

#[cfg(not(target_os = "none"))]
mod hosted {
    //! Simulated privileged state for hosted builds. Unit tests exercise
    //! code that asserts on the interrupt mask and reads the current
    //! thread; each test thread gets its own simulated CPU.

    use crate::thread::Thread;

    #[cfg(test)]
    mod state {
        use core::cell::Cell;

        std::thread_local! {
            pub static INTS_DISABLED: Cell<bool> = Cell::new(false);
            pub static CURRENT_THREAD: Cell<*mut super::Thread> =
                Cell::new(core::ptr::null_mut());
        }
    }

    #[cfg(not(test))]
    mod state {
        use core::sync::atomic::{AtomicBool, AtomicUsize};

        pub static INTS_DISABLED: AtomicBool = AtomicBool::new(false);
        pub static CURRENT_THREAD: AtomicUsize = AtomicUsize::new(0);
    }

    #[cfg(test)]
    pub fn enable_ints() {
        state::INTS_DISABLED.with(|c| c.set(false));
    }

    #[cfg(test)]
    pub fn disable_ints() {
        state::INTS_DISABLED.with(|c| c.set(true));
    }

    #[cfg(test)]
    pub fn ints_disabled() -> bool {
        state::INTS_DISABLED.with(|c| c.get())
    }

    #[cfg(test)]
    pub fn get_current_thread() -> *mut Thread {
        state::CURRENT_THREAD.with(|c| c.get())
    }

    #[cfg(test)]
    pub fn set_current_thread(t: *mut Thread) {
        state::CURRENT_THREAD.with(|c| c.set(t));
    }

    #[cfg(not(test))]
    pub fn enable_ints() {
        state::INTS_DISABLED.store(false, core::sync::atomic::Ordering::Relaxed);
    }

    #[cfg(not(test))]
    pub fn disable_ints() {
        state::INTS_DISABLED.store(true, core::sync::atomic::Ordering::Relaxed);
    }

    #[cfg(not(test))]
    pub fn ints_disabled() -> bool {
        state::INTS_DISABLED.load(core::sync::atomic::Ordering::Relaxed)
    }

    #[cfg(not(test))]
    pub fn get_current_thread() -> *mut Thread {
        state::CURRENT_THREAD.load(core::sync::atomic::Ordering::Relaxed) as *mut Thread
    }

    #[cfg(not(test))]
    pub fn set_current_thread(t: *mut Thread) {
        state::CURRENT_THREAD.store(t as usize, core::sync::atomic::Ordering::Relaxed);
    }

    pub fn curr_cpu_num() -> u32 {
        0
    }

    pub fn cycle_count() -> u32 {
        0
    }

    pub fn idle() {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmpxchg_returns_prior_value() {
        let v = AtomicU32::new(5);
        // success: prior equals expected
        assert_eq!(atomic_cmpxchg(&v, 5, 9), 5);
        assert_eq!(v.load(Ordering::Relaxed), 9);
        // failure: prior differs from expected, no store
        assert_eq!(atomic_cmpxchg(&v, 5, 1), 9);
        assert_eq!(v.load(Ordering::Relaxed), 9);
    }

    #[test]
    fn rmw_primitives_return_prior() {
        let v = AtomicU32::new(0b0011);
        assert_eq!(atomic_add(&v, 1), 0b0011);
        assert_eq!(atomic_or(&v, 0b1000), 0b0100);
        assert_eq!(atomic_and(&v, 0b1100), 0b1100);
        assert_eq!(atomic_swap(&v, 7), 0b1100);
        assert_eq!(v.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn rmw_is_linearizable_across_threads() {
        let v = std::sync::Arc::new(AtomicU32::new(0));
        let mut handles = std::vec::Vec::new();
        for _ in 0..4 {
            let v = v.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    atomic_add(&v, 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(v.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn interrupt_mask_round_trip() {
        disable_ints();
        assert!(ints_disabled());
        enable_ints();
        assert!(!ints_disabled());
    }

    #[test]
    fn cache_mask_covers_both_cache_bits() {
        assert!(MmuFlags::CACHE_MASK.contains(MmuFlags::UNCACHED));
        assert!(MmuFlags::CACHE_MASK.contains(MmuFlags::UNCACHED_DEVICE));
        assert_eq!(MmuFlags::CACHED, MmuFlags::empty());
    }
}
