//! Scheduler lock.
//!
//! One explicit acquire/release spinlock whose ownership transfers across
//! the context switch: the outgoing thread takes it, the incoming thread
//! releases it (via the first-run trampoline for fresh threads). A regular
//! guard-based mutex cannot express that handoff, so lock and unlock are
//! separate operations and interrupts must already be masked around them.

use core::sync::atomic::{AtomicBool, Ordering};

pub struct SchedLock {
    locked: AtomicBool,
}

impl SchedLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Acquire with interrupts already disabled by the caller.
    pub fn lock_ints_disabled(&self) {
        debug_assert!(crate::arch::ints_disabled());
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            core::hint::spin_loop();
        }
    }

    /// Release with interrupts still disabled. The releasing CPU need not
    /// be the one that acquired the lock.
    pub fn unlock_ints_disabled(&self) {
        debug_assert!(crate::arch::ints_disabled());
        debug_assert!(self.locked.load(Ordering::Relaxed));
        self.locked.store(false, Ordering::Release);
    }

    /// Convenience pair for short critical sections: mask interrupts,
    /// acquire, and return the prior mask state for `unlock_irqrestore`.
    pub fn lock_irqsave(&self) -> bool {
        let was_disabled = crate::arch::ints_disabled();
        crate::arch::disable_ints();
        self.lock_ints_disabled();
        was_disabled
    }

    pub fn unlock_irqrestore(&self, was_disabled: bool) {
        self.unlock_ints_disabled();
        if !was_disabled {
            crate::arch::enable_ints();
        }
    }

    #[cfg(test)]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

/// The global scheduler lock, held across every context switch.
pub static THREAD_LOCK: SchedLock = SchedLock::new();
