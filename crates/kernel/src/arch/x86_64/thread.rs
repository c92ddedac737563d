//! Per-thread CPU state and the context switch for x86_64.

use crate::mm::VirtAddr;

/// Callee-saved registers as the switch routine pushes them, return
/// address on top.
#[repr(C)]
pub struct ContextSwitchFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rip: u64,
}

/// Architecture-specific per-thread state.
#[derive(Debug, Default)]
pub struct ArchThread {
    /// Saved stack pointer while descheduled.
    pub sp: VirtAddr,
    /// User TLS base, mirrored into IA32_FS_BASE.
    pub fs_base: VirtAddr,
}

#[inline]
fn round_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

/// Build the initial frame at the top of a zeroed stack and return the
/// thread's starting `sp`.
pub fn init_frame(stack_base: *mut u8, stack_size: usize, return_to: u64) -> VirtAddr {
    // after the frame pops and the `ret`, rsp must be 8 mod 16 per the
    // SysV call convention
    let stack_top = round_down(stack_base as u64 + stack_size as u64, 16) - 8;
    let frame =
        (stack_top - core::mem::size_of::<ContextSwitchFrame>() as u64) as *mut ContextSwitchFrame;

    unsafe {
        core::ptr::write_bytes(frame as *mut u8, 0, core::mem::size_of::<ContextSwitchFrame>());
        (*frame).rip = return_to;
    }

    frame as VirtAddr
}

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn x86_64_context_switch(old_sp: *mut VirtAddr, new_sp: VirtAddr);
}

#[cfg(target_arch = "x86_64")]
core::arch::global_asm!(
    r#"
    .text
    .global x86_64_context_switch
x86_64_context_switch:
    /* rdi = &old->arch.sp, rsi = new sp */
    push    rbp
    push    rbx
    push    r12
    push    r13
    push    r14
    push    r15
    mov     [rdi], rsp

    mov     rsp, rsi
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     rbx
    pop     rbp
    ret
    "#
);

/// Set up a fresh thread to enter the first-run trampoline on its first
/// switch. Cannot fail; no allocation happens here.
#[cfg(target_arch = "x86_64")]
pub fn arch_thread_initialize(t: &mut crate::thread::Thread) {
    t.arch = ArchThread::default();
    t.arch.sp = init_frame(
        t.stack.base,
        t.stack.size,
        crate::thread::initial_thread_func as u64,
    );
}

/// Transfer this CPU from `old` to `new`. Entered with interrupts
/// disabled, the scheduler lock held, and current already set to `new`.
#[cfg(target_arch = "x86_64")]
pub fn arch_context_switch(old: &mut crate::thread::Thread, new: &mut crate::thread::Thread) {
    unsafe {
        x86_64_context_switch(&mut old.arch.sp, new.arch.sp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_frame_layout() {
        let mut stack = alloc::vec![0u8; 8 * 1024];
        let sp = init_frame(stack.as_mut_ptr(), stack.len(), 0xfeed_f00d);

        // after six pops and the ret, the entry sees rsp 8 mod 16
        assert_eq!((sp + 7 * 8) % 16, 8);

        let frame = unsafe { &*(sp as *const ContextSwitchFrame) };
        assert_eq!(frame.rip, 0xfeed_f00d);
        assert_eq!(frame.rbx, 0);
        assert_eq!(frame.rbp, 0);
        assert_eq!(frame.r12, 0);

        let top = stack.as_ptr() as u64 + stack.len() as u64;
        assert!(sp >= stack.as_ptr() as u64);
        assert!(sp + core::mem::size_of::<ContextSwitchFrame>() as u64 <= top);
    }
}
