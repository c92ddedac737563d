// Panic handler for bare-metal targets.

#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    // Best effort: the console sink may itself be the reason we are here.
    crate::error!("KERNEL PANIC: {}", info);

    crate::arch::disable_ints();
    loop {
        crate::arch::idle();
    }
}
