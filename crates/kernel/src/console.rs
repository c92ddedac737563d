//! Kernel console: the one consumer of the I/O handle dispatch layer.
//!
//! printk writes land here and are forwarded through an [`IoHandle`] to the
//! platform serial sink. Hosted builds capture output in a buffer instead
//! so tests can assert on it.

use crate::lib::io::{IoHandle, IoHooks};
use crate::lib::error::KernelError;
use spin::Mutex;

struct SerialSink {
    lock: Mutex<()>,
}

impl IoHooks for SerialSink {
    fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        #[cfg(all(target_os = "none", target_arch = "aarch64"))]
        crate::arch::aarch64::serial::write(buf);
        #[cfg(all(target_os = "none", target_arch = "x86_64"))]
        crate::arch::x86_64::serial::write(buf);
        #[cfg(not(target_os = "none"))]
        capture(buf);
        Ok(buf.len())
    }

    fn lock(&self) {
        core::mem::forget(self.lock.lock());
    }

    fn unlock(&self) {
        // paired with the forgotten guard in lock()
        unsafe { self.lock.force_unlock() };
    }
}

static SERIAL_SINK: SerialSink = SerialSink {
    lock: Mutex::new(()),
};

static CONSOLE: IoHandle = IoHandle::new(&SERIAL_SINK);

pub fn handle() -> &'static IoHandle {
    &CONSOLE
}

pub fn write(buf: &[u8]) {
    let _ = CONSOLE.write(buf);
}

#[cfg(not(target_os = "none"))]
static CAPTURED: Mutex<alloc::vec::Vec<u8>> = Mutex::new(alloc::vec::Vec::new());

#[cfg(not(target_os = "none"))]
fn capture(buf: &[u8]) {
    let mut captured = CAPTURED.lock();
    captured.extend_from_slice(buf);
    // keep the capture bounded; tests only care about recent output
    let len = captured.len();
    if len > 64 * 1024 {
        captured.drain(..len - 64 * 1024);
    }
}

#[cfg(test)]
pub fn captured_output() -> alloc::vec::Vec<u8> {
    CAPTURED.lock().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_write_reaches_sink() {
        write(b"console smoke test\n");
        let out = captured_output();
        assert!(out
            .windows(b"console smoke test".len())
            .any(|w| w == b"console smoke test"));
    }
}
