//! COM1 transmit path for the console sink.

use spin::Mutex;
use uart_16550::SerialPort;

static COM1: Mutex<Option<SerialPort>> = Mutex::new(None);

/// Bring up the UART. Safe to call once during early boot.
pub fn init() {
    let mut port = unsafe { SerialPort::new(0x3F8) };
    port.init();
    *COM1.lock() = Some(port);
}

/// Blocking write of `buf` to COM1. Silently dropped before `init`.
pub fn write(buf: &[u8]) {
    if let Some(port) = COM1.lock().as_mut() {
        for &byte in buf {
            port.send(byte);
        }
    }
}
