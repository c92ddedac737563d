// Kernel logging (printk) with a bounded ring buffer behind the console.

use super::ringbuf::RingBuffer;
use core::fmt::{self, Write};
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// One buffered log line. Messages are truncated to the fixed record size.
#[derive(Copy, Clone)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: [u8; 192],
    pub len: usize,
}

impl LogEntry {
    pub fn text(&self) -> &str {
        core::str::from_utf8(&self.message[..self.len]).unwrap_or("<non-utf8>")
    }
}

static KERNEL_LOG: Mutex<RingBuffer<LogEntry, 512>> = Mutex::new(RingBuffer::new());

struct ConsoleWriter;

impl Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        crate::console::write(s.as_bytes());
        Ok(())
    }
}

pub fn log(level: LogLevel, args: fmt::Arguments) {
    let mut message = [0u8; 192];
    let msg = alloc::format!("{}", args);
    let len = core::cmp::min(msg.len(), message.len());
    message[..len].copy_from_slice(&msg.as_bytes()[..len]);

    KERNEL_LOG.lock().push(LogEntry { level, message, len });

    let mut writer = ConsoleWriter;
    let _ = write!(writer, "[{}] {}\n", level.as_str(), msg);
}

/// Drain every buffered entry, oldest first.
pub fn drain() -> alloc::vec::Vec<LogEntry> {
    KERNEL_LOG.lock().drain_all()
}

#[macro_export]
macro_rules! printk {
    ($level:expr, $($arg:tt)*) => {
        $crate::lib::printk::log($level, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! error {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::printk!($crate::lib::printk::LogLevel::Debug, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lands_in_ring_buffer() {
        crate::info!("printk ringbuf test {}", 42);
        let entries = drain();
        let entry = entries
            .iter()
            .find(|e| e.text().contains("printk ringbuf test 42"))
            .expect("entry buffered");
        assert_eq!(entry.level, LogLevel::Info);
    }

    #[test]
    fn long_messages_truncate() {
        let long = alloc::string::String::from_utf8(alloc::vec![b'y'; 400]).unwrap();
        crate::warn!("{}", long);
        let entries = drain();
        let entry = entries
            .iter()
            .find(|e| e.text().starts_with("yyyy"))
            .expect("entry buffered");
        assert_eq!(entry.len, 192);
    }
}
