// I/O handle dispatch used by the console/logging path.

use super::error::KernelError;

/// Magic word stamped into every handle and checked on entry.
pub const IO_HANDLE_MAGIC: u32 = u32::from_be_bytes(*b"IOHN");

/// Hook set behind an I/O handle.
///
/// Every operation has a provided default so a sink only implements what it
/// supports: a missing `write`/`read` reports `NotSupported`, the rest are
/// no-ops.
pub trait IoHooks: Send + Sync {
    fn write(&self, _buf: &[u8]) -> Result<usize, KernelError> {
        Err(KernelError::NotSupported)
    }

    /// Flush any output buffered by a prior `write`.
    fn write_commit(&self) {}

    fn read(&self, _buf: &mut [u8]) -> Result<usize, KernelError> {
        Err(KernelError::NotSupported)
    }

    /// Take the sink's exclusion for a multi-call sequence.
    fn lock(&self) {}

    fn unlock(&self) {}
}

/// A checked, dispatching handle to an [`IoHooks`] implementation.
pub struct IoHandle {
    magic: u32,
    hooks: &'static dyn IoHooks,
}

impl IoHandle {
    pub const fn new(hooks: &'static dyn IoHooks) -> Self {
        Self {
            magic: IO_HANDLE_MAGIC,
            hooks,
        }
    }

    #[inline]
    fn check(&self) {
        debug_assert_eq!(self.magic, IO_HANDLE_MAGIC, "corrupt io handle");
    }

    pub fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
        self.check();
        self.hooks.write(buf)
    }

    pub fn write_commit(&self) {
        self.check();
        self.hooks.write_commit();
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, KernelError> {
        self.check();
        self.hooks.read(buf)
    }

    pub fn lock(&self) {
        self.check();
        self.hooks.lock();
    }

    pub fn unlock(&self) {
        self.check();
        self.hooks.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;
    impl IoHooks for NullSink {}

    struct CountingSink {
        written: core::sync::atomic::AtomicUsize,
    }

    impl IoHooks for CountingSink {
        fn write(&self, buf: &[u8]) -> Result<usize, KernelError> {
            self.written
                .fetch_add(buf.len(), core::sync::atomic::Ordering::Relaxed);
            Ok(buf.len())
        }
    }

    #[test]
    fn absent_hooks_report_not_supported() {
        static SINK: NullSink = NullSink;
        let io = IoHandle::new(&SINK);
        assert_eq!(io.write(b"x"), Err(KernelError::NotSupported));
        assert_eq!(io.read(&mut [0u8; 4]), Err(KernelError::NotSupported));
        // no-op hooks must not panic
        io.lock();
        io.write_commit();
        io.unlock();
    }

    #[test]
    fn write_dispatches_to_sink() {
        static SINK: CountingSink = CountingSink {
            written: core::sync::atomic::AtomicUsize::new(0),
        };
        let io = IoHandle::new(&SINK);
        assert_eq!(io.write(b"hello"), Ok(5));
        assert_eq!(
            SINK.written.load(core::sync::atomic::Ordering::Relaxed),
            5
        );
    }
}
