//! Fixed-size boot log ring.
//!
//! Everything printed through the console macros is mirrored here. The native loader
//! snapshots the ring into a kernel-visible buffer so the OS can display messages that
//! were emitted before its own console came up, and so the log survives a warm reset.

use spin::Mutex;

/// Capacity of the in-RAM boot log.
pub const BOOT_LOG_SIZE: usize = 16 * 1024;

struct LogRing {
    buf: [u8; BOOT_LOG_SIZE],
    /// Write position. Wraps; `len` saturates at the capacity.
    head: usize,
    len: usize,
}

impl LogRing {
    const fn new() -> Self {
        Self {
            buf: [0; BOOT_LOG_SIZE],
            head: 0,
            len: 0,
        }
    }

    fn append(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.buf[self.head] = b;
            self.head = (self.head + 1) % BOOT_LOG_SIZE;
            if self.len < BOOT_LOG_SIZE {
                self.len += 1;
            }
        }
    }

    /// Copies the ring content, oldest byte first, into `out`. Returns the copied length.
    fn snapshot(&self, out: &mut [u8]) -> usize {
        let count = self.len.min(out.len());
        let start = (self.head + BOOT_LOG_SIZE - self.len) % BOOT_LOG_SIZE;

        for (i, slot) in out.iter_mut().enumerate().take(count) {
            *slot = self.buf[(start + i) % BOOT_LOG_SIZE];
        }

        count
    }
}

static BOOT_LOG: Mutex<LogRing> = Mutex::new(LogRing::new());

pub(crate) fn boot_log_append(s: &str) {
    BOOT_LOG.lock().append(s.as_bytes());
}

/// Copies the current boot log, oldest byte first, into `out`.
///
/// Returns the number of bytes written.
pub fn boot_log_snapshot(out: &mut [u8]) -> usize {
    BOOT_LOG.lock().snapshot(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_keeps_most_recent_bytes() {
        let mut ring = LogRing::new();
        ring.append(b"abc");

        let mut out = [0u8; 8];
        assert_eq!(ring.snapshot(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
    }

    #[test]
    fn ring_wraps_over_capacity() {
        let mut ring = LogRing::new();
        for _ in 0..BOOT_LOG_SIZE {
            ring.append(b"x");
        }
        ring.append(b"tail");

        let mut out = alloc::vec![0u8; BOOT_LOG_SIZE];
        assert_eq!(ring.snapshot(&mut out), BOOT_LOG_SIZE);
        assert_eq!(&out[BOOT_LOG_SIZE - 4..], b"tail");
        assert_eq!(out[0], b'x');
    }
}
