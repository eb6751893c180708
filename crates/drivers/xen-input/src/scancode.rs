//! Keyboard scancode queue and its exclusive reader.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use xf_hal::IrqSafeLock;
use xf_utils::RingBuffer;

use crate::InputError;

pub const SCANCODE_QUEUE_LEN: usize = 4096;

/// Bounded byte queue fed by the drain task. When full, the oldest byte is
/// overwritten so the producer never waits.
pub struct ScancodeQueue {
    buf: IrqSafeLock<RingBuffer<u8, SCANCODE_QUEUE_LEN>>,
    open: AtomicBool,
}

impl ScancodeQueue {
    pub const fn new() -> Self {
        Self {
            buf: IrqSafeLock::new(RingBuffer::new(0)),
            open: AtomicBool::new(false),
        }
    }

    /// Returns true if an older byte was dropped to make room.
    pub fn push(&self, code: u8) -> bool {
        self.buf.lock().force_push(code)
    }

    pub fn len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.lock().is_empty()
    }

    /// Bytes lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.buf.lock().evicted()
    }

    /// Open the queue for reading. Only one reader may be open at a time.
    pub fn open(self: &Arc<Self>) -> Result<ScancodeReader, InputError> {
        if self
            .open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(InputError::InUse);
        }
        Ok(ScancodeReader { queue: self.clone() })
    }
}

impl Default for ScancodeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive handle on a [`ScancodeQueue`]; closing it lets another reader open.
pub struct ScancodeReader {
    queue: Arc<ScancodeQueue>,
}

impl ScancodeReader {
    /// Copy queued bytes into `out` without blocking. Returns the count.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        self.queue.buf.lock().pop_into(out)
    }
}

impl Drop for ScancodeReader {
    fn drop(&mut self) {
        self.queue.open.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_reader() {
        let q = Arc::new(ScancodeQueue::new());
        let reader = q.open().unwrap();
        assert!(matches!(q.open(), Err(InputError::InUse)));
        drop(reader);
        assert!(q.open().is_ok());
    }

    #[test]
    fn test_read_is_nonblocking() {
        let q = Arc::new(ScancodeQueue::new());
        let mut reader = q.open().unwrap();
        let mut out = [0u8; 8];
        assert_eq!(reader.read(&mut out), 0);

        for b in [0x1e, 0x9e, 0x30] {
            q.push(b);
        }
        assert_eq!(reader.read(&mut out[..2]), 2);
        assert_eq!(&out[..2], &[0x1e, 0x9e]);
        assert_eq!(reader.read(&mut out), 1);
        assert_eq!(out[0], 0x30);
        assert!(q.is_empty());
    }

    #[test]
    fn test_overflow_keeps_newest() {
        let q = Arc::new(ScancodeQueue::new());
        for i in 0..SCANCODE_QUEUE_LEN + 3 {
            q.push(i as u8);
        }
        assert_eq!(q.len(), SCANCODE_QUEUE_LEN);
        assert_eq!(q.dropped(), 3);

        let mut reader = q.open().unwrap();
        let mut first = [0u8; 1];
        reader.read(&mut first);
        assert_eq!(first[0], 3);
    }
}
