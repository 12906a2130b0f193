//! Thread-safe byte FIFO between audio producers and consumers.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Soft capacity bound in bytes. Documented only; `push` does not drop.
pub const SOFT_MAX_BYTES: usize = 100 * 1024;

/// Ordered byte queue shared between the network receive path and the
/// playback callback.
///
/// Both operations take a single internal mutex; hold time is bounded by
/// one memcpy of the moved bytes. There is no blocking variant — under-run
/// is a normal condition and returns an empty buffer.
#[derive(Debug, Default)]
pub struct AudioQueue {
    inner: Mutex<VecDeque<u8>>,
}

impl AudioQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `data` to the tail.
    pub fn push(&self, data: &[u8]) {
        let mut q = self.inner.lock().unwrap();
        q.extend(data.iter().copied());
    }

    /// Removes and returns up to `max` bytes from the head.
    pub fn pop_front(&self, max: usize) -> Vec<u8> {
        let mut q = self.inner.lock().unwrap();
        let n = max.min(q.len());
        q.drain(..n).collect()
    }

    /// Number of bytes currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Returns true when no bytes are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
