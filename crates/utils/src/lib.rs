#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

mod registry;

pub use registry::Registry;

// Spin locks are the lock API for task-context state shared across crates.
pub use spin::{Mutex, MutexGuard};

/// Fixed-capacity FIFO used for byte streams fed from interrupt-driven loops.
///
/// `push` refuses new items when full; `force_push` evicts the oldest item
/// instead so a producer that must never block keeps the most recent data.
pub struct RingBuffer<T: Copy, const N: usize> {
    buffer: [T; N],
    head: usize,
    tail: usize,
    full: bool,
    evicted: u64,
}

impl<T: Copy + Default, const N: usize> Default for RingBuffer<T, N> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Copy, const N: usize> RingBuffer<T, N> {
    #[must_use]
    pub const fn new(default_val: T) -> Self {
        Self {
            buffer: [default_val; N],
            head: 0,
            tail: 0,
            full: false,
            evicted: 0,
        }
    }

    /// Append an item. Returns false (and drops `item`) when full.
    pub fn push(&mut self, item: T) -> bool {
        if self.full {
            return false;
        }

        self.buffer[self.head] = item;
        self.head = (self.head + 1) % N;
        self.full = self.head == self.tail;
        true
    }

    /// Append an item, evicting the oldest one when full.
    ///
    /// Returns true if an item was evicted.
    pub fn force_push(&mut self, item: T) -> bool {
        let evict = self.full;
        if evict {
            self.tail = (self.tail + 1) % N;
            self.full = false;
            self.evicted += 1;
        }
        self.push(item);
        evict
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let item = self.buffer[self.tail];
        self.tail = (self.tail + 1) % N;
        self.full = false;
        Some(item)
    }

    /// Pop up to `out.len()` items into `out`, oldest first.
    pub fn pop_into(&mut self, out: &mut [T]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.pop() {
                Some(item) => {
                    out[n] = item;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    pub fn len(&self) -> usize {
        if self.full {
            N
        } else {
            (self.head + N - self.tail) % N
        }
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of items lost to `force_push` since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }
}
