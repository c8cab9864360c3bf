//! Fixed-capacity single-producer/single-consumer lock-free queue (§4.1).

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// What `try_push` does when the buffer is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the push and increment the dropped counter.
    DropNewest,
    /// Advance the read cursor, discarding the oldest element, then push.
    OverwriteOldest,
}

struct Slot<T>(UnsafeCell<MaybeUninit<T>>);

// SAFETY: access to each slot is serialized by the head/tail protocol below:
// the producer only ever writes a slot after observing it as free, and the
// consumer only ever reads a slot after observing it as filled.
unsafe impl<T: Send> Sync for Slot<T> {}

/// A fixed-capacity ring buffer for exactly one producer thread and one
/// consumer thread. Capacity must be a power of two; it never reallocates.
pub struct RingBuffer<T> {
    buf: Box<[Slot<T>]>,
    mask: usize,
    head: AtomicUsize, // next slot the consumer will read
    tail: AtomicUsize, // next slot the producer will write
    policy: OverflowPolicy,
    dropped: AtomicUsize,
}

impl<T> RingBuffer<T> {
    /// Builds a buffer of the given capacity (rounded up to a power of two).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.next_power_of_two().max(2);
        let mut v = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            v.push(Slot(UnsafeCell::new(MaybeUninit::uninit())));
        }
        Self {
            buf: v.into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            policy,
            dropped: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Count of values dropped by `DropNewest` since construction (also
    /// incremented, as documented history, when `OverwriteOldest` discards
    /// an unread value).
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Attempts to push `value`. Never blocks, never reallocates.
    pub fn try_push(&self, value: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) == self.capacity() {
            match self.policy {
                OverflowPolicy::DropNewest => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
                OverflowPolicy::OverwriteOldest => {
                    // Discard the oldest unread value in place, then advance
                    // head so the slot we are about to write is free.
                    let idx = head & self.mask;
                    unsafe {
                        (*self.buf[idx].0.get()).assume_init_drop();
                    }
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    self.head.store(head.wrapping_add(1), Ordering::Release);
                }
            }
        }

        let idx = tail & self.mask;
        unsafe {
            (*self.buf[idx].0.get()).write(value);
        }
        // Release: the write above must be visible to the consumer before
        // it observes the new tail.
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Attempts to pop the oldest value. Returns `None` when empty.
    pub fn try_pop(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        let idx = head & self.mask;
        let value = unsafe { (*self.buf[idx].0.get()).assume_init_read() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

// SAFETY: `RingBuffer<T>` hands off ownership of `T` values between exactly
// one producer and one consumer thread via the atomic head/tail protocol.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_pop_round_trip() {
        let rb = RingBuffer::new(4, OverflowPolicy::DropNewest);
        assert_eq!(rb.capacity(), 4);
        assert!(rb.try_push(1));
        assert!(rb.try_push(2));
        assert_eq!(rb.try_pop(), Some(1));
        assert_eq!(rb.try_pop(), Some(2));
        assert_eq!(rb.try_pop(), None);
    }

    #[test]
    fn drop_newest_rejects_when_full() {
        let rb = RingBuffer::new(2, OverflowPolicy::DropNewest);
        assert!(rb.try_push(1));
        assert!(rb.try_push(2));
        assert!(rb.is_full());
        assert!(!rb.try_push(3));
        assert_eq!(rb.dropped(), 1);
        assert_eq!(rb.try_pop(), Some(1));
    }

    #[test]
    fn overwrite_oldest_advances_head() {
        let rb = RingBuffer::new(2, OverflowPolicy::OverwriteOldest);
        assert!(rb.try_push(1));
        assert!(rb.try_push(2));
        assert!(rb.try_push(3));
        assert_eq!(rb.dropped(), 1);
        assert_eq!(rb.try_pop(), Some(2));
        assert_eq!(rb.try_pop(), Some(3));
    }

    #[test]
    fn concurrent_spsc_preserves_all_elements() {
        const N: usize = 1_000_000;
        let rb = Arc::new(RingBuffer::<u64>::new(1024, OverflowPolicy::DropNewest));

        let producer = {
            let rb = rb.clone();
            thread::spawn(move || {
                let mut sent = 0u64;
                while sent < N as u64 {
                    if rb.try_push(sent) {
                        sent += 1;
                    } else {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = thread::spawn(move || {
            let mut received = Vec::with_capacity(N);
            while received.len() < N {
                if let Some(v) = rb.try_pop() {
                    received.push(v);
                } else {
                    thread::yield_now();
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received.len(), N);
        for (i, v) in received.iter().enumerate() {
            assert_eq!(*v, i as u64, "no lost or duplicated elements");
        }
    }
}
