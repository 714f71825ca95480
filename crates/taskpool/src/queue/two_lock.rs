//! Two-lock adapter over the SPSC queue
//!
//! One mutex serializes producers and an independent one serializes
//! consumers, so the strict 1P1C contract of [`SpscQueue`] holds while
//! producers and consumers never contend with each other, only with
//! same-role peers. This is the storage behind every task-queue lane and
//! every worker-local lane.

use parking_lot::Mutex;

use super::spsc::SpscQueue;

/// Multi-producer / multi-consumer FIFO queue built from an SPSC core and
/// two role mutexes.
pub struct TwoLockQueue<T> {
    push_lock: Mutex<()>,
    pop_lock: Mutex<()>,
    inner: SpscQueue<T>,
}

impl<T: Send> TwoLockQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            push_lock: Mutex::new(()),
            pop_lock: Mutex::new(()),
            inner: SpscQueue::new(),
        }
    }

    /// Append a value at the tail.
    pub fn push(&self, value: T) {
        let _producer = self.push_lock.lock();
        self.inner.push(value);
    }

    /// Remove the value at the head, if any.
    pub fn try_pop(&self) -> Option<T> {
        let _consumer = self.pop_lock.lock();
        self.inner.try_pop()
    }

    /// Number of queued values. Lock-free.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue currently holds no values. Lock-free.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T: Send> Default for TwoLockQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let queue = TwoLockQueue::new();
        for i in 0..100 {
            queue.push(i);
        }
        for i in 0..100 {
            assert_eq!(queue.try_pop(), Some(i));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_many_producers_many_consumers() {
        const PER_PRODUCER: u64 = 5_000;
        const PRODUCERS: u64 = 4;
        const CONSUMERS: usize = 4;

        let queue = Arc::new(TwoLockQueue::new());
        let popped = Arc::new(AtomicUsize::new(0));
        let sum = Arc::new(AtomicU64::new(0));

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push(p * PER_PRODUCER + i);
                }
            }));
        }

        let total = (PRODUCERS * PER_PRODUCER) as usize;
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            let sum = Arc::clone(&sum);
            handles.push(thread::spawn(move || loop {
                if let Some(v) = queue.try_pop() {
                    sum.fetch_add(v, Ordering::Relaxed);
                    popped.fetch_add(1, Ordering::Relaxed);
                } else if popped.load(Ordering::Relaxed) >= total {
                    break;
                } else {
                    std::hint::spin_loop();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let expected: u64 = (0..PRODUCERS * PER_PRODUCER).sum();
        assert_eq!(popped.load(Ordering::Relaxed), total);
        assert_eq!(sum.load(Ordering::Relaxed), expected);
        assert!(queue.is_empty());
    }
}
