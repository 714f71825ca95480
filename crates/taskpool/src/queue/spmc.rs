//! Lock-free single-producer / many-consumer unbounded FIFO queue
//!
//! Same node-linked ring layout as the SPSC queue, but consumers race on a
//! shared pop index with compare-and-swap, and retiring an exhausted head
//! node goes through epoch-based reclamation (`crossbeam::epoch`) instead of
//! immediate deallocation: a consumer that claimed a slot in the old head may
//! still be reading it when the head advances.

use crossbeam::epoch::{self, Atomic, Guard, Owned, Shared};
use crossbeam::utils::{Backoff, CachePadded};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::spsc::{NODE_CAPACITY, NODE_MASK};

/// Maximum number of registered consumers.
pub const MAX_CONSUMER_COUNT: usize = 32;

/// Identifier handed out by [`SpmcQueue::register_consumer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConsumerId(usize);

impl ConsumerId {
    /// Numeric value of the id.
    pub fn as_usize(self) -> usize {
        self.0
    }
}

struct Node<T> {
    /// Global index of slot 0 in this node.
    start: usize,
    slots: [UnsafeCell<MaybeUninit<T>>; NODE_CAPACITY],
    next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    fn alloc(start: usize) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            start,
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            next: Atomic::null(),
        }))
    }
}

/// Producer-only state. The tail node pointer never needs protection: a node
/// is only retired once a consumer claims a slot past it, which implies the
/// producer already moved on.
struct Producer<T> {
    tail: UnsafeCell<*mut Node<T>>,
    push_index: AtomicUsize,
}

/// Unbounded SPMC FIFO queue.
///
/// # Contract
///
/// At most one thread may call [`push`](Self::push). Any number of threads
/// (up to [`MAX_CONSUMER_COUNT`]) may pop concurrently after registering via
/// [`register_consumer`](Self::register_consumer).
pub struct SpmcQueue<T> {
    producer: CachePadded<Producer<T>>,

    /// Oldest node that may still hold unread slots.
    head: CachePadded<Atomic<Node<T>>>,

    /// Shared pop index; consumers claim slots by CAS.
    pop_index: CachePadded<AtomicUsize>,

    /// Number of registered consumers.
    consumers: AtomicUsize,

    /// Pops currently executing; [`try_reclaim`](Self::try_reclaim) asserts
    /// this is zero.
    pops_in_flight: AtomicUsize,
}

unsafe impl<T: Send> Send for SpmcQueue<T> {}
unsafe impl<T: Send> Sync for SpmcQueue<T> {}

impl<T> SpmcQueue<T> {
    /// Create an empty queue with a single pre-allocated node.
    pub fn new() -> Self {
        let first = Node::alloc(0);
        Self {
            producer: CachePadded::new(Producer {
                tail: UnsafeCell::new(first),
                push_index: AtomicUsize::new(0),
            }),
            head: CachePadded::new(unsafe { Atomic::from(Owned::from_raw(first)) }),
            pop_index: CachePadded::new(AtomicUsize::new(0)),
            consumers: AtomicUsize::new(0),
            pops_in_flight: AtomicUsize::new(0),
        }
    }

    /// Register the calling thread as a consumer and return its id.
    ///
    /// Panics when more than [`MAX_CONSUMER_COUNT`] consumers register.
    pub fn register_consumer(&self) -> ConsumerId {
        let id = self.consumers.fetch_add(1, Ordering::Relaxed);
        assert!(
            id < MAX_CONSUMER_COUNT,
            "SPMC queue consumer capacity ({MAX_CONSUMER_COUNT}) exceeded"
        );
        ConsumerId(id)
    }

    /// Number of registered consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.load(Ordering::Relaxed)
    }

    /// Append a value at the tail. Producer-only.
    pub fn push(&self, value: T) {
        let idx = self.producer.push_index.load(Ordering::Relaxed);
        let tail = unsafe { *self.producer.tail.get() };
        unsafe {
            (*tail).slots[idx & NODE_MASK]
                .get()
                .write(MaybeUninit::new(value));
        }
        // Release so every acquiring consumer that observes the new index
        // also observes the slot write and any node link below it.
        self.producer.push_index.store(idx + 1, Ordering::Release);

        if (idx + 1) & NODE_MASK == 0 {
            let fresh = Node::alloc(idx + 1);
            unsafe {
                (*tail)
                    .next
                    .store(Owned::from_raw(fresh), Ordering::Release);
                *self.producer.tail.get() = fresh;
            }
        }
    }

    /// Remove the value at the head, if any.
    ///
    /// Consumers race via CAS on the shared pop index; the one that claims
    /// the first slot of a new node also advances the shared head and
    /// retires the exhausted predecessor(s).
    pub fn pop(&self, consumer: ConsumerId) -> Option<T> {
        debug_assert!(consumer.as_usize() < self.consumer_count());
        let guard = epoch::pin();
        self.pops_in_flight.fetch_add(1, Ordering::AcqRel);
        let value = self.pop_inner(&guard);
        self.pops_in_flight.fetch_sub(1, Ordering::AcqRel);
        value
    }

    fn pop_inner(&self, guard: &Guard) -> Option<T> {
        let backoff = Backoff::new();
        loop {
            // Head must be read before the index claim: the claimed index is
            // then guaranteed to live in this node or a later one, so the
            // forward walk below always finds it.
            let head = self.head.load(Ordering::Acquire, guard);
            let idx = self.pop_index.load(Ordering::Acquire);
            if idx >= self.producer.push_index.load(Ordering::Acquire) {
                return None;
            }
            if self
                .pop_index
                .compare_exchange_weak(idx, idx + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                backoff.spin();
                continue;
            }

            // Slot `idx` is ours. Locate its node.
            let mut node = head;
            loop {
                let n = unsafe { node.deref() };
                if idx < n.start + NODE_CAPACITY {
                    break;
                }
                node = n.next.load(Ordering::Acquire, guard);
                debug_assert!(!node.is_null());
            }

            let n = unsafe { node.deref() };
            let value = unsafe { n.slots[idx - n.start].get().read().assume_init() };

            if idx & NODE_MASK == 0 && idx != 0 {
                // First slot of a node: advance the head up to this node,
                // retiring every predecessor. A stalled earlier winner is
                // covered because the walk retires as many nodes as needed.
                self.advance_head(node, guard);
            }

            return Some(value);
        }
    }

    /// CAS the head forward until it reaches `target`, retiring each node it
    /// passes. Losers observe someone else's progress and stop.
    fn advance_head(&self, target: Shared<'_, Node<T>>, guard: &Guard) {
        let target_start = unsafe { target.deref() }.start;
        let mut head = self.head.load(Ordering::Acquire, guard);
        while unsafe { head.deref() }.start < target_start {
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    // Pinned consumers may still be reading claimed slots in
                    // the retired node; the epoch collector frees it once
                    // they unpin.
                    unsafe { guard.defer_destroy(head) };
                    head = next;
                }
                Err(e) => head = e.current,
            }
        }
    }

    /// Flush this thread's epoch garbage so retired nodes can be freed.
    ///
    /// Callers must guarantee no pop is concurrently active; without calls
    /// to this, retired nodes simply accumulate until the collector runs.
    pub fn try_reclaim(&self) {
        debug_assert_eq!(
            self.pops_in_flight.load(Ordering::Acquire),
            0,
            "try_reclaim while pops are in flight"
        );
        epoch::pin().flush();
    }

    /// Number of queued values.
    pub fn len(&self) -> usize {
        let push = self.producer.push_index.load(Ordering::Acquire);
        let pop = self.pop_index.load(Ordering::Acquire);
        push.saturating_sub(pop)
    }

    /// Whether the queue currently holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SpmcQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SpmcQueue<T> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let push = self.producer.push_index.load(Ordering::Relaxed);
            let mut idx = self.pop_index.load(Ordering::Relaxed);

            // Drop values that were pushed but never claimed.
            let mut node = self.head.load(Ordering::Relaxed, guard);
            while idx < push {
                while idx >= node.deref().start + NODE_CAPACITY {
                    node = node.deref().next.load(Ordering::Relaxed, guard);
                }
                let n = node.deref();
                std::ptr::drop_in_place(n.slots[idx - n.start].get().cast::<T>());
                idx += 1;
            }

            // Free the remaining node chain.
            let mut node = self.head.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_register_consumer_ids() {
        let queue: SpmcQueue<u32> = SpmcQueue::new();
        let a = queue.register_consumer();
        let b = queue.register_consumer();
        assert_eq!(a.as_usize(), 0);
        assert_eq!(b.as_usize(), 1);
        assert_eq!(queue.consumer_count(), 2);
    }

    #[test]
    fn test_single_consumer_fifo() {
        let queue = SpmcQueue::new();
        let consumer = queue.register_consumer();
        for i in 0..(NODE_CAPACITY * 3 + 5) {
            queue.push(i);
        }
        for i in 0..(NODE_CAPACITY * 3 + 5) {
            assert_eq!(queue.pop(consumer), Some(i));
        }
        assert_eq!(queue.pop(consumer), None);
        queue.try_reclaim();
    }

    #[test]
    fn test_drop_releases_pending_values() {
        let queue = SpmcQueue::new();
        let consumer = queue.register_consumer();
        for i in 0..100 {
            queue.push(Arc::new(i));
        }
        for _ in 0..40 {
            queue.pop(consumer).unwrap();
        }
        drop(queue);
    }

    #[test]
    fn test_concurrent_one_producer_many_consumers() {
        use rand::Rng;

        const COUNT: usize = 20_000;
        const CONSUMERS: usize = 5;

        let queue = Arc::new(SpmcQueue::new());
        let values: Vec<u64> = {
            let mut rng = rand::thread_rng();
            (0..COUNT).map(|_| rng.gen_range(0..1_000)).collect()
        };
        let expected: u64 = values.iter().sum();
        let popped = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let consumer = queue.register_consumer();
            let popped = Arc::clone(&popped);
            handles.push(thread::spawn(move || {
                let mut sum = 0u64;
                loop {
                    if let Some(v) = queue.pop(consumer) {
                        sum += v;
                        popped.fetch_add(1, Ordering::Relaxed);
                    } else if popped.load(Ordering::Relaxed) >= COUNT {
                        break;
                    } else {
                        std::hint::spin_loop();
                    }
                }
                sum
            }));
        }

        for v in values {
            queue.push(v);
        }

        let total: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(popped.load(Ordering::Relaxed), COUNT);
        assert_eq!(total, expected);
        assert!(queue.is_empty());
    }
}
