//! Lock-free single-producer / single-consumer unbounded FIFO queue
//!
//! Storage is a linked list of fixed-size ring nodes. The producer writes
//! into the tail node and links a fresh node whenever its write index wraps;
//! the consumer reads from the head node and frees an exhausted node
//! immediately, which is safe because under the 1P1C contract no other
//! thread can still hold a reference to it.

use crossbeam::utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Slots per ring node. Must be a power of two.
pub(crate) const NODE_CAPACITY: usize = 32;
pub(crate) const NODE_MASK: usize = NODE_CAPACITY - 1;

struct Node<T> {
    slots: [UnsafeCell<MaybeUninit<T>>; NODE_CAPACITY],
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn alloc() -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            slots: std::array::from_fn(|_| UnsafeCell::new(MaybeUninit::uninit())),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

/// One side of the queue: the node currently in use plus a monotonic
/// slot index. The node pointer is only ever touched by its owning role.
struct Side<T> {
    node: UnsafeCell<*mut Node<T>>,
    index: AtomicUsize,
}

/// Unbounded SPSC FIFO queue.
///
/// # Contract
///
/// At most one thread may call [`push`](Self::push) and at most one thread
/// may call [`try_pop`](Self::try_pop) at any given time. The queue does not
/// enforce this itself; [`TwoLockQueue`](crate::queue::TwoLockQueue) wraps it
/// with per-role mutexes when multi-producer/multi-consumer access is needed.
pub struct SpscQueue<T> {
    /// Producer side (tail node + push index).
    tail: CachePadded<Side<T>>,

    /// Consumer side (head node + pop index).
    head: CachePadded<Side<T>>,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    /// Create an empty queue with a single pre-allocated node.
    pub fn new() -> Self {
        let first = Node::alloc();
        Self {
            tail: CachePadded::new(Side {
                node: UnsafeCell::new(first),
                index: AtomicUsize::new(0),
            }),
            head: CachePadded::new(Side {
                node: UnsafeCell::new(first),
                index: AtomicUsize::new(0),
            }),
        }
    }

    /// Append a value at the tail. Producer-only.
    pub fn push(&self, value: T) {
        let idx = self.tail.index.load(Ordering::Relaxed);
        let node = unsafe { *self.tail.node.get() };
        unsafe {
            (*node).slots[idx & NODE_MASK]
                .get()
                .write(MaybeUninit::new(value));
        }
        // Publish the slot before anything else; the consumer gates every
        // read on this index.
        self.tail.index.store(idx + 1, Ordering::Release);

        if (idx + 1) & NODE_MASK == 0 {
            // Write index wrapped: link a fresh node. The consumer cannot
            // need it before it observes a push index inside the new node,
            // which is published after this store.
            let fresh = Node::alloc();
            unsafe {
                (*node).next.store(fresh, Ordering::Release);
                *self.tail.node.get() = fresh;
            }
        }
    }

    /// Remove the value at the head, if any. Consumer-only.
    pub fn try_pop(&self) -> Option<T> {
        let idx = self.head.index.load(Ordering::Relaxed);
        if idx == self.tail.index.load(Ordering::Acquire) {
            return None;
        }

        let mut node = unsafe { *self.head.node.get() };
        if idx & NODE_MASK == 0 && idx != 0 {
            // Crossing into the next node. The old head is freed on the
            // spot: with exactly one producer and one consumer, nobody else
            // can still be reading it.
            let next = unsafe { (*node).next.load(Ordering::Acquire) };
            debug_assert!(!next.is_null());
            unsafe {
                drop(Box::from_raw(node));
                *self.head.node.get() = next;
            }
            node = next;
        }

        let value = unsafe { (*node).slots[idx & NODE_MASK].get().read().assume_init() };
        self.head.index.store(idx + 1, Ordering::Release);
        Some(value)
    }

    /// Number of queued values, derived from the two monotonic indices.
    pub fn len(&self) -> usize {
        let push = self.tail.index.load(Ordering::Acquire);
        let pop = self.head.index.load(Ordering::Acquire);
        push.saturating_sub(pop)
    }

    /// Whether the queue currently holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for SpscQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
        unsafe {
            let mut node = *self.head.node.get();
            while !node.is_null() {
                let next = (*node).next.load(Ordering::Relaxed);
                drop(Box::from_raw(node));
                node = next;
            }
        }
    }
}
