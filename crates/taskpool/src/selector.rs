//! Heap-based queue selection utility
//!
//! Alternative to the weighted round robin of the queue set: ranks
//! candidate queues by (priority, pending size) and yields the heaviest.
//! The pool uses it to drain leftovers at shutdown; embedders can use it
//! for one-shot "which queue is hottest" decisions.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::task_queue::TaskQueue;

struct Candidate {
    priority: usize,
    pending: usize,
    queue: Arc<TaskQueue>,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.pending.cmp(&other.pending))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.pending == other.pending
    }
}

impl Eq for Candidate {}

/// Stateless heap-based selector.
pub struct TaskSelector;

impl TaskSelector {
    /// The non-empty queue with the highest (priority, pending) weight, or
    /// `None` when every candidate is empty.
    pub fn busiest(queues: impl IntoIterator<Item = Arc<TaskQueue>>) -> Option<Arc<TaskQueue>> {
        let mut heap: BinaryHeap<Candidate> = queues
            .into_iter()
            .filter_map(|queue| {
                let pending = queue.size();
                (pending > 0).then(|| Candidate {
                    priority: queue.priority(),
                    pending,
                    queue,
                })
            })
            .collect();
        heap.pop().map(|c| c.queue)
    }
}
