//! Pool facade tying scheduler, queue set and wait list together
//!
//! One [`TaskPool`] is one independent scheduling universe. It is an
//! explicitly owned object, not a process-wide singleton, so tests (and
//! embedders) can run several pools side by side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::TaskPoolError;
use crate::queue_set::TaskQueueSet;
use crate::scheduler::{SchedulerShared, TaskScheduler, MAX_WORKER_COUNT};
use crate::selector::TaskSelector;
use crate::stats::StatsMode;
use crate::task_queue::{DeferredTask, TaskQueue, WakeCallback};
use crate::wait_list::WaitList;

/// An in-process task pool: bounded worker pool, ≤32 priority-weighted
/// queues, timed deferral, optional timing telemetry.
///
/// Dropping the pool shuts it down; see [`shutdown`](Self::shutdown) for
/// the exact semantics.
pub struct TaskPool {
    // Declaration order is drop order: workers go first, then the
    // registry, then the deferral list.
    scheduler: TaskScheduler,
    queue_set: Arc<TaskQueueSet>,
    wait_list: Arc<WaitList<DeferredTask>>,
    shut_down: AtomicBool,
}

impl TaskPool {
    /// Create a pool with `worker_count` workers (0 means one per CPU
    /// core) and the requested telemetry mode. Both are clamped to
    /// [`MAX_WORKER_COUNT`].
    pub fn new(worker_count: usize, stats_mode: StatsMode) -> Self {
        let worker_count = if worker_count == 0 {
            num_cpus::get()
        } else {
            worker_count
        }
        .min(MAX_WORKER_COUNT);

        let wait_list = Arc::new(WaitList::new());
        let shared = Arc::new(SchedulerShared::new(Arc::clone(&wait_list)));
        let wake: WakeCallback = {
            // Weak: the shared state owns the queue set, which holds this
            // callback.
            let shared = Arc::downgrade(&shared);
            Arc::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.wake_workers();
                }
            })
        };
        let queue_set = Arc::new(TaskQueueSet::new(
            Arc::clone(&wait_list),
            wake,
            stats_mode,
        ));
        shared.set_queue_set(Arc::clone(&queue_set));

        let scheduler = TaskScheduler::new(shared);
        scheduler.set_workers_count(worker_count);

        Self {
            scheduler,
            queue_set,
            wait_list,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Register a new queue with selection `priority` (1..=16).
    ///
    /// Fails when the 32-slot registry is exhausted, the priority is out of
    /// range, or the pool has been shut down.
    pub fn create_task_queue(&self, priority: usize) -> Result<Arc<TaskQueue>, TaskPoolError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(TaskPoolError::ShutDown);
        }
        self.queue_set.create_queue(priority)
    }

    /// Drain `queue` in the calling thread, wait for its in-flight tasks,
    /// and release its registry slot.
    pub fn destroy_task_queue(&self, queue: &Arc<TaskQueue>) {
        self.queue_set.delete_queue(queue);
    }

    /// Resize the worker pool to `min(count, MAX_WORKER_COUNT)`.
    pub fn set_workers_count(&self, count: usize) {
        debug_assert!(
            !self.shut_down.load(Ordering::Acquire),
            "resizing a shut-down pool"
        );
        self.scheduler.set_workers_count(count);
    }

    /// Current worker pool size.
    pub fn workers_count(&self) -> usize {
        self.scheduler.workers_count()
    }

    /// Block until every live task of every registered queue is destroyed.
    pub fn wait_all_queues(&self) {
        for queue in self.queue_set.queues() {
            queue.wait_tasks();
        }
    }

    /// Whether every registered queue has empty lanes.
    pub fn queues_empty(&self) -> bool {
        self.queue_set.queues_empty()
    }

    /// Live tasks across every registered queue.
    pub fn live_task_count(&self) -> usize {
        self.queue_set.live_task_count()
    }

    /// Stop the workers and drain whatever is still queued in the calling
    /// thread, busiest queue first. Deferred entries whose deadline has
    /// elapsed are executed too; entries still waiting are discarded (their
    /// live counters are released). Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.set_workers_count(0);
        self.wait_list.process(|deferred| deferred.enqueue());
        while let Some(queue) = TaskSelector::busiest(self.queue_set.queues()) {
            while queue.execute_task() {}
        }
        self.wait_list.clear();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
