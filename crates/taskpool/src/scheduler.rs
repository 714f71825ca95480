//! Task scheduler: owns the worker pool, wakes and resizes it
//!
//! The scheduler holds the state every worker shares (the queue set, the
//! wait list, the sleep condvar and the steal registry) and implements
//! pool resizing: growth spawns threads, shrink marks the excess finished,
//! broadcasts the wakeup and joins the threads outside the sleep lock so a
//! sleeping worker can always get out of bed to die.

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::queue_set::TaskQueueSet;
use crate::task_queue::DeferredTask;
use crate::wait_list::WaitList;
use crate::worker::{WorkerLocal, WorkerThread};

/// Hard cap on the worker pool size.
pub const MAX_WORKER_COUNT: usize = 16;

/// State shared by every worker thread and by the producer-side wake path.
pub(crate) struct SchedulerShared {
    /// Set once during pool construction, before any worker spawns.
    queue_set: OnceCell<Arc<TaskQueueSet>>,

    /// Deferred tasks; workers drain it opportunistically.
    pub(crate) wait_list: Arc<WaitList<DeferredTask>>,

    /// Steal registry: the local lanes of every running worker.
    pub(crate) workers: RwLock<Vec<Arc<WorkerLocal>>>,

    /// Number of workers currently blocked in the idle sleep.
    pub(crate) sleepers: Mutex<usize>,
    pub(crate) wake_cv: Condvar,

    /// At most one worker processes the wait list per iteration.
    pub(crate) wait_list_in_progress: AtomicBool,
}

impl SchedulerShared {
    pub(crate) fn new(wait_list: Arc<WaitList<DeferredTask>>) -> Self {
        Self {
            queue_set: OnceCell::new(),
            wait_list,
            workers: RwLock::new(Vec::new()),
            sleepers: Mutex::new(0),
            wake_cv: Condvar::new(),
            wait_list_in_progress: AtomicBool::new(false),
        }
    }

    pub(crate) fn set_queue_set(&self, queue_set: Arc<TaskQueueSet>) {
        self.queue_set
            .set(queue_set)
            .unwrap_or_else(|_| panic!("queue set installed twice"));
    }

    pub(crate) fn queue_set(&self) -> &Arc<TaskQueueSet> {
        self.queue_set.get().expect("queue set not installed")
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Wake sleeping workers, if any. Called after every queue push.
    pub(crate) fn wake_workers(&self) {
        let sleepers = self.sleepers.lock();
        if *sleepers > 0 {
            self.wake_cv.notify_all();
        }
    }
}

/// Owner of the worker pool.
pub(crate) struct TaskScheduler {
    shared: Arc<SchedulerShared>,
    /// Worker handles; the mutex also serializes concurrent resizes.
    threads: Mutex<Vec<WorkerThread>>,
}

impl TaskScheduler {
    pub(crate) fn new(shared: Arc<SchedulerShared>) -> Self {
        Self {
            shared,
            threads: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<SchedulerShared> {
        &self.shared
    }

    /// Grow or shrink the pool to `min(count, MAX_WORKER_COUNT)` workers.
    pub(crate) fn set_workers_count(&self, count: usize) {
        let target = count.min(MAX_WORKER_COUNT);
        let mut threads = self.threads.lock();
        let current = threads.len();

        if target > current {
            for id in current..target {
                let worker = WorkerThread::spawn(id, Arc::clone(&self.shared));
                self.shared.workers.write().push(Arc::clone(&worker.local));
                threads.push(worker);
            }
        } else if target < current {
            let mut excess: Vec<WorkerThread> = threads.drain(target..).collect();

            // Unregister the doomed lanes first so nobody picks them as a
            // steal victim; each doomed worker drains its own leftovers.
            self.shared.workers.write().truncate(target);
            for worker in &excess {
                worker.local.finish.store(true, Ordering::Release);
            }
            {
                let _sleepers = self.shared.sleepers.lock();
                self.shared.wake_cv.notify_all();
            }

            // Join outside the sleep lock: a worker stuck in its idle wait
            // needs that lock to wake up and observe the finish flag.
            for worker in &mut excess {
                worker.join();
            }
        }
    }

    pub(crate) fn workers_count(&self) -> usize {
        self.threads.lock().len()
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.set_workers_count(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::StatsMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn new_scheduler() -> (TaskScheduler, Arc<TaskQueueSet>) {
        let wait_list = Arc::new(WaitList::new());
        let shared = Arc::new(SchedulerShared::new(Arc::clone(&wait_list)));
        // Weak: the queue set is itself owned by the shared state.
        let wake = {
            let shared = Arc::downgrade(&shared);
            Arc::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.wake_workers();
                }
            }) as crate::task_queue::WakeCallback
        };
        let queue_set = Arc::new(TaskQueueSet::new(wait_list, wake, StatsMode::NoStatistics));
        shared.set_queue_set(Arc::clone(&queue_set));
        (TaskScheduler::new(shared), queue_set)
    }

    #[test]
    fn test_resize_clamps_to_max() {
        let (scheduler, _set) = new_scheduler();
        scheduler.set_workers_count(MAX_WORKER_COUNT + 10);
        assert_eq!(scheduler.workers_count(), MAX_WORKER_COUNT);
        scheduler.set_workers_count(0);
        assert_eq!(scheduler.workers_count(), 0);
    }

    #[test]
    fn test_resize_up_and_down() {
        let (scheduler, _set) = new_scheduler();
        scheduler.set_workers_count(4);
        assert_eq!(scheduler.workers_count(), 4);
        assert_eq!(scheduler.shared().worker_count(), 4);

        scheduler.set_workers_count(1);
        assert_eq!(scheduler.workers_count(), 1);
        assert_eq!(scheduler.shared().worker_count(), 1);
    }

    #[test]
    fn test_workers_drain_queue() {
        let (scheduler, set) = new_scheduler();
        scheduler.set_workers_count(2);

        let queue = set.create_queue(8).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            queue.add_background_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        queue.wait_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
        assert!(queue.is_empty());
        set.delete_queue(&queue);
    }

    #[test]
    fn test_shrink_does_not_lose_tasks() {
        let (scheduler, set) = new_scheduler();
        let queue = set.create_queue(8).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        scheduler.set_workers_count(0);
        for _ in 0..30 {
            let counter = Arc::clone(&counter);
            queue.add_foreground_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);

        scheduler.set_workers_count(3);
        queue.wait_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 30);
        set.delete_queue(&queue);
    }

    #[test]
    fn test_idle_workers_pick_up_late_work() {
        let (scheduler, set) = new_scheduler();
        scheduler.set_workers_count(2);
        let queue = set.create_queue(8).unwrap();

        // Let the workers reach their idle sleep first.
        std::thread::sleep(Duration::from_millis(20));

        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            queue.add_foreground_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        queue.wait_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        set.delete_queue(&queue);
    }
}
