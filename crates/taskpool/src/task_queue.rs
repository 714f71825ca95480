//! Priority-weighted task queue with foreground and background lanes
//!
//! A queue is the producer-facing object: closures go in through the `add_*`
//! operations, workers (or a cooperating caller thread) drain them, and the
//! `wait_*` barriers block until every accepted task has been destroyed,
//! not merely dequeued.

use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::queue::TwoLockQueue;
use crate::stats::{StatsMode, TaskTimeStats, TimeStatsSnapshot};
use crate::task::{Lane, Task, TaskRunner};
use crate::wait_list::{WaitList, WaiterId};
use crate::{MAX_QUEUE_PRIORITY, MIN_QUEUE_PRIORITY};

/// Callback installed at registration; invoked after every push so sleeping
/// workers get woken.
pub(crate) type WakeCallback = Arc<dyn Fn() + Send + Sync>;

/// State shared between a queue and every task it has created: the live
/// counters, the completion barrier, and the optional stats sink.
///
/// Tasks hold an `Arc` to this core rather than to the queue itself, so a
/// task popped into a worker keeps the counters alive even while the queue
/// object is being torn down.
pub(crate) struct QueueCore {
    foreground_live: AtomicUsize,
    background_live: AtomicUsize,
    barrier_lock: Mutex<()>,
    barrier_cv: Condvar,
    stats: Option<TaskTimeStats>,
}

impl QueueCore {
    fn new(stats_mode: StatsMode) -> Self {
        Self {
            foreground_live: AtomicUsize::new(0),
            background_live: AtomicUsize::new(0),
            barrier_lock: Mutex::new(()),
            barrier_cv: Condvar::new(),
            stats: match stats_mode {
                StatsMode::NoStatistics => None,
                StatsMode::LightStatistics => Some(TaskTimeStats::default()),
            },
        }
    }

    pub(crate) fn stats(&self) -> Option<&TaskTimeStats> {
        self.stats.as_ref()
    }

    fn live_counter(&self, lane: Lane) -> &AtomicUsize {
        match lane {
            Lane::Foreground => &self.foreground_live,
            Lane::Background => &self.background_live,
        }
    }

    /// Must be called exactly once before constructing the matching task.
    /// Incrementing first means a concurrent `wait_*` caller can never
    /// observe a false empty state.
    pub(crate) fn on_task_created(&self, lane: Lane) {
        self.live_counter(lane).fetch_add(1, Ordering::AcqRel);
    }

    /// Called exactly once from `Task::drop`.
    pub(crate) fn on_task_destroyed(&self, lane: Lane) {
        let previous = self.live_counter(lane).fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "live-task counter underflow");
        if previous == 1 {
            // Taking the barrier lock orders this notification after any
            // waiter that just observed a non-zero counter and is about to
            // block, so the wakeup cannot be lost.
            let _barrier = self.barrier_lock.lock();
            self.barrier_cv.notify_all();
        }
    }

    fn live(&self, foreground: bool, background: bool) -> usize {
        let mut count = 0;
        if foreground {
            count += self.foreground_live.load(Ordering::Acquire);
        }
        if background {
            count += self.background_live.load(Ordering::Acquire);
        }
        count
    }

    fn wait_for_drained(&self, foreground: bool, background: bool) {
        let mut barrier = self.barrier_lock.lock();
        while self.live(foreground, background) != 0 {
            self.barrier_cv.wait(&mut barrier);
        }
    }
}

/// A task deferred through the wait list: the already-constructed task plus
/// a non-owning handle back to its queue.
pub(crate) struct DeferredTask {
    task: Task,
    queue: Weak<TaskQueue>,
}

impl DeferredTask {
    /// Move the task into its queue's live lane. If the queue is gone the
    /// task is dropped, which still decrements the live counter through the
    /// core handle the task carries.
    pub(crate) fn enqueue(self) {
        if let Some(queue) = self.queue.upgrade() {
            queue.push_ready(self.task);
        }
    }
}

/// A producer-facing task queue with two lanes.
pub struct TaskQueue {
    foreground: TwoLockQueue<Task>,
    background: TwoLockQueue<Task>,
    core: Arc<QueueCore>,
    priority: AtomicUsize,
    id: OnceCell<usize>,
    wake_workers: OnceCell<WakeCallback>,
    wait_list: Arc<WaitList<DeferredTask>>,
}

impl TaskQueue {
    pub(crate) fn new(
        priority: usize,
        stats_mode: StatsMode,
        wait_list: Arc<WaitList<DeferredTask>>,
    ) -> Self {
        assert!(
            (MIN_QUEUE_PRIORITY..=MAX_QUEUE_PRIORITY).contains(&priority),
            "queue priority {priority} outside valid range"
        );
        Self {
            foreground: TwoLockQueue::new(),
            background: TwoLockQueue::new(),
            core: Arc::new(QueueCore::new(stats_mode)),
            priority: AtomicUsize::new(priority),
            id: OnceCell::new(),
            wake_workers: OnceCell::new(),
            wait_list,
        }
    }

    /// Registry id, assigned exactly once when the queue enters a
    /// [`TaskQueueSet`](crate::queue_set::TaskQueueSet).
    pub fn id(&self) -> Option<usize> {
        self.id.get().copied()
    }

    pub(crate) fn assign_id(&self, id: usize) {
        self.id.set(id).expect("queue id assigned twice");
    }

    pub(crate) fn install_wake_callback(&self, callback: WakeCallback) {
        let _ = self.wake_workers.set(callback);
    }

    /// Current selection priority.
    pub fn priority(&self) -> usize {
        self.priority.load(Ordering::Relaxed)
    }

    /// Change the selection priority. Takes effect on subsequent selections.
    pub fn set_priority(&self, priority: usize) {
        assert!(
            (MIN_QUEUE_PRIORITY..=MAX_QUEUE_PRIORITY).contains(&priority),
            "queue priority {priority} outside valid range"
        );
        self.priority.store(priority, Ordering::Relaxed);
    }

    fn lane(&self, lane: Lane) -> &TwoLockQueue<Task> {
        match lane {
            Lane::Foreground => &self.foreground,
            Lane::Background => &self.background,
        }
    }

    fn add_task(&self, lane: Lane, runner: TaskRunner) {
        // Counter first, task second: see QueueCore::on_task_created.
        self.core.on_task_created(lane);
        let task = Task::new(runner, lane, Arc::clone(&self.core));
        self.lane(lane).push(task);
        self.wake();
    }

    /// Submit a closure to the foreground lane.
    pub fn add_foreground_task(&self, runner: impl FnOnce() + Send + 'static) {
        self.add_task(Lane::Foreground, Box::new(runner));
    }

    /// Submit a closure to the background lane.
    pub fn add_background_task(&self, runner: impl FnOnce() + Send + 'static) {
        self.add_task(Lane::Background, Box::new(runner));
    }

    fn add_task_to_wait_list(
        self: &Arc<Self>,
        lane: Lane,
        runner: TaskRunner,
        timeout: Option<Duration>,
    ) -> WaiterId {
        self.core.on_task_created(lane);
        let task = Task::new(runner, lane, Arc::clone(&self.core));
        self.wait_list.add(
            DeferredTask {
                task,
                queue: Arc::downgrade(self),
            },
            timeout,
        )
    }

    /// Defer a foreground closure until `timeout` elapses (forever when
    /// `None`) or until [`signal_wait_list`](Self::signal_wait_list) is
    /// called with the returned id.
    ///
    /// The task counts as live from this call on, so `wait_*` barriers block
    /// until it eventually runs or is discarded.
    pub fn add_foreground_task_to_wait_list(
        self: &Arc<Self>,
        runner: impl FnOnce() + Send + 'static,
        timeout: Option<Duration>,
    ) -> WaiterId {
        self.add_task_to_wait_list(Lane::Foreground, Box::new(runner), timeout)
    }

    /// Background-lane variant of
    /// [`add_foreground_task_to_wait_list`](Self::add_foreground_task_to_wait_list).
    pub fn add_background_task_to_wait_list(
        self: &Arc<Self>,
        runner: impl FnOnce() + Send + 'static,
        timeout: Option<Duration>,
    ) -> WaiterId {
        self.add_task_to_wait_list(Lane::Background, Box::new(runner), timeout)
    }

    /// Transplant a deferred task into its live lane right now, bypassing
    /// its deadline. No-op if the id already fired or never existed.
    pub fn signal_wait_list(&self, id: WaiterId) {
        if let Some(deferred) = self.wait_list.take(id) {
            deferred.enqueue();
        }
    }

    /// Push a task that finished waiting. Also used by workers draining the
    /// wait list.
    pub(crate) fn push_ready(&self, task: Task) {
        self.lane(task.lane()).push(task);
        self.wake();
    }

    fn wake(&self) {
        if let Some(callback) = self.wake_workers.get() {
            callback();
        }
    }

    /// Pop one task, foreground first.
    pub fn pop_task(&self) -> Option<Task> {
        self.foreground
            .try_pop()
            .or_else(|| self.background.try_pop())
    }

    /// Pop one foreground task.
    pub fn pop_foreground_task(&self) -> Option<Task> {
        self.foreground.try_pop()
    }

    /// Pop one background task.
    pub fn pop_background_task(&self) -> Option<Task> {
        self.background.try_pop()
    }

    /// Bulk-transfer up to `limit` tasks into the caller's sinks,
    /// foreground first. Returns the number actually moved. This is how the
    /// scheduler refills a worker's local lanes in one pass.
    pub fn pop_tasks_to_worker(
        &self,
        mut add_foreground: impl FnMut(Task),
        mut add_background: impl FnMut(Task),
        limit: usize,
    ) -> usize {
        let mut moved = 0;
        while moved < limit {
            match self.foreground.try_pop() {
                Some(task) => {
                    add_foreground(task);
                    moved += 1;
                }
                None => break,
            }
        }
        while moved < limit {
            match self.background.try_pop() {
                Some(task) => {
                    add_background(task);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }

    /// Pop and run one task (foreground first) in the calling thread.
    /// Returns whether a task ran. Lets a non-worker thread drain
    /// cooperatively.
    pub fn execute_task(&self) -> bool {
        match self.pop_task() {
            Some(task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    /// Foreground-only variant of [`execute_task`](Self::execute_task).
    pub fn execute_foreground_task(&self) -> bool {
        match self.pop_foreground_task() {
            Some(task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    /// Background-only variant of [`execute_task`](Self::execute_task).
    pub fn execute_background_task(&self) -> bool {
        match self.pop_background_task() {
            Some(task) => {
                task.run();
                true
            }
            None => false,
        }
    }

    /// Whether both lanes are empty. Live tasks already popped by workers
    /// are not counted; use [`wait_tasks`](Self::wait_tasks) for a
    /// completion barrier.
    pub fn is_empty(&self) -> bool {
        self.foreground.is_empty() && self.background.is_empty()
    }

    /// Whether the foreground lane has queued tasks.
    pub fn has_foreground_tasks(&self) -> bool {
        !self.foreground.is_empty()
    }

    /// Whether the background lane has queued tasks.
    pub fn has_background_tasks(&self) -> bool {
        !self.background.is_empty()
    }

    /// Queued tasks across both lanes.
    pub fn size(&self) -> usize {
        self.foreground.len() + self.background.len()
    }

    /// Queued foreground tasks.
    pub fn count_of_foreground_tasks(&self) -> usize {
        self.foreground.len()
    }

    /// Queued background tasks.
    pub fn count_of_background_tasks(&self) -> usize {
        self.background.len()
    }

    /// Live tasks (created, not yet destroyed) across both lanes, including
    /// deferred ones and ones currently executing on workers.
    pub fn live_task_count(&self) -> usize {
        self.core.live(true, true)
    }

    /// Block until every live task of both lanes has been destroyed.
    pub fn wait_tasks(&self) {
        self.core.wait_for_drained(true, true);
    }

    /// Block until every live foreground task has been destroyed.
    pub fn wait_foreground_tasks(&self) {
        self.core.wait_for_drained(true, false);
    }

    /// Block until every live background task has been destroyed.
    pub fn wait_background_tasks(&self) {
        self.core.wait_for_drained(false, true);
    }

    /// Timing telemetry snapshot; `None` unless the pool was created with
    /// [`StatsMode::LightStatistics`].
    pub fn time_stats(&self) -> Option<TimeStatsSnapshot> {
        self.core.stats().map(TaskTimeStats::snapshot)
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        // Contract violation, not a recoverable state: a queue must be
        // drained before it is destroyed.
        debug_assert!(self.is_empty(), "task queue dropped with queued tasks");
        debug_assert_eq!(
            self.core.live(true, true),
            0,
            "task queue dropped with live tasks"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn new_queue(priority: usize) -> Arc<TaskQueue> {
        Arc::new(TaskQueue::new(
            priority,
            StatsMode::NoStatistics,
            Arc::new(WaitList::new()),
        ))
    }

    #[test]
    fn test_execute_runs_in_submission_order() {
        let queue = new_queue(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = Arc::clone(&order);
            queue.add_foreground_task(move || order.lock().push(i));
        }
        while queue.execute_task() {}
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_foreground_drains_before_background() {
        let queue = new_queue(8);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.add_background_task(move || order.lock().push(format!("bg{i}")));
        }
        for i in 0..3 {
            let order = Arc::clone(&order);
            queue.add_foreground_task(move || order.lock().push(format!("fg{i}")));
        }
        while queue.execute_task() {}
        assert_eq!(
            *order.lock(),
            vec!["fg0", "fg1", "fg2", "bg0", "bg1", "bg2"]
        );
    }

    #[test]
    fn test_counts_track_lanes() {
        let queue = new_queue(8);
        queue.add_foreground_task(|| {});
        queue.add_background_task(|| {});
        queue.add_background_task(|| {});

        assert_eq!(queue.count_of_foreground_tasks(), 1);
        assert_eq!(queue.count_of_background_tasks(), 2);
        assert_eq!(queue.size(), 3);
        assert!(queue.has_foreground_tasks());
        assert!(queue.has_background_tasks());
        assert_eq!(queue.live_task_count(), 3);

        while queue.execute_task() {}
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.live_task_count(), 0);
    }

    #[test]
    fn test_wait_tasks_blocks_until_destruction() {
        let queue = new_queue(8);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            queue.add_background_task(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        let drainer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || while queue.execute_task() {})
        };

        queue.wait_tasks();
        assert_eq!(counter.load(Ordering::Relaxed), 20);
        assert!(queue.is_empty());
        drainer.join().unwrap();
    }

    #[test]
    fn test_lane_specific_wait() {
        let queue = new_queue(8);
        queue.add_background_task(|| {});
        // No foreground tasks: the foreground barrier must not block.
        queue.wait_foreground_tasks();
        assert!(queue.execute_background_task());
        queue.wait_background_tasks();
    }

    #[test]
    fn test_pop_tasks_to_worker_moves_foreground_first() {
        let queue = new_queue(8);
        for _ in 0..4 {
            queue.add_background_task(|| {});
        }
        for _ in 0..3 {
            queue.add_foreground_task(|| {});
        }

        let mut foreground = Vec::new();
        let mut background = Vec::new();
        let moved =
            queue.pop_tasks_to_worker(|t| foreground.push(t), |t| background.push(t), 5);
        assert_eq!(moved, 5);
        assert_eq!(foreground.len(), 3);
        assert_eq!(background.len(), 2);
        assert_eq!(queue.size(), 2);

        for task in foreground.into_iter().chain(background) {
            task.run();
        }
        while queue.execute_task() {}
    }

    #[test]
    fn test_signal_wait_list_transplants_immediately() {
        let wait_list = Arc::new(WaitList::new());
        let queue = Arc::new(TaskQueue::new(
            8,
            StatsMode::NoStatistics,
            Arc::clone(&wait_list),
        ));

        let ran = Arc::new(AtomicUsize::new(0));
        let id = {
            let ran = Arc::clone(&ran);
            queue.add_foreground_task_to_wait_list(
                move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                },
                None,
            )
        };
        assert!(id.is_valid());
        assert!(queue.is_empty());
        assert_eq!(queue.live_task_count(), 1);

        queue.signal_wait_list(id);
        assert_eq!(queue.size(), 1);
        assert!(queue.execute_task());
        assert_eq!(ran.load(Ordering::Relaxed), 1);
        queue.wait_tasks();

        // Signalling again is a no-op.
        queue.signal_wait_list(id);
    }

    #[test]
    fn test_timed_wait_list_entry_fires_via_process() {
        let wait_list = Arc::new(WaitList::new());
        let queue = Arc::new(TaskQueue::new(
            8,
            StatsMode::NoStatistics,
            Arc::clone(&wait_list),
        ));

        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            queue.add_background_task_to_wait_list(
                move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                },
                Some(Duration::from_millis(10)),
            );
        }

        thread::sleep(Duration::from_millis(30));
        assert_eq!(wait_list.process(DeferredTask::enqueue), 1);
        assert!(queue.execute_background_task());
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_stats_record_finished_tasks() {
        let queue = Arc::new(TaskQueue::new(
            8,
            StatsMode::LightStatistics,
            Arc::new(WaitList::new()),
        ));
        for _ in 0..5 {
            queue.add_foreground_task(|| thread::sleep(Duration::from_millis(1)));
        }
        while queue.execute_task() {}

        let snapshot = queue.time_stats().expect("stats enabled");
        assert_eq!(snapshot.finished, 5);
        assert!(snapshot.max_exec >= Duration::from_millis(1));
        assert!(snapshot.max_life >= snapshot.max_exec);
    }

    #[test]
    fn test_invalidated_task_still_releases_counter() {
        let queue = new_queue(8);
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = Arc::clone(&ran);
            queue.add_foreground_task(move || {
                ran.fetch_add(1, Ordering::Relaxed);
            });
        }

        let mut task = queue.pop_task().unwrap();
        assert!(!task.is_invalid());
        task.make_invalid();
        assert!(task.is_invalid());
        drop(task);

        // Never ran, but the completion barrier still opens.
        queue.wait_tasks();
        assert_eq!(ran.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_priority_mutation() {
        let queue = new_queue(4);
        assert_eq!(queue.priority(), 4);
        queue.set_priority(16);
        assert_eq!(queue.priority(), 16);
    }
}
