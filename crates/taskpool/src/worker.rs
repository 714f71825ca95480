//! Worker thread: fill local lanes, drain them, repeat
//!
//! Each worker owns two local lanes and alternates between a filling phase
//! (wait-list processing, weighted queue selection, stealing, or a timed
//! sleep) and an execution phase that drains both lanes to completion.
//! Execution is synchronous: a long task monopolizes its worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::queue::TwoLockQueue;
use crate::scheduler::SchedulerShared;
use crate::task::{Lane, Task};

/// Cap on how many tasks one refill may move into a worker's local lanes.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 16;

/// How long an idle worker sleeps before re-checking for work, shutdown or
/// resize. Wakeups also arrive explicitly whenever a queue gains work.
const IDLE_SLEEP_INTERVAL: Duration = Duration::from_millis(2);

/// The part of a worker other threads touch: its local lanes (steal
/// targets) and its finish flag.
pub(crate) struct WorkerLocal {
    foreground: TwoLockQueue<Task>,
    background: TwoLockQueue<Task>,
    pub(crate) finish: AtomicBool,
}

impl WorkerLocal {
    fn new() -> Self {
        Self {
            foreground: TwoLockQueue::new(),
            background: TwoLockQueue::new(),
            finish: AtomicBool::new(false),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.foreground.len() + self.background.len()
    }

    fn push(&self, task: Task) {
        match task.lane() {
            Lane::Foreground => self.foreground.push(task),
            Lane::Background => self.background.push(task),
        }
    }

    /// Remove one task for a thief, foreground preferred.
    fn steal_one(&self) -> Option<Task> {
        self.foreground
            .try_pop()
            .or_else(|| self.background.try_pop())
    }
}

/// An OS thread executing the fill/drain loop.
pub(crate) struct WorkerThread {
    pub(crate) local: Arc<WorkerLocal>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn the worker thread. The caller registers `local` in the shared
    /// steal registry.
    pub(crate) fn spawn(id: usize, shared: Arc<SchedulerShared>) -> Self {
        let local = Arc::new(WorkerLocal::new());
        let thread_local = Arc::clone(&local);
        let handle = thread::Builder::new()
            .name(format!("taskpool-worker-{id}"))
            .spawn(move || run_loop(&thread_local, &shared))
            .expect("failed to spawn worker thread");
        Self {
            local,
            handle: Some(handle),
        }
    }

    /// Join the OS thread. Must not be called while holding the scheduler's
    /// sleep lock; the worker may need it to exit its sleep state.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.join().expect("failed to join worker thread");
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.local.finish.store(true, Ordering::Release);
        self.join();
    }
}

fn run_loop(local: &Arc<WorkerLocal>, shared: &Arc<SchedulerShared>) {
    loop {
        if local.finish.load(Ordering::Acquire) {
            break;
        }
        fill_with_tasks(local, shared);
        execute_local(local);
    }
    // Whatever landed locally after the finish flag was set still runs;
    // shrinking the pool must not lose tasks.
    execute_local(local);

    #[cfg(debug_assertions)]
    eprintln!(
        "{} shutting down",
        thread::current().name().unwrap_or("taskpool-worker")
    );
}

/// One filling pass: wait list, queue selection, stealing, sleep.
fn fill_with_tasks(local: &Arc<WorkerLocal>, shared: &Arc<SchedulerShared>) {
    // (1) Opportunistic wait-list processing. The exchange gate lets a
    // single worker do this per iteration; skipped work is simply retried
    // on the next loop, never lost.
    if shared
        .wait_list_in_progress
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        shared.wait_list.process(|deferred| deferred.enqueue());
        shared.wait_list_in_progress.store(false, Ordering::Release);
    }

    // (2) Pull a fair share from the selected queue.
    if let Some(queue) = shared.queue_set().select_queue() {
        let share = queue.size() / shared.worker_count().max(1) + 1;
        let moved = queue.pop_tasks_to_worker(
            |task| local.foreground.push(task),
            |task| local.background.push(task),
            share.min(LOCAL_QUEUE_CAPACITY),
        );
        if moved > 0 {
            return;
        }
    }

    // (3) Steal from the most loaded peer. Victims keep at least one task
    // so stealing never starves them outright.
    if steal_into(local, shared) {
        return;
    }

    // (4) Nothing anywhere: sleep until woken or until the fixed timeout
    // forces a re-check of shutdown/resize races.
    let mut sleepers = shared.sleepers.lock();
    if local.finish.load(Ordering::Acquire) {
        return;
    }
    *sleepers += 1;
    shared.wake_cv.wait_for(&mut sleepers, IDLE_SLEEP_INTERVAL);
    *sleepers -= 1;
}

fn steal_into(local: &Arc<WorkerLocal>, shared: &Arc<SchedulerShared>) -> bool {
    let registry = shared.workers.read();
    let mut victim: Option<&Arc<WorkerLocal>> = None;
    let mut victim_len = 1; // must exceed 1 task to be worth robbing
    for candidate in registry.iter() {
        if Arc::ptr_eq(candidate, local) {
            continue;
        }
        let len = candidate.len();
        if len > victim_len {
            victim = Some(candidate);
            victim_len = len;
        }
    }

    if let Some(victim) = victim {
        if let Some(task) = victim.steal_one() {
            local.push(task);
            return true;
        }
    }
    false
}

/// Drain both local lanes to completion, foreground strictly first.
fn execute_local(local: &Arc<WorkerLocal>) {
    loop {
        if let Some(task) = local.foreground.try_pop() {
            task.run();
        } else if let Some(task) = local.background.try_pop() {
            task.run();
        } else {
            break;
        }
    }
}
