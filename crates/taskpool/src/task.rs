//! Task: one schedulable unit of work
//!
//! A task owns a boxed closure plus lifecycle bookkeeping. Its owning
//! queue's live counter is incremented exactly once before the task is
//! constructed and decremented exactly once when the task is dropped,
//! whether or not the closure ever ran. That pairing is what makes the
//! queue's wait barriers true completion barriers.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::task_queue::QueueCore;

/// The two sub-queues of a task queue. Foreground drains strictly before
/// background everywhere both are drained together.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Lane {
    /// High-urgency lane.
    Foreground,
    /// Deferred-urgency lane.
    Background,
}

/// Type of the closures submitted to a queue.
pub type TaskRunner = Box<dyn FnOnce() + Send + 'static>;

/// One schedulable unit: a closure bound to a lane of a queue.
pub struct Task {
    runner: Option<TaskRunner>,
    lane: Lane,
    core: Arc<QueueCore>,
    enqueued_at: Option<Instant>,
}

impl Task {
    /// Wrap `runner` for `lane`. The caller must already have incremented
    /// the lane's live counter via [`QueueCore::on_task_created`].
    pub(crate) fn new(runner: TaskRunner, lane: Lane, core: Arc<QueueCore>) -> Self {
        let enqueued_at = core.stats().map(|_| Instant::now());
        Self {
            runner: Some(runner),
            lane,
            core,
            enqueued_at,
        }
    }

    /// Lane this task was submitted to.
    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Execute the closure. Consumes the task; the live-counter decrement
    /// happens when the task is dropped right after.
    ///
    /// An invalidated task is a no-op (asserted against in debug builds).
    pub fn run(mut self) {
        debug_assert!(!self.is_invalid(), "running an invalidated task");
        if let Some(runner) = self.runner.take() {
            let started = Instant::now();
            runner();
            if let (Some(stats), Some(enqueued)) = (self.core.stats(), self.enqueued_at) {
                let finished = Instant::now();
                stats.record(finished - enqueued, finished - started);
            }
        }
    }

    /// Drop the closure so a later [`run`](Self::run) becomes a no-op.
    pub fn make_invalid(&mut self) {
        self.runner = None;
    }

    /// Whether [`make_invalid`](Self::make_invalid) was called.
    pub fn is_invalid(&self) -> bool {
        self.runner.is_none()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("lane", &self.lane)
            .field("invalid", &self.is_invalid())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.core.on_task_destroyed(self.lane);
    }
}
