//! In-process task scheduling for managed runtimes
//!
//! A bounded pool of worker threads executes deferred work items (GC
//! chores, compilation jobs and similar background/foreground units)
//! submitted through up to 32 independently owned, priority-weighted
//! queues. Intra-queue transport is lock-free; the scheduler work-steals
//! between workers; a wait list defers tasks until a deadline or an
//! explicit signal; per-task timing telemetry is optional.
//!
//! # Example
//!
//! ```rust,ignore
//! use taskpool::{StatsMode, TaskPool};
//!
//! let pool = TaskPool::new(4, StatsMode::NoStatistics);
//! let queue = pool.create_task_queue(8)?;
//!
//! queue.add_background_task(|| heavy_work());
//! queue.wait_tasks(); // completion barrier, not just "dequeued"
//!
//! pool.destroy_task_queue(&queue);
//! pool.shutdown();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod queue;

mod error;
mod pool;
mod queue_set;
mod scheduler;
mod selector;
mod stats;
mod task;
mod task_queue;
mod wait_list;
mod worker;

pub use error::TaskPoolError;
pub use pool::TaskPool;
pub use queue_set::MAX_TASK_QUEUE_COUNT;
pub use scheduler::MAX_WORKER_COUNT;
pub use selector::TaskSelector;
pub use stats::{StatsMode, TaskTimeStats, TimeStatsSnapshot};
pub use task::{Lane, Task, TaskRunner};
pub use task_queue::TaskQueue;
pub use wait_list::{WaitList, WaiterId};

/// Lowest selectable queue priority. Priority 0 is rejected by
/// construction, which is what makes weighted selection starvation-prone
/// only by configuration, never by accident.
pub const MIN_QUEUE_PRIORITY: usize = 1;

/// Highest selectable queue priority.
pub const MAX_QUEUE_PRIORITY: usize = 16;
