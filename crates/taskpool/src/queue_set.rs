//! Fixed-capacity registry of active task queues
//!
//! Slots are claimed with a per-slot compare-and-swap so registration never
//! blocks selection; queue handles are reference-counted, which is what
//! keeps a queue object alive while a scheduler thread still holds it (the
//! memory-safe stand-in for the original deferred-deletion scheme).

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::TaskPoolError;
use crate::stats::StatsMode;
use crate::task_queue::{DeferredTask, TaskQueue, WakeCallback};
use crate::wait_list::WaitList;
use crate::{MAX_QUEUE_PRIORITY, MIN_QUEUE_PRIORITY};

/// Maximum number of simultaneously registered queues.
pub const MAX_TASK_QUEUE_COUNT: usize = 32;

struct Slot {
    /// CAS-claimed before the handle is installed, released after the
    /// handle is cleared, so claiming never races a selection read.
    claimed: AtomicBool,
    queue: RwLock<Option<Arc<TaskQueue>>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            queue: RwLock::new(None),
        }
    }
}

/// Registry of up to [`MAX_TASK_QUEUE_COUNT`] queues plus the weighted
/// round-robin selection state.
pub struct TaskQueueSet {
    slots: [Slot; MAX_TASK_QUEUE_COUNT],
    selection_counter: AtomicU64,
    wait_list: Arc<WaitList<DeferredTask>>,
    wake_workers: WakeCallback,
    stats_mode: StatsMode,
}

impl TaskQueueSet {
    pub(crate) fn new(
        wait_list: Arc<WaitList<DeferredTask>>,
        wake_workers: WakeCallback,
        stats_mode: StatsMode,
    ) -> Self {
        Self {
            slots: std::array::from_fn(|_| Slot::new()),
            selection_counter: AtomicU64::new(0),
            wait_list,
            wake_workers,
            stats_mode,
        }
    }

    /// Claim a free slot and register a new queue with `priority`.
    ///
    /// Fails with [`TaskPoolError::RegistryFull`] when all slots are
    /// occupied, the one deterministic recoverable error of the pool.
    pub fn create_queue(&self, priority: usize) -> Result<Arc<TaskQueue>, TaskPoolError> {
        if !(MIN_QUEUE_PRIORITY..=MAX_QUEUE_PRIORITY).contains(&priority) {
            return Err(TaskPoolError::InvalidPriority(priority));
        }
        for (id, slot) in self.slots.iter().enumerate() {
            if slot
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let queue = Arc::new(TaskQueue::new(
                    priority,
                    self.stats_mode,
                    Arc::clone(&self.wait_list),
                ));
                queue.assign_id(id);
                queue.install_wake_callback(Arc::clone(&self.wake_workers));
                *slot.queue.write() = Some(Arc::clone(&queue));
                return Ok(queue);
            }
        }
        Err(TaskPoolError::RegistryFull)
    }

    /// Drain `queue` in the calling thread (running its tasks), wait until
    /// tasks already popped by workers are destroyed, then release the slot.
    ///
    /// Callers must have signalled or let elapse any wait-list entries of
    /// this queue first; the completion barrier blocks until every live
    /// task is gone.
    pub fn delete_queue(&self, queue: &Arc<TaskQueue>) {
        while queue.execute_task() {}
        queue.wait_tasks();

        let id = queue.id().expect("deleting an unregistered queue");
        let slot = &self.slots[id];
        *slot.queue.write() = None;
        slot.claimed.store(false, Ordering::Release);
    }

    /// Weighted round robin over the non-empty queues: the priorities of
    /// all candidates are summed, a monotonic counter advances modulo that
    /// sum, and a linear scan finds the owner of the resulting ticket.
    /// Long-run selection frequency is proportional to priority without
    /// per-call randomness or allocation beyond the snapshot.
    pub fn select_queue(&self) -> Option<Arc<TaskQueue>> {
        let mut snapshot: [Option<(Arc<TaskQueue>, usize)>; MAX_TASK_QUEUE_COUNT] =
            std::array::from_fn(|_| None);
        let mut total = 0usize;

        for (entry, slot) in snapshot.iter_mut().zip(&self.slots) {
            let guard = slot.queue.read();
            if let Some(queue) = guard.as_ref() {
                if !queue.is_empty() {
                    let priority = queue.priority();
                    total += priority;
                    *entry = Some((Arc::clone(queue), priority));
                }
            }
        }

        if total == 0 {
            return None;
        }

        let ticket = self.selection_counter.fetch_add(1, Ordering::Relaxed) % total as u64;
        let mut remaining = ticket as usize;
        for entry in snapshot.into_iter().flatten() {
            let (queue, priority) = entry;
            if remaining < priority {
                return Some(queue);
            }
            remaining -= priority;
        }
        None
    }

    /// Snapshot of every registered queue.
    pub fn queues(&self) -> Vec<Arc<TaskQueue>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.queue.read().clone())
            .collect()
    }

    /// Whether every registered queue has empty lanes.
    pub fn queues_empty(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.queue.read().as_ref().is_none_or(|q| q.is_empty()))
    }

    /// Live tasks aggregated across every registered queue.
    pub fn live_task_count(&self) -> usize {
        self.slots
            .iter()
            .filter_map(|slot| slot.queue.read().as_ref().map(|q| q.live_task_count()))
            .sum()
    }
}
