//! Error type for the few recoverable failures
//!
//! The pool favors fail-fast assertions over recoverable errors; only the
//! conditions a caller can reasonably hit at runtime surface as `Err`.

use crate::queue_set::MAX_TASK_QUEUE_COUNT;

/// Recoverable failures of the task pool API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskPoolError {
    /// All queue registry slots are occupied.
    #[error("task queue registry is full ({MAX_TASK_QUEUE_COUNT} slots)")]
    RegistryFull,

    /// Queue priority outside the valid range.
    #[error("queue priority {0} outside valid range {min}..={max}",
        min = crate::MIN_QUEUE_PRIORITY, max = crate::MAX_QUEUE_PRIORITY)]
    InvalidPriority(usize),

    /// The pool has already been shut down.
    #[error("task pool has been shut down")]
    ShutDown,
}
