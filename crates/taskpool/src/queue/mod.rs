//! Lock-free intra-queue transport primitives
//!
//! - [`SpscQueue`]: single producer, single consumer, immediate node reuse
//! - [`SpmcQueue`]: single producer, many consumers, epoch-reclaimed nodes
//! - [`TwoLockQueue`]: SPSC core behind per-role mutexes for MPMC use

mod spmc;
mod spsc;
mod two_lock;

pub use spmc::{ConsumerId, SpmcQueue, MAX_CONSUMER_COUNT};
pub use spsc::SpscQueue;
pub use two_lock::TwoLockQueue;
