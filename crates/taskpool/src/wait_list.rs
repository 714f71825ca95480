//! Timed deferral list
//!
//! Holds values until an absolute deadline elapses or until they are
//! explicitly fetched by id ("signal now"). The list is deliberately
//! unsorted: readiness checks are O(n) linear scans, acceptable because the
//! list is expected to stay small.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on entries handed out by one [`WaitList::process`] call,
/// capping lock-hold time.
const PROCESS_BATCH_LIMIT: usize = 128;

/// Identifier of a deferred entry. Ids are unique and strictly increasing
/// for the lifetime of a list; 0 is reserved as invalid.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WaiterId(u64);

impl WaiterId {
    /// The reserved never-assigned id.
    pub const INVALID: WaiterId = WaiterId(0);

    /// Whether this id could have been returned by [`WaitList::add`].
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Numeric value of the id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

struct Entry<T> {
    value: T,
    /// `None` means wait forever (only an explicit fetch releases it).
    deadline: Option<Instant>,
    id: WaiterId,
}

/// Unordered collection of deferred values with per-entry deadlines.
pub struct WaitList<T> {
    entries: Mutex<Vec<Entry<T>>>,
    next_id: AtomicU64,
}

impl<T> WaitList<T> {
    /// Create an empty list.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Defer `value` for `timeout` (forever when `None`), returning the
    /// entry's id.
    pub fn add(&self, value: T, timeout: Option<Duration>) -> WaiterId {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        // A representable `Some` timeout that overflows Instant arithmetic
        // degenerates to "forever", same as an explicit None.
        let id = WaiterId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Entry {
            value,
            deadline,
            id,
        });
        id
    }

    /// Remove and return the first entry whose deadline has elapsed.
    pub fn pop_ready(&self) -> Option<T> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let index = entries
            .iter()
            .position(|e| e.deadline.is_some_and(|d| d <= now))?;
        Some(entries.remove(index).value)
    }

    /// Collect up to 128 elapsed entries under the lock, then invoke
    /// `callback` on each after releasing it, so callbacks may re-enter the
    /// list (or anything that feeds it) without deadlocking.
    ///
    /// Returns the number of entries handed to the callback.
    pub fn process(&self, mut callback: impl FnMut(T)) -> usize {
        let mut ready = Vec::new();
        {
            let now = Instant::now();
            let mut entries = self.entries.lock();
            let mut index = 0;
            while index < entries.len() && ready.len() < PROCESS_BATCH_LIMIT {
                if entries[index].deadline.is_some_and(|d| d <= now) {
                    ready.push(entries.remove(index).value);
                } else {
                    index += 1;
                }
            }
        }
        let count = ready.len();
        for value in ready {
            callback(value);
        }
        count
    }

    /// Whether any entry's deadline has elapsed. Lock-held peek.
    pub fn has_ready(&self) -> bool {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .any(|e| e.deadline.is_some_and(|d| d <= now))
    }

    /// Remove and return the entry with `id` immediately, bypassing its
    /// deadline. This is the mechanism behind "signal now".
    pub fn take(&self, id: WaiterId) -> Option<T> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|e| e.id == id)?;
        Some(entries.remove(index).value)
    }

    /// Number of deferred entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the list holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Drop every remaining entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl<T> Default for WaitList<T> {
    fn default() -> Self {
        Self::new()
    }
}
