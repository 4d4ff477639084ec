//! Scheduled timers.
//!
//! Modeled per the design note in the specification this crate implements:
//! a cancellation handle must never carry a raw index into the timer list,
//! since deleting an earlier entry would shift every index after it. Instead
//! each scheduled timer carries a small shared "cancelled" flag; the handle
//! holds a clone of it. Cancelling just flips the flag — cheap, idempotent,
//! and safe to call from inside the very callback it cancels (the reactor
//! has already popped the entry out of the list by the time the callback
//! runs, so setting the flag at that point affects nothing).

use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

/// A cancellation handle for a timer scheduled with [`crate::reactor::Reactor::schedule`].
///
/// `delete()` is idempotent: calling it twice, or calling it from within the
/// timer's own callback, is a no-op either way.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    pub(super) cancelled: Rc<Cell<bool>>,
}

impl CancelHandle {
    /// Cancels the timer. If it has already fired or already been
    /// cancelled, this does nothing.
    pub fn delete(&self) {
        self.cancelled.set(true);
    }

    /// True if the timer has been cancelled (including by already firing,
    /// since fired one-shot entries are marked cancelled too to simplify
    /// bookkeeping for any handle clones still held by the caller).
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

pub(super) struct TimerEntry {
    pub(super) deadline: Instant,
    pub(super) cancelled: Rc<Cell<bool>>,
    pub(super) callback: Box<dyn FnMut()>,
}

impl std::fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerEntry")
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancelled.get())
            .finish()
    }
}

/// Inserts `entry` into `timers`, which must already be sorted ascending by
/// deadline, keeping the ordering (binary insertion, per spec §4.2).
pub(super) fn insert_sorted(timers: &mut Vec<TimerEntry>, entry: TimerEntry) {
    let idx = timers
        .binary_search_by(|t| t.deadline.cmp(&entry.deadline))
        .unwrap_or_else(|i| i);
    timers.insert(idx, entry);
}
