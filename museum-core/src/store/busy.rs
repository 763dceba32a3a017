//! Busy Counter
//!
//! Counts in-flight operations and exposes `count > 0` as a reactive
//! boolean for the loading indicator.

use std::fmt;

use crate::reactive::{map_distinct, Derived, Invalidate, Observer, Readable, Signal, Subscription};

/// Shared counter of in-flight operations. Clones share the count.
#[derive(Clone)]
pub struct BusyCounter {
    count: Signal<usize>,
    busy: Derived<bool>,
}

impl BusyCounter {
    /// A counter at zero.
    pub fn new() -> Self {
        let count = Signal::new(0usize);
        let busy = map_distinct(count.clone(), |count| *count > 0);
        Self { count, busy }
    }

    /// One more operation in flight.
    pub fn start(&self) {
        self.count.update(|count| count + 1);
    }

    /// One operation finished. Never goes below zero.
    pub fn stop(&self) {
        self.count.update(|count| count.saturating_sub(1));
    }

    /// Start an operation that stops when the guard is dropped, including
    /// on early return or error.
    pub fn guard(&self) -> BusyGuard {
        self.start();
        BusyGuard {
            counter: self.clone(),
        }
    }

    /// Current number of operations.
    pub fn count(&self) -> usize {
        self.count.get_untracked()
    }

    /// Reactive `count > 0`. Publishes only when the flag flips.
    pub fn is_busy(&self) -> Derived<bool> {
        self.busy.clone()
    }
}

impl Default for BusyCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl Readable for BusyCounter {
    type Value = usize;

    fn get(&self) -> usize {
        self.count.get()
    }

    fn peek(&self) -> usize {
        self.count.get_untracked()
    }

    fn subscribe_with(&self, run: Observer<usize>, invalidate: Option<Invalidate>) -> Subscription {
        self.count.subscribe_with(run, invalidate)
    }
}

impl fmt::Debug for BusyCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyCounter")
            .field("count", &self.count())
            .finish()
    }
}

/// Keeps the counter raised until dropped.
#[must_use = "the operation stops as soon as the guard is dropped"]
pub struct BusyGuard {
    counter: BusyCounter,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.counter.stop();
    }
}

impl fmt::Debug for BusyGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusyGuard").finish_non_exhaustive()
    }
}
