//! Publish Queue
//!
//! Every `Signal::set` goes through a per-thread publish queue. Setting a
//! value runs the invalidation hook of each observer right away and queues
//! the actual value notifications. The queue is drained once nothing is
//! holding it open.
//!
//! # Why a Queue
//!
//! Two things hold the queue open:
//!
//! 1. A flush already in progress. An observer that sets another signal
//!    appends to the queue instead of recursing, so observers always run in
//!    the order the values were published.
//!
//! 2. An explicit [`batch`]. Every set inside the closure invalidates
//!    immediately but delivers only after the closure returns. Derived
//!    stores rely on this: all of their sources are marked pending before
//!    any of them reports, so they recompute once per batch.
//!
//! # Implementation
//!
//! We use a thread-local queue, like a reactive context stack. Callbacks are
//! popped one at a time so the `RefCell` borrow is never held while user
//! code runs.

use std::cell::RefCell;
use std::collections::VecDeque;

type Job = Box<dyn FnOnce()>;

thread_local! {
    static QUEUE: RefCell<PublishQueue> = RefCell::new(PublishQueue::default());
}

#[derive(Default)]
struct PublishQueue {
    /// Number of open `batch` scopes.
    depth: usize,
    /// Whether a flush loop is running on this thread.
    flushing: bool,
    jobs: VecDeque<Job>,
}

/// Queue a notification.
pub(crate) fn enqueue(job: Job) {
    QUEUE.with(|queue| queue.borrow_mut().jobs.push_back(job));
}

/// Drain the queue unless a batch or an outer flush owns it.
pub(crate) fn flush() {
    let owner = QUEUE.with(|queue| {
        let mut queue = queue.borrow_mut();
        if queue.depth > 0 || queue.flushing {
            false
        } else {
            queue.flushing = true;
            true
        }
    });
    if !owner {
        return;
    }

    let _guard = FlushGuard;
    loop {
        let job = QUEUE.with(|queue| queue.borrow_mut().jobs.pop_front());
        match job {
            Some(job) => job(),
            None => break,
        }
    }
}

/// Resets the flushing flag, even if an observer panics.
struct FlushGuard;

impl Drop for FlushGuard {
    fn drop(&mut self) {
        QUEUE.with(|queue| {
            let mut queue = queue.borrow_mut();
            queue.flushing = false;
            if std::thread::panicking() {
                queue.jobs.clear();
            }
        });
    }
}

/// Guard for an open batch. Closing the outermost batch flushes the queue.
pub struct BatchScope {
    _private: (),
}

impl BatchScope {
    /// Open a batch scope. Prefer [`batch`] unless the scope must outlive a
    /// single closure.
    pub fn open() -> Self {
        QUEUE.with(|queue| queue.borrow_mut().depth += 1);
        Self { _private: () }
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        let panicking = std::thread::panicking();
        QUEUE.with(|queue| {
            let mut queue = queue.borrow_mut();
            queue.depth = queue.depth.saturating_sub(1);
            if panicking && queue.depth == 0 {
                queue.jobs.clear();
            }
        });
        if !panicking {
            flush();
        }
    }
}

/// Run `f` as one logical update.
///
/// Observers of every signal set inside `f` are invalidated immediately and
/// receive their values once `f` returns.
///
/// ```rust,ignore
/// batch(|| {
///     width.set(10);
///     height.set(20);
/// });
/// // a Derived over (width, height) recomputed exactly once
/// ```
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    let _scope = BatchScope::open();
    f()
}

/// Whether the current thread is inside a [`batch`].
pub fn is_batching() -> bool {
    QUEUE.with(|queue| queue.borrow().depth > 0)
}
