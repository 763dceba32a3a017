//! Subscriber types for the reactive system.
//!
//! A Subscriber is one observer registered on a reactive value: a callback
//! that receives every published value, plus an optional invalidation hook
//! that fires as soon as a new value is on its way.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Callback receiving each published value.
pub type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Callback fired when a value has been invalidated but not yet delivered.
pub type Invalidate = Arc<dyn Fn() + Send + Sync>;

/// Unique identifier for a subscriber.
///
/// Each registration gets a fresh ID, so the same callback subscribed twice
/// is tracked (and notified) twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl SubscriberId {
    /// Generate a new unique subscriber ID.
    ///
    /// Uses an atomic counter to ensure uniqueness across threads.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

/// An observer registered on a reactive value.
///
/// Once retired (its subscription dropped), a subscriber ignores any
/// notification still sitting in the publish queue.
pub struct Subscriber<T> {
    id: SubscriberId,
    run: Observer<T>,
    invalidate: Option<Invalidate>,
    live: Arc<AtomicBool>,
}

impl<T> Subscriber<T> {
    /// Create a new subscriber with the given callbacks.
    pub fn new(run: Observer<T>, invalidate: Option<Invalidate>) -> Self {
        Self {
            id: SubscriberId::new(),
            run,
            invalidate,
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Get the subscriber's unique ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Deliver a value.
    pub fn notify(&self, value: &T) {
        if self.is_live() {
            (self.run)(value);
        }
    }

    /// Signal that a new value is coming.
    pub fn invalidate(&self) {
        if !self.is_live() {
            return;
        }
        if let Some(invalidate) = &self.invalidate {
            invalidate();
        }
    }

    /// Stop delivering anything to this subscriber.
    pub fn retire(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    /// Whether the subscriber still receives notifications.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            run: Arc::clone(&self.run),
            invalidate: self.invalidate.clone(),
            live: Arc::clone(&self.live),
        }
    }
}

impl<T> fmt::Debug for Subscriber<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle (or calling [`Subscription::unsubscribe`]) detaches
/// the observer. When it was the last observer of a store with an
/// activation callback, the store's background work stops here.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new<F>(detach: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            detach: Some(Box::new(detach)),
        }
    }

    /// Detach now. Equivalent to dropping the handle.
    pub fn unsubscribe(mut self) {
        self.detach_now();
    }

    fn detach_now(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[test]
    fn subscriber_ids_are_unique() {
        let id1 = SubscriberId::new();
        let id2 = SubscriberId::new();
        let id3 = SubscriberId::new();

        assert_ne!(id1, id2);
        assert_ne!(id2, id3);
        assert_ne!(id1, id3);
    }

    #[test]
    fn retired_subscriber_ignores_notifications() {
        let seen = Arc::new(AtomicI32::new(0));
        let seen_clone = seen.clone();

        let subscriber = Subscriber::new(
            Arc::new(move |v: &i32| {
                seen_clone.store(*v, Ordering::SeqCst);
            }),
            None,
        );

        subscriber.notify(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        subscriber.retire();
        subscriber.notify(&7);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn subscription_detaches_once() {
        let detached = Arc::new(AtomicI32::new(0));
        let detached_clone = detached.clone();

        let subscription = Subscription::new(move || {
            detached_clone.fetch_add(1, Ordering::SeqCst);
        });
        subscription.unsubscribe();

        assert_eq!(detached.load(Ordering::SeqCst), 1);
    }
}
