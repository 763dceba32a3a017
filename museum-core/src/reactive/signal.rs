//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive: the Reactive Value Cell
//! every store in this crate is built on. It holds a value and a list of
//! observers.
//!
//! # How Signals Work
//!
//! 1. `subscribe` registers an observer and immediately calls it with the
//!    current value. It returns a [`Subscription`] guard.
//!
//! 2. `set` replaces the value and notifies every observer, in subscription
//!    order, exactly once per published value.
//!
//! 3. A signal built with [`Signal::with_activation`] runs its activation
//!    callback when the first observer arrives and the returned
//!    [`Deactivate`] callback when the last observer leaves. Stores use this
//!    to start and stop background work (timers, upstream subscriptions).
//!
//! # Thread Safety
//!
//! Signals are `Send + Sync`. The value sits behind a `RwLock`, observers
//! behind a `Mutex`. No lock is held while observers run, so an observer may
//! freely subscribe, unsubscribe or set other signals.
//!
//! # Memory Layout
//!
//! Each signal consists of:
//! - A unique ID (8 bytes)
//! - The value (stored behind Arc, shared by clones of the signal)
//! - An insertion-ordered map of subscribers

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::batch;
use super::subscriber::{Invalidate, Observer, Subscriber, SubscriberId, Subscription};

/// Counter for generating unique signal IDs.
static SIGNAL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a new unique signal ID.
fn next_signal_id() -> u64 {
    SIGNAL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Stops whatever an activation callback started.
pub type Deactivate = Box<dyn FnOnce() + Send>;

type Activate<T> = Box<dyn Fn(Setter<T>) -> Deactivate + Send + Sync>;

/// Anything that holds a current value and publishes changes to observers.
///
/// Implemented by [`Signal`], [`Derived`](super::Derived) and every store in
/// this crate.
pub trait Readable: Send + Sync + 'static {
    /// The published value type.
    type Value: Clone + Send + Sync + 'static;

    /// Current value. A lazily activated store is activated for the
    /// duration of the read.
    fn get(&self) -> Self::Value;

    /// Last stored value, never activating anything.
    fn peek(&self) -> Self::Value;

    /// Register an observer with an optional invalidation hook.
    fn subscribe_with(
        &self,
        run: Observer<Self::Value>,
        invalidate: Option<Invalidate>,
    ) -> Subscription;

    /// Register an observer. It is called immediately with the current
    /// value, then with every published value until the returned
    /// subscription is dropped.
    fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Self::Value) + Send + Sync + 'static,
        Self: Sized,
    {
        self.subscribe_with(Arc::new(observer), None)
    }
}

impl<R> Readable for Arc<R>
where
    R: Readable + ?Sized,
{
    type Value = R::Value;

    fn get(&self) -> Self::Value {
        (**self).get()
    }

    fn peek(&self) -> Self::Value {
        (**self).peek()
    }

    fn subscribe_with(
        &self,
        run: Observer<Self::Value>,
        invalidate: Option<Invalidate>,
    ) -> Subscription {
        (**self).subscribe_with(run, invalidate)
    }
}

/// Activation state of a signal.
enum Lifecycle {
    /// No observers.
    Idle,
    /// First observer arrived; the activation callback is running.
    Starting,
    /// Activated. Holds the callback that undoes the activation.
    Active(Option<Deactivate>),
}

struct SignalInner<T> {
    id: u64,
    value: RwLock<T>,
    subscribers: Mutex<IndexMap<SubscriberId, Subscriber<T>>>,
    activate: Option<Activate<T>>,
    lifecycle: Mutex<Lifecycle>,
}

impl<T> SignalInner<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn replace(&self, value: T) {
        *self.value.write() = value;
        self.publish();
    }

    fn modify<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        {
            let mut guard = self.value.write();
            let next = f(&guard);
            *guard = next;
        }
        self.publish();
    }

    /// Store and publish `value` unless it equals the current value.
    fn replace_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        {
            let mut guard = self.value.write();
            if *guard == value {
                return false;
            }
            *guard = value;
        }
        self.publish();
        true
    }

    /// Notify every observer of the current value.
    fn publish(&self) {
        // While the activation callback runs, values are only stored: the
        // new observer reads the final value once activation returns.
        if self.activate.is_some() && !matches!(*self.lifecycle.lock(), Lifecycle::Active(_)) {
            return;
        }

        let subscribers: Vec<Subscriber<T>> = self.subscribers.lock().values().cloned().collect();
        if subscribers.is_empty() {
            return;
        }

        let value = Arc::new(self.value.read().clone());
        for subscriber in &subscribers {
            subscriber.invalidate();
        }
        for subscriber in subscribers {
            let value = Arc::clone(&value);
            batch::enqueue(Box::new(move || subscriber.notify(&value)));
        }
        batch::flush();
    }

    fn start(self: &Arc<Self>) {
        let Some(activate) = &self.activate else {
            return;
        };
        *self.lifecycle.lock() = Lifecycle::Starting;
        trace!(signal = self.id, "activating");
        let deactivate = activate(Setter {
            inner: Arc::downgrade(self),
        });
        *self.lifecycle.lock() = Lifecycle::Active(Some(deactivate));
    }

    fn stop(&self) {
        let deactivate = {
            let mut lifecycle = self.lifecycle.lock();
            match std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
                Lifecycle::Active(deactivate) => deactivate,
                _ => None,
            }
        };
        if let Some(deactivate) = deactivate {
            trace!(signal = self.id, "deactivating");
            deactivate();
        }
    }

    fn remove(&self, id: SubscriberId) {
        let now_empty = {
            let mut subscribers = self.subscribers.lock();
            subscribers.shift_remove(&id).is_some() && subscribers.is_empty()
        };
        if now_empty && self.activate.is_some() {
            self.stop();
        }
    }
}

/// A reactive signal holding a value of type T.
///
/// # Type Parameters
///
/// - `T`: The type of value stored in the signal. Must be Clone + Send + Sync.
///
/// # Example
///
/// ```rust,ignore
/// let count = Signal::new(0);
///
/// let _sub = count.subscribe(|v| println!("count = {v}"));  // prints 0
/// count.set(5);                                             // prints 5
/// ```
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(value: T) -> Self {
        Self::build(value, None)
    }

    /// Create a signal whose `activate` callback runs when the first
    /// observer subscribes. The callback gets a [`Setter`] and returns the
    /// callback to run when the last observer unsubscribes.
    pub fn with_activation<F>(value: T, activate: F) -> Self
    where
        F: Fn(Setter<T>) -> Deactivate + Send + Sync + 'static,
    {
        Self::build(value, Some(Box::new(activate)))
    }

    fn build(value: T, activate: Option<Activate<T>>) -> Self {
        Self {
            inner: Arc::new(SignalInner {
                id: next_signal_id(),
                value: RwLock::new(value),
                subscribers: Mutex::new(IndexMap::new()),
                activate,
                lifecycle: Mutex::new(Lifecycle::Idle),
            }),
        }
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Get the current value.
    ///
    /// If the signal has an activation callback and no observers, it is
    /// activated for the duration of the read.
    pub fn get(&self) -> T {
        if self.inner.activate.is_some() && !self.is_active() {
            let reader = self.subscribe_with(Arc::new(|_: &T| {}), None);
            let value = self.get_untracked();
            drop(reader);
            return value;
        }
        self.get_untracked()
    }

    /// Get the stored value without activating anything.
    pub fn get_untracked(&self) -> T {
        self.inner.value.read().clone()
    }

    /// Set a new value and notify subscribers.
    pub fn set(&self, value: T) {
        self.inner.replace(value);
    }

    /// Set a new value, notifying subscribers only if it differs from the
    /// current one. Returns whether it was published.
    pub fn set_if_changed(&self, value: T) -> bool
    where
        T: PartialEq,
    {
        self.inner.replace_if_changed(value)
    }

    /// Update the value using a function.
    ///
    /// The read and the write happen under one lock, so concurrent updates
    /// never lose each other's changes.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        self.inner.modify(f);
    }

    /// A weak write handle to this signal.
    pub fn setter(&self) -> Setter<T> {
        Setter {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register an observer with an optional invalidation hook.
    pub fn subscribe_with(&self, run: Observer<T>, invalidate: Option<Invalidate>) -> Subscription {
        let subscriber = Subscriber::new(run, invalidate);
        let id = subscriber.id();

        let first = {
            let mut subscribers = self.inner.subscribers.lock();
            subscribers.insert(id, subscriber.clone());
            subscribers.len() == 1
        };
        if first {
            self.inner.start();
        }

        subscriber.notify(&self.get_untracked());

        let weak: Weak<SignalInner<T>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            subscriber.retire();
            if let Some(inner) = weak.upgrade() {
                inner.remove(id);
            }
        })
    }

    /// Register an observer.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.subscribe_with(Arc::new(observer), None)
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }

    /// Whether at least one observer is subscribed.
    pub fn is_active(&self) -> bool {
        self.subscriber_count() > 0
    }
}

impl<T> Readable for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn get(&self) -> T {
        Signal::get(self)
    }

    fn peek(&self) -> T {
        self.get_untracked()
    }

    fn subscribe_with(&self, run: Observer<T>, invalidate: Option<Invalidate>) -> Subscription {
        Signal::subscribe_with(self, run, invalidate)
    }
}

impl<T> Clone for Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &self.get_untracked())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Weak write handle handed to activation callbacks and async computations.
///
/// Holding a setter does not keep the signal alive; setting through a
/// setter whose signal is gone does nothing.
pub struct Setter<T> {
    inner: Weak<SignalInner<T>>,
}

impl<T> Setter<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Publish a new value.
    pub fn set(&self, value: T) {
        if let Some(inner) = self.inner.upgrade() {
            inner.replace(value);
        }
    }

    /// Publish a new value only if it differs from the current one.
    pub fn set_if_changed(&self, value: T)
    where
        T: PartialEq,
    {
        if let Some(inner) = self.inner.upgrade() {
            inner.replace_if_changed(value);
        }
    }

    /// Publish a value derived from the current one.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&T) -> T,
    {
        if let Some(inner) = self.inner.upgrade() {
            inner.modify(f);
        }
    }

    /// Whether the target signal still exists.
    pub fn is_connected(&self) -> bool {
        self.inner.strong_count() > 0
    }
}

impl<T> Clone for Setter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
