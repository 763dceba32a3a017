//! Derived Implementation
//!
//! A Derived store combines one or more upstream sources into one value.
//!
//! # How Derived Stores Work
//!
//! 1. While nobody observes it, a derived store holds no upstream
//!    subscriptions.
//!
//! 2. The first observer subscribes it to every source. Each source
//!    subscription carries two callbacks: an invalidation hook that sets
//!    the source's bit in a `pending` mask, and a value callback that stores
//!    the new value and clears the bit.
//!
//! 3. The combining function runs only when the mask is zero. When several
//!    sources change inside one [`batch`](super::batch), every bit is set
//!    before any value arrives, so the function runs once, with every
//!    source's latest value.
//!
//! 4. The last observer leaving drops every upstream subscription.
//!
//! # Sync and Async
//!
//! [`Derived::new`] publishes the function's return value immediately.
//! [`Derived::new_async`] hands the function a [`Setter`] instead, so it can
//! publish later (after a fetch, say) or not at all.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use super::signal::{Readable, Setter, Signal};
use super::subscriber::{Invalidate, Observer, Subscription};

/// Upper bound on the number of sources (one bit each in the pending mask).
pub const MAX_SOURCES: usize = 64;

/// Subscriptions a derived store holds on its sources.
pub type SourceSubscriptions = SmallVec<[Subscription; 4]>;

/// Writes one source's new value into the combined values.
pub type Apply<V> = Box<dyn FnOnce(&mut V) + Send>;

/// Receives per-source notifications from a [`Sources`] set.
pub trait SourceSink<V>: Send + Sync {
    /// Source `index` has a new value on its way.
    fn invalidate(&self, index: usize);

    /// Source `index` published; `apply` stores the value.
    fn report(&self, index: usize, apply: Apply<V>);
}

/// A fixed set of upstream sources.
///
/// Implemented for tuples of up to four [`Readable`]s (heterogeneous value
/// types) and for `Vec<R>` (any number of sources of one type).
pub trait Sources: Send + Sync + 'static {
    /// The combined values handed to the combining function.
    type Values: Clone + Send + Sync + 'static;

    /// Number of sources.
    fn count(&self) -> usize;

    /// Current value of every source, without activating any of them.
    fn peek_all(&self) -> Self::Values;

    /// Subscribe to every source, forwarding notifications to `sink`.
    fn watch(&self, sink: Arc<dyn SourceSink<Self::Values>>) -> SourceSubscriptions;
}

fn watch_one<R, V>(
    source: &R,
    index: usize,
    sink: &Arc<dyn SourceSink<V>>,
    store: fn(&mut V, R::Value, usize),
) -> Subscription
where
    R: Readable,
    V: 'static,
{
    let on_value = Arc::clone(sink);
    let on_invalidate = Arc::clone(sink);
    let run: Observer<R::Value> = Arc::new(move |value: &R::Value| {
        let value = value.clone();
        on_value.report(index, Box::new(move |values: &mut V| store(values, value, index)));
    });
    let invalidate: Invalidate = Arc::new(move || on_invalidate.invalidate(index));
    source.subscribe_with(run, Some(invalidate))
}

macro_rules! impl_sources_for_tuple {
    ($($source:ident $idx:tt),+) => {
        impl<$($source),+> Sources for ($($source,)+)
        where
            $($source: Readable),+
        {
            type Values = ($($source::Value,)+);

            fn count(&self) -> usize {
                [$($idx),+].len()
            }

            fn peek_all(&self) -> Self::Values {
                ($(self.$idx.peek(),)+)
            }

            fn watch(&self, sink: Arc<dyn SourceSink<Self::Values>>) -> SourceSubscriptions {
                let mut subscriptions = SourceSubscriptions::new();
                $(
                    subscriptions.push(watch_one(
                        &self.$idx,
                        $idx,
                        &sink,
                        |values: &mut Self::Values, value, _| values.$idx = value,
                    ));
                )+
                subscriptions
            }
        }
    };
}

impl_sources_for_tuple!(A 0);
impl_sources_for_tuple!(A 0, B 1);
impl_sources_for_tuple!(A 0, B 1, C 2);
impl_sources_for_tuple!(A 0, B 1, C 2, D 3);

impl<R> Sources for Vec<R>
where
    R: Readable,
{
    type Values = Vec<R::Value>;

    fn count(&self) -> usize {
        self.len()
    }

    fn peek_all(&self) -> Self::Values {
        self.iter().map(Readable::peek).collect()
    }

    fn watch(&self, sink: Arc<dyn SourceSink<Self::Values>>) -> SourceSubscriptions {
        self.iter()
            .enumerate()
            .map(|(index, source)| {
                watch_one(source, index, &sink, |values: &mut Vec<R::Value>, value, index| {
                    values[index] = value;
                })
            })
            .collect()
    }
}

type Combine<V, T> = dyn Fn(&V, Setter<T>) + Send + Sync;

/// Live link between an active derived store and its sources.
struct SourceLink<V, T>
where
    T: Clone + Send + Sync + 'static,
{
    values: Mutex<V>,
    /// Bit `i` set: source `i` invalidated but not yet reported.
    pending: AtomicU64,
    /// False while the initial subscriptions are being made.
    ready: AtomicBool,
    combine: Arc<Combine<V, T>>,
    setter: Setter<T>,
}

impl<V, T> SourceLink<V, T>
where
    V: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn sync(&self) {
        if !self.ready.load(Ordering::SeqCst) || self.pending.load(Ordering::SeqCst) != 0 {
            return;
        }
        let values = self.values.lock().clone();
        (self.combine)(&values, self.setter.clone());
    }
}

impl<V, T> SourceSink<V> for SourceLink<V, T>
where
    V: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn invalidate(&self, index: usize) {
        self.pending.fetch_or(1 << index, Ordering::SeqCst);
    }

    fn report(&self, index: usize, apply: Apply<V>) {
        apply(&mut self.values.lock());
        self.pending.fetch_and(!(1 << index), Ordering::SeqCst);
        self.sync();
    }
}

/// A value derived from one or more sources.
///
/// # Example
///
/// ```rust,ignore
/// let width = Signal::new(2);
/// let height = Signal::new(3);
/// let area = Derived::new((width.clone(), height.clone()), |(w, h)| w * h);
///
/// assert_eq!(area.get(), 6);
/// ```
pub struct Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    signal: Signal<T>,
}

impl<T> Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Synchronous combinator: republishes `f(latest values)` whenever any
    /// source changes.
    ///
    /// The initial value is computed from the sources' current values.
    ///
    /// # Panics
    ///
    /// Panics if `sources` holds more than [`MAX_SOURCES`] sources.
    pub fn new<S, F>(sources: S, f: F) -> Self
    where
        S: Sources,
        F: Fn(&S::Values) -> T + Send + Sync + 'static,
    {
        let initial = f(&sources.peek_all());
        Self::build(sources, initial, move |values: &S::Values, setter: Setter<T>| {
            setter.set(f(values));
        })
    }

    /// Like [`Derived::new`], but a recomputed value equal to the current one
    /// is not republished.
    ///
    /// # Panics
    ///
    /// Panics if `sources` holds more than [`MAX_SOURCES`] sources.
    pub fn new_distinct<S, F>(sources: S, f: F) -> Self
    where
        S: Sources,
        T: PartialEq,
        F: Fn(&S::Values) -> T + Send + Sync + 'static,
    {
        let initial = f(&sources.peek_all());
        Self::build(sources, initial, move |values: &S::Values, setter: Setter<T>| {
            setter.set_if_changed(f(values));
        })
    }

    /// Asynchronous combinator: `f` receives the latest values and a setter
    /// it may use now, later, or never.
    ///
    /// # Panics
    ///
    /// Panics if `sources` holds more than [`MAX_SOURCES`] sources.
    pub fn new_async<S, F>(sources: S, initial: T, f: F) -> Self
    where
        S: Sources,
        F: Fn(&S::Values, Setter<T>) + Send + Sync + 'static,
    {
        Self::build(sources, initial, f)
    }

    fn build<S, F>(sources: S, initial: T, combine: F) -> Self
    where
        S: Sources,
        F: Fn(&S::Values, Setter<T>) + Send + Sync + 'static,
    {
        assert!(
            sources.count() <= MAX_SOURCES,
            "a derived store supports at most {MAX_SOURCES} sources, got {}",
            sources.count()
        );

        let sources = Arc::new(sources);
        let combine: Arc<Combine<S::Values, T>> = Arc::new(combine);

        let signal = Signal::with_activation(initial, move |setter| {
            let link = Arc::new(SourceLink {
                values: Mutex::new(sources.peek_all()),
                pending: AtomicU64::new(0),
                ready: AtomicBool::new(false),
                combine: Arc::clone(&combine),
                setter,
            });
            let subscriptions = sources.watch(link.clone());
            link.ready.store(true, Ordering::SeqCst);
            link.sync();
            Box::new(move || drop(subscriptions))
        });

        Self { signal }
    }

    /// Get the current value, activating the store for the read if needed.
    pub fn get(&self) -> T {
        self.signal.get()
    }

    /// Register an observer.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.signal.subscribe(observer)
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.signal.subscriber_count()
    }
}

impl<T> Readable for Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    type Value = T;

    fn get(&self) -> T {
        self.signal.get()
    }

    fn peek(&self) -> T {
        self.signal.get_untracked()
    }

    fn subscribe_with(&self, run: Observer<T>, invalidate: Option<Invalidate>) -> Subscription {
        self.signal.subscribe_with(run, invalidate)
    }
}

impl<T> Clone for Derived<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T> Debug for Derived<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("value", &self.signal.get_untracked())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Single-source shorthand for [`Derived::new`].
pub fn map<R, T, F>(source: R, f: F) -> Derived<T>
where
    R: Readable,
    T: Clone + Send + Sync + 'static,
    F: Fn(&R::Value) -> T + Send + Sync + 'static,
{
    Derived::new((source,), move |(value,)| f(value))
}

/// Single-source shorthand for [`Derived::new_distinct`].
pub fn map_distinct<R, T, F>(source: R, f: F) -> Derived<T>
where
    R: Readable,
    T: Clone + PartialEq + Send + Sync + 'static,
    F: Fn(&R::Value) -> T + Send + Sync + 'static,
{
    Derived::new_distinct((source,), move |(value,)| f(value))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
