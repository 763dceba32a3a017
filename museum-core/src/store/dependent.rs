//! Dependent Store
//!
//! A store whose value is computed from a parent store's value, possibly
//! asynchronously. It holds one subscription to its parent while it has
//! observers, and none otherwise.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::reactive::{Invalidate, Observer, Readable, Setter, Signal, Subscription};
use crate::store::computation::Computation;

/// How results of overlapping async computations are published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Resolution {
    /// Every result is published when it resolves; the last to resolve wins,
    /// even if it was started for an older parent value.
    #[default]
    ArrivalOrder,
    /// Only the result of the newest computation is published.
    LatestOnly,
}

type Compute<P, T> = dyn Fn(&P) -> Computation<T> + Send + Sync;

struct DependentShared<P, T> {
    parent: Box<dyn Readable<Value = P>>,
    compute: Box<Compute<P, T>>,
    resolution: Resolution,
    generation: Arc<AtomicU64>,
}

impl<P, T> DependentShared<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn run(&self, parent: &P, setter: Setter<T>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let computation = (self.compute)(parent);
        trace!(generation, ready = computation.is_ready(), "recomputing dependent store");

        match self.resolution {
            Resolution::ArrivalOrder => computation.publish_to(setter, || true),
            Resolution::LatestOnly => {
                let latest = Arc::clone(&self.generation);
                computation.publish_to(setter, move || latest.load(Ordering::SeqCst) == generation);
            }
        }
    }
}

/// A store computed from its parent's value.
///
/// `compute` returns a [`Computation`]: a value published immediately, or a
/// future published when it resolves. A pending computation leaves the
/// previous value in place until then.
pub struct DependentStore<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    signal: Signal<T>,
    shared: Arc<DependentShared<P, T>>,
}

impl<T, P> DependentStore<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// A store publishing `initial` until `compute` first delivers, with
    /// results published in arrival order.
    pub fn new<R, F>(initial: T, compute: F, parent: R) -> Self
    where
        R: Readable<Value = P>,
        F: Fn(&P) -> Computation<T> + Send + Sync + 'static,
    {
        Self::with_resolution(initial, compute, parent, Resolution::default())
    }

    pub fn with_resolution<R, F>(initial: T, compute: F, parent: R, resolution: Resolution) -> Self
    where
        R: Readable<Value = P>,
        F: Fn(&P) -> Computation<T> + Send + Sync + 'static,
    {
        let shared = Arc::new(DependentShared {
            parent: Box::new(parent),
            compute: Box::new(compute),
            resolution,
            generation: Arc::new(AtomicU64::new(0)),
        });

        let activation = Arc::clone(&shared);
        let signal = Signal::with_activation(initial, move |setter: Setter<T>| {
            trace!("dependent store activated");
            let shared = Arc::clone(&activation);
            let parent = activation.parent.subscribe_with(
                Arc::new(move |value: &P| shared.run(value, setter.clone())),
                None,
            );
            Box::new(move || {
                trace!("dependent store deactivated");
                drop(parent);
            })
        });

        Self { signal, shared }
    }

    /// Recompute from the parent's current value.
    pub fn refresh(&self) {
        let parent = self.shared.parent.get();
        self.shared.run(&parent, self.signal.setter());
    }

    pub fn get(&self) -> T {
        self.signal.get()
    }

    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.signal.subscribe(observer)
    }

    pub fn subscriber_count(&self) -> usize {
        self.signal.subscriber_count()
    }

    /// Whether the store currently holds its parent subscription.
    pub fn is_active(&self) -> bool {
        self.signal.is_active()
    }

    pub fn resolution(&self) -> Resolution {
        self.shared.resolution
    }
}

impl<T, P> Readable for DependentStore<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
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

impl<T, P> Clone for DependentStore<T, P>
where
    T: Clone + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, P> fmt::Debug for DependentStore<T, P>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
    P: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentStore")
            .field("value", &self.signal.get_untracked())
            .field("resolution", &self.shared.resolution)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}
