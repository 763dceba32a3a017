//! Interval Store
//!
//! Re-runs a computation on a fixed period while observed. The timer task
//! exists only between the first observer subscribing and the last one
//! leaving.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::reactive::{Invalidate, Observer, Readable, Setter, Signal, Subscription};
use crate::store::computation::{spawn_detached, Computation};

type Compute<T> = dyn Fn() -> Computation<T> + Send + Sync;

/// Shortest accepted period. Zero is raised to this.
pub const MIN_PERIOD: Duration = Duration::from_millis(1);

/// A periodically refreshed store.
pub struct IntervalStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    signal: Signal<T>,
    compute: Arc<Compute<T>>,
    period: Duration,
}

impl<T> IntervalStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A store publishing `initial` until `compute` first delivers.
    ///
    /// The first observer triggers one computation immediately, then one per
    /// `period`. A computation that fails keeps the previous value. A zero
    /// `period` is raised to [`MIN_PERIOD`].
    pub fn new<F>(initial: T, compute: F, period: Duration) -> Self
    where
        F: Fn() -> Computation<T> + Send + Sync + 'static,
    {
        let period = if period.is_zero() {
            warn!(min_ms = MIN_PERIOD.as_millis() as u64, "zero interval period raised");
            MIN_PERIOD
        } else {
            period
        };
        let compute: Arc<Compute<T>> = Arc::new(compute);

        let tick = Arc::clone(&compute);
        let signal = Signal::with_activation(initial, move |setter: Setter<T>| {
            debug!(period_ms = period.as_millis() as u64, "interval store activated");
            tick().publish_to(setter.clone(), || true);

            let tick = Arc::clone(&tick);
            let timer = spawn_detached("interval", async move {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    interval.tick().await;
                    if !setter.is_connected() {
                        break;
                    }
                    trace!("interval tick");
                    tick().publish_to(setter.clone(), || true);
                }
            });

            Box::new(move || {
                debug!("interval store deactivated");
                // In-flight computations finish on their own; their result
                // lands in the store with nobody observing.
                if let Some(timer) = timer {
                    timer.abort();
                }
            })
        });

        Self {
            signal,
            compute,
            period,
        }
    }

    /// Run one computation now, outside the timer.
    pub fn refresh(&self) {
        (self.compute)().publish_to(self.signal.setter(), || true);
    }

    pub fn period(&self) -> Duration {
        self.period
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

    pub fn is_active(&self) -> bool {
        self.signal.is_active()
    }
}

impl<T> Readable for IntervalStore<T>
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

impl<T> Clone for IntervalStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
            compute: Arc::clone(&self.compute),
            period: self.period,
        }
    }
}

impl<T> fmt::Debug for IntervalStore<T>
where
    T: Clone + Send + Sync + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntervalStore")
            .field("value", &self.signal.get_untracked())
            .field("period", &self.period)
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PERIOD: Duration = Duration::from_millis(100);

    fn counting_store() -> (IntervalStore<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let store = IntervalStore::new(
            0,
            move || Computation::ready(calls_clone.fetch_add(1, Ordering::SeqCst) + 1),
            PERIOD,
        );
        (store, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn one_timer_for_many_observers() {
        let (store, calls) = counting_store();

        let a = store.subscribe(|_| {});
        let b = store.subscribe(|_| {});
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(PERIOD * 3 + Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.get(), 4);

        drop(a);
        drop(b);
        assert!(!store.is_active());

        tokio::time::sleep(PERIOD * 5).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn resubscribing_restarts_timer() {
        let (store, calls) = counting_store();

        drop(store.subscribe(|_| {}));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let _sub = store.subscribe(|_| {});
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::sleep(PERIOD + Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tick_keeps_previous_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let store = IntervalStore::new(
            "initial".to_string(),
            move || {
                let n = calls_clone.fetch_add(1, Ordering::SeqCst);
                Computation::fallible(async move {
                    if n == 0 {
                        Ok("online".to_string())
                    } else {
                        Err("timeout")
                    }
                })
            },
            PERIOD,
        );
        let _sub = store.subscribe(|_| {});

        tokio::time::sleep(PERIOD * 2 + Duration::from_millis(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get(), "online");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_period_still_ticks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let store = IntervalStore::new(
            0,
            move || Computation::ready(calls_clone.fetch_add(1, Ordering::SeqCst) + 1),
            Duration::ZERO,
        );
        assert_eq!(store.period(), MIN_PERIOD);

        let _sub = store.subscribe(|_| {});
        tokio::time::sleep(MIN_PERIOD * 3 + Duration::from_micros(500)).await;

        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_runs_outside_the_timer() {
        let (store, calls) = counting_store();
        let _sub = store.subscribe(|_| {});

        store.refresh();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.get(), 2);
    }
}
