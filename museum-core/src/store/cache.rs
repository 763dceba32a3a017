//! Batching Cache Store
//!
//! Caches server objects by id and coalesces concurrent requests.
//!
//! # How Fetching Works
//!
//! 1. `fetch(ids)` drops the ids that are already cached. If nothing is
//!    left, it returns at once without waiting on any timer.
//!
//! 2. Ids that are already part of a pending or in-flight batch are not
//!    requested again; the caller waits on that batch (single-flight).
//!
//! 3. The remaining ids go into the pending buffer. The first id to land in
//!    an empty buffer schedules a batch task that sleeps for the batch
//!    window, takes the whole buffer and calls the loader once.
//!
//! 4. Every caller whose ids fell into the window awaits the same shared
//!    result. Ids requested after the task took the buffer start a new
//!    batch.
//!
//! # Failure
//!
//! A loader error rejects every caller of that batch and caches nothing.
//! The in-flight marks are cleared either way, so the next `fetch` retries.
//!
//! # Growth
//!
//! Entries are never evicted.

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::reactive::{Invalidate, Observer, Readable, Signal, Subscription};
use crate::store::busy::BusyCounter;
use crate::store::computation::spawn_detached;

/// Default batch window.
pub const DEFAULT_BATCH_WINDOW: Duration = Duration::from_millis(5);

/// A value the cache can store: it knows its own key.
pub trait Keyed: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}

/// Loads the values for a batch of ids. Ids the backend does not know are
/// simply absent from the result.
pub trait Loader<E: Keyed>: Send + Sync + 'static {
    fn load(&self, ids: Vec<E::Key>) -> BoxFuture<'static, Result<Vec<E>>>;
}

impl<E, F> Loader<E> for F
where
    E: Keyed,
    F: Fn(Vec<E::Key>) -> BoxFuture<'static, Result<Vec<E>>> + Send + Sync + 'static,
{
    fn load(&self, ids: Vec<E::Key>) -> BoxFuture<'static, Result<Vec<E>>> {
        self(ids)
    }
}

/// Snapshot of the whole cache.
pub type CacheMap<E> = Arc<HashMap<<E as Keyed>::Key, Arc<E>>>;

type BatchResult = Shared<BoxFuture<'static, Result<()>>>;

/// Ids waiting for the next dispatch and ids already owned by a batch.
struct BatchState<K> {
    pending: Vec<K>,
    scheduled: Option<BatchResult>,
    in_flight: HashMap<K, BatchResult>,
}

impl<K> Default for BatchState<K> {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            scheduled: None,
            in_flight: HashMap::new(),
        }
    }
}

struct CacheInner<E: Keyed> {
    name: &'static str,
    loader: Box<dyn Loader<E>>,
    entries: Signal<CacheMap<E>>,
    window: Duration,
    busy: Option<BusyCounter>,
    state: Mutex<BatchState<E::Key>>,
}

impl<E: Keyed> CacheInner<E> {
    /// Claim the uncached ids and return the batches the caller must await.
    fn enqueue(self: &Arc<Self>, ids: &[E::Key], runtime: &Handle) -> Vec<BatchResult> {
        let mut waits: Vec<BatchResult> = Vec::new();
        let mut state = self.state.lock();
        // Read under the state lock: a finishing batch inserts its entries
        // before releasing its in-flight marks.
        let entries = self.entries.get_untracked();

        for id in ids {
            if entries.contains_key(id) {
                continue;
            }
            let batch = match state.in_flight.get(id) {
                Some(batch) => batch.clone(),
                None => {
                    let batch = match &state.scheduled {
                        Some(batch) => batch.clone(),
                        None => {
                            let batch = self.schedule(runtime);
                            state.scheduled = Some(batch.clone());
                            batch
                        }
                    };
                    state.pending.push(id.clone());
                    state.in_flight.insert(id.clone(), batch.clone());
                    batch
                }
            };
            if !waits.iter().any(|known| known.ptr_eq(&batch)) {
                waits.push(batch);
            }
        }
        waits
    }

    fn schedule(self: &Arc<Self>, runtime: &Handle) -> BatchResult {
        let inner = Arc::clone(self);
        let task = runtime.spawn(async move {
            tokio::time::sleep(inner.window).await;
            inner.dispatch().await
        });
        async move { task.await.unwrap_or_else(|err| Err(StoreError::from(err))) }
            .boxed()
            .shared()
    }

    async fn dispatch(&self) -> Result<()> {
        let ids = {
            let mut state = self.state.lock();
            state.scheduled = None;
            std::mem::take(&mut state.pending)
        };

        let entries = self.entries.get_untracked();
        let missing: Vec<E::Key> = ids
            .iter()
            .filter(|id| !entries.contains_key(*id))
            .cloned()
            .collect();

        let result = if missing.is_empty() {
            Ok(())
        } else {
            debug!(cache = self.name, batch = missing.len(), ids = ?missing, "dispatching batch");
            let _busy = self.busy.as_ref().map(BusyCounter::guard);
            match self.loader.load(missing).await {
                Ok(loaded) => {
                    debug!(cache = self.name, loaded = loaded.len(), "batch loaded");
                    // Unknown ids load nothing; publishing anyway would wake
                    // observers that may request them again.
                    if loaded.is_empty() {
                        return self.release(&ids, Ok(()));
                    }
                    self.entries.update(|current| {
                        let mut next = HashMap::clone(current);
                        for entity in loaded {
                            next.insert(entity.key(), Arc::new(entity));
                        }
                        Arc::new(next)
                    });
                    Ok(())
                }
                Err(err) => {
                    warn!(cache = self.name, error = %err, "batch load failed");
                    Err(err)
                }
            }
        };

        self.release(&ids, result)
    }

    fn release(&self, ids: &[E::Key], result: Result<()>) -> Result<()> {
        let mut state = self.state.lock();
        for id in ids {
            state.in_flight.remove(id);
        }
        result
    }
}

/// Per-entity-type cache with batched, de-duplicated loading.
pub struct CacheStore<E: Keyed> {
    inner: Arc<CacheInner<E>>,
}

impl<E: Keyed> CacheStore<E> {
    /// A cache loading through `loader`, coalescing requests issued within
    /// `window` of each other. Batches hold `busy` raised while they load.
    pub fn new<L>(name: &'static str, loader: L, window: Duration, busy: Option<BusyCounter>) -> Self
    where
        L: Loader<E>,
    {
        Self {
            inner: Arc::new(CacheInner {
                name,
                loader: Box::new(loader),
                entries: Signal::new(Arc::new(HashMap::new())),
                window,
                busy,
                state: Mutex::new(BatchState::default()),
            }),
        }
    }

    /// Fetch `ids`, returning values in request order (`None` where the
    /// loader returned nothing).
    ///
    /// Must be awaited inside a tokio runtime.
    pub async fn fetch(&self, ids: &[E::Key]) -> Result<Vec<Option<Arc<E>>>> {
        let runtime = Handle::try_current().map_err(|err| StoreError::Runtime(err.to_string()))?;
        let waits = self.inner.enqueue(ids, &runtime);
        for batch in waits {
            batch.await?;
        }
        let entries = self.inner.entries.get_untracked();
        Ok(ids.iter().map(|id| entries.get(id).cloned()).collect())
    }

    /// Fire-and-forget fetch; failures are logged.
    pub fn prefetch(&self, ids: Vec<E::Key>) {
        let store = self.clone();
        spawn_detached("prefetch", async move {
            if let Err(err) = store.fetch(&ids).await {
                warn!(cache = store.inner.name, error = %err, "prefetch failed");
            }
        });
    }

    /// Store values obtained outside the loader, replacing cached values
    /// with the same key. Returns the stored handles in input order.
    pub fn insert<I>(&self, values: I) -> Vec<Arc<E>>
    where
        I: IntoIterator<Item = E>,
    {
        let values: Vec<Arc<E>> = values.into_iter().map(Arc::new).collect();
        if values.is_empty() {
            return values;
        }
        debug!(cache = self.inner.name, count = values.len(), "inserting values");
        self.inner.entries.update(|current| {
            let mut next = HashMap::clone(current);
            for value in &values {
                next.insert(value.key(), Arc::clone(value));
            }
            Arc::new(next)
        });
        values
    }

    /// Cached value for `id`, without loading.
    pub fn get(&self, id: &E::Key) -> Option<Arc<E>> {
        self.inner.entries.get_untracked().get(id).cloned()
    }

    /// Snapshot of every cached value.
    pub fn entries(&self) -> CacheMap<E> {
        self.inner.entries.get_untracked()
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.inner.entries.get_untracked().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of ids waiting for or inside a batch.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }
}

impl<E: Keyed> Clone for CacheStore<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Keyed> Readable for CacheStore<E> {
    type Value = CacheMap<E>;

    fn get(&self) -> CacheMap<E> {
        self.entries()
    }

    fn peek(&self) -> CacheMap<E> {
        self.entries()
    }

    fn subscribe_with(&self, run: Observer<CacheMap<E>>, invalidate: Option<Invalidate>) -> Subscription {
        self.inner.entries.subscribe_with(run, invalidate)
    }
}

impl<E: Keyed> Debug for CacheStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
