//! Stores built on the reactive primitives: caching, dependent and periodic
//! loading, the busy counter and persisted preferences.

mod busy;
mod cache;
mod computation;
mod dependent;
mod interval;
pub mod preferences;

pub use busy::{BusyCounter, BusyGuard};
pub use cache::{CacheMap, CacheStore, Keyed, Loader, DEFAULT_BATCH_WINDOW};
pub use computation::Computation;
pub use dependent::{DependentStore, Resolution};
pub use interval::{IntervalStore, MIN_PERIOD};
pub use preferences::{FileStorage, KeyValueStorage, MemoryStorage, Preferences};
