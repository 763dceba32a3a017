//! Reactive Primitives
//!
//! This module implements the Reactive Value Cell and the combinators built
//! directly on it. Every store in [`crate::store`] is a [`Signal`] underneath.
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for a value plus an ordered list of observers.
//! Subscribing delivers the current value immediately, then every published
//! value. A signal may carry an activation callback that starts work on its
//! first observer and stops it after its last.
//!
//! ## Derived Stores
//!
//! A Derived store combines the latest values of several sources. It only
//! listens to its sources while it is itself observed, and it uses a
//! pending bitmask so that sources changing together cause one
//! recomputation, not one per source.
//!
//! ## Batches
//!
//! Publishing goes through a per-thread queue. [`batch`] groups several
//! sets into one logical update.
//!
//! # Implementation Notes
//!
//! Dependencies are explicit: a derived store names its sources up front
//! instead of discovering them by tracking reads. This keeps activation
//! (who is subscribed to what) visible and testable.

mod batch;
mod derived;
mod signal;
mod subscriber;

pub use batch::{batch, is_batching, BatchScope};
pub use derived::{map, map_distinct, Apply, Derived, SourceSink, SourceSubscriptions, Sources, MAX_SOURCES};
pub use signal::{Deactivate, Readable, Setter, Signal};
pub use subscriber::{Invalidate, Observer, Subscriber, SubscriberId, Subscription};
