//! Museum Core
//!
//! Reactive data-caching and dependent-fetch stores for the museum map
//! front end.
//!
//! It implements:
//!
//! - Reactive primitives (signals, derived stores, batched publishing)
//! - Batching, de-duplicating cache stores for server objects
//! - Dependent and interval stores for async, lazily activated loading
//! - A busy counter for the loading indicator
//! - Preferences persisted in a key/value medium
//!
//! # Architecture
//!
//! - `reactive`: the value cell and its combinators
//! - `store`: caching, dependent, interval and preference stores
//! - `api`: the backend transport and endpoint conventions
//! - `entity`: server objects and their ids
//! - `museum`: domain values and the pure functions deriving them
//! - `app`: the context that builds and owns every application store
//!
//! # Example
//!
//! ```rust
//! use museum_core::reactive::{Derived, Signal};
//!
//! let count = Signal::new(1);
//! let doubled = Derived::new((count.clone(),), |(count,)| count * 2);
//!
//! let _sub = doubled.subscribe(|value| println!("doubled = {value}"));
//! count.set(5);
//! assert_eq!(doubled.get(), 10);
//! ```

pub mod api;
pub mod app;
pub mod config;
pub mod entity;
pub mod error;
pub mod museum;
pub mod reactive;
pub mod store;

pub use app::AppContext;
pub use config::StoreConfig;
pub use error::{Result, StoreError};
