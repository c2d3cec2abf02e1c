//! scopeline: scope-based cache invalidation for derived data
//!
//! A [`Scope`] is an invalidation domain ("the palette", "this sprite").
//! A [`ScopeKey`] records which scopes a computation depended on and is the
//! identity the caches store results under. Invalidating a scope
//! invalidates every key registered on it, and through those keys every
//! cache entry derived from them.
//!
//! - [`processor`]: scope-pure transformations and their ordered composites
//! - [`cache`]: [`DataCache`], [`ProcessorCache`] and [`AsyncProcessorCache`]
//! - [`maintenance`]: periodic sweeping of leftover garbage
//! - [`assets`], [`watch`]: sprite recoloring built on the above

pub mod assets;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod processor;
pub mod scope;
pub mod watch;

mod sync;

pub use cache::{
    AsyncProcessorCache, CacheStats, CacheStatsSnapshot, DataCache, ProcessorCache,
    ScopedDataFactory, ScopedEntry,
};
pub use error::{ScopeError, ScopeResult};
pub use maintenance::{Maintainable, MaintenanceReport};
pub use processor::{
    AsyncDataProcessor, CompositeAsyncDataProcessor, CompositeDataProcessor, DataProcessor,
    Processed, ProcessorHandle,
};
pub use scope::{KeyIdentity, KeyState, Scope, ScopeKey, SubscriptionId};
