//! HTTP output caching.
//!
//! ## Core types
//!
//! - [`OutputCache`]: the engine. Runs requests through lookup, request
//!   locking, the backend, cacheability checks and storage.
//! - [`CachePolicy`] / [`OutputCacheOptions`]: per-route and engine-wide
//!   configuration, loadable from JSON.
//! - [`CachingContext`]: per-request flags, timings and keys.
//! - [`VaryKeyComposer`]: base and final cache keys.
//! - [`evaluate`]: freshness of a stored entry against request directives.
//! - [`EntryStore`]: pluggable storage, with [`MemoryStore`] in-process.
//! - [`RequestLockManager`]: per-key miss coalescing, with
//!   [`KeyedLockManager`] in-process.

mod clock;
mod context;
mod control;
mod entry;
mod error;
mod freshness;
mod key;
mod lock;
mod memory;
mod pipeline;
mod policy;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{CachingContext, PipelineState};
pub use control::{CacheControl, Directive};
pub use entry::{StoredEntry, is_storable_header};
pub use error::{BackendError, ConfigError, LockError, StoreError};
pub use freshness::{Freshness, evaluate, is_fresh};
pub use key::{CacheKey, KeyOptions, QueryVary, VaryByRules, VaryKeyComposer};
pub use lock::{KeyedLockManager, LockAcquisition, LockFuture, LockGuard, RequestLockManager};
pub use memory::{MemoryStore, MemoryStoreOptions};
pub use pipeline::{Backend, BackendFuture, OutputCache};
pub use policy::{CachePolicy, OutputCacheOptions, RequestHook, RoutePolicy, TagPolicy, ValueProvider};
pub use store::{EntryStore, StoreFuture};
