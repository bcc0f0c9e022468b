//! Entry store contract.
//!
//! The engine is agnostic to where entries live. Implementations must make a
//! `set` visible to every later `try_get` of the same key, and must apply
//! `evict_by_tag` to every entry carrying the tag at the time it runs. When a
//! `set` races an `evict_by_tag`, whichever runs last wins.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use super::entry::StoredEntry;
use super::error::StoreError;
use super::key::VaryByRules;

/// Boxed future returned by every [`EntryStore`] operation.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Pluggable storage for cached responses.
///
/// Entries are addressed by final key (see
/// [`VaryKeyComposer`](super::VaryKeyComposer)). Alongside them, the store
/// keeps one vary record per base key: the header and query dimensions that
/// responses for that resource were stored under.
///
/// # Contract
///
/// - Implementations **must** be `Send + Sync`; one store is shared by every
///   in-flight request.
/// - Writes to one key are linearized.
/// - The tag index is updated together with the entry map, never one without
///   the other.
pub trait EntryStore: Send + Sync {
    /// Looks up an entry. Expired entries read as `None`.
    fn try_get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Arc<StoredEntry>>>;

    /// Stores `entry` under `key`, indexed by `entry.tags()`, for at most `ttl`.
    /// Replaces any previous entry for `key` wholesale.
    fn set<'a>(&'a self, key: &'a str, entry: StoredEntry, ttl: Duration) -> StoreFuture<'a, ()>;

    /// Removes the entry for `key`, if any.
    fn evict<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()>;

    /// Removes every entry tagged with `tag`. Returns how many were removed.
    fn evict_by_tag<'a>(&'a self, tag: &'a str) -> StoreFuture<'a, usize>;

    /// Reads the vary record for a base key.
    fn try_get_vary_rules<'a>(&'a self, base_key: &'a str) -> StoreFuture<'a, Option<VaryByRules>>;

    /// Writes the vary record for a base key. A live record is extended, not
    /// replaced: its dimensions are unioned with `rules` and it expires at the
    /// later of its current expiry and `ttl` from now.
    fn set_vary_rules<'a>(
        &'a self,
        base_key: &'a str,
        rules: VaryByRules,
        ttl: Duration,
    ) -> StoreFuture<'a, ()>;
}
