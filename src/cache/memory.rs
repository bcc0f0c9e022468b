//! In-process [`EntryStore`].
//!
//! Entries live in an [`LruCache`] bounded by entry count, with a byte budget
//! enforced on top by popping the least recently used entries. The tag → keys
//! index and the vary records sit beside it under the same lock, so an entry
//! and its index rows always change together. Expired entries are dropped
//! when they are next read or when recency pushes them out.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::control::MAX_DELTA_SECONDS;
use super::entry::StoredEntry;
use super::error::StoreError;
use super::key::VaryByRules;
use super::store::{EntryStore, StoreFuture};

/// Capacity bounds for [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryStoreOptions {
    /// Maximum number of stored responses, and of vary records.
    pub max_entries: usize,
    /// Maximum total body + header bytes.
    pub size_limit: usize,
}

impl Default for MemoryStoreOptions {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            size_limit: 100 * 1024 * 1024,
        }
    }
}

impl MemoryStoreOptions {
    fn capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.max_entries).unwrap_or(NonZeroUsize::MIN)
    }
}

/// `now + ttl`, with `ttl` clamped so the sum cannot overflow.
fn expiry(now: SystemTime, ttl: Duration) -> SystemTime {
    now.checked_add(ttl.min(Duration::from_secs(MAX_DELTA_SECONDS)))
        .unwrap_or(now)
}

struct Slot {
    entry: Arc<StoredEntry>,
    expires_at: SystemTime,
    size: usize,
}

struct VaryRecord {
    rules: VaryByRules,
    expires_at: SystemTime,
}

struct Inner {
    entries: LruCache<String, Slot>,
    tags: HashMap<String, HashSet<String>>,
    vary: LruCache<String, VaryRecord>,
    total_size: usize,
}

impl Inner {
    fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            tags: HashMap::new(),
            vary: LruCache::new(capacity),
            total_size: 0,
        }
    }

    /// Drops the size and tag bookkeeping of a slot already taken out of the map.
    fn unindex(&mut self, key: &str, slot: &Slot) {
        self.total_size = self.total_size.saturating_sub(slot.size);
        for tag in slot.entry.tags() {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.pop(key) {
            Some(slot) => {
                self.unindex(key, &slot);
                true
            }
            None => false,
        }
    }

    fn evict_lru(&mut self) -> bool {
        match self.entries.pop_lru() {
            Some((key, slot)) => {
                debug!(key = %key, "evicting least recently used entry to make room");
                self.unindex(&key, &slot);
                true
            }
            None => false,
        }
    }
}

/// A bounded in-memory entry store with least-recently-used eviction.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
/// use bytes::Bytes;
/// use outcache::cache::{EntryStore, MemoryStore, StoredEntry};
/// use outcache::http::{Headers, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let store = MemoryStore::new();
/// let entry = StoredEntry::new(StatusCode::Ok, &Headers::new(), Bytes::from("hi"), SystemTime::now())
///     .with_tags(["catalog".to_string()]);
///
/// store.set("k", entry, Duration::from_secs(60)).await.unwrap();
/// assert!(store.try_get("k").await.unwrap().is_some());
///
/// assert_eq!(store.evict_by_tag("catalog").await.unwrap(), 1);
/// assert!(store.try_get("k").await.unwrap().is_none());
/// # }
/// ```
pub struct MemoryStore {
    inner: Mutex<Inner>,
    options: MemoryStoreOptions,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// A store with default bounds and the system clock.
    pub fn new() -> Self {
        Self::with_options(MemoryStoreOptions::default(), Arc::new(SystemClock))
    }

    pub fn with_options(options: MemoryStoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::new(options.capacity())),
            options,
            clock,
        }
    }

    /// Number of stored entries, counting expired ones not yet dropped.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Total bytes currently accounted to stored entries.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.total_size
    }

    /// Drops every entry, tag row and vary record.
    pub async fn clear(&self) {
        *self.inner.lock().await = Inner::new(self.options.capacity());
    }

    async fn get_live(&self, key: &str) -> Option<Arc<StoredEntry>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        match inner.entries.get(key) {
            Some(slot) if slot.expires_at > now => return Some(Arc::clone(&slot.entry)),
            Some(_) => {}
            None => return None,
        }
        inner.remove(key);
        None
    }

    async fn insert(&self, key: &str, entry: StoredEntry, ttl: Duration) -> Result<(), StoreError> {
        let size = entry.size();
        if size > self.options.size_limit {
            return Err(StoreError::TooLarge {
                size,
                limit: self.options.size_limit,
            });
        }

        let expires_at = expiry(self.clock.now(), ttl);
        let mut inner = self.inner.lock().await;

        inner.remove(key);
        while inner.total_size + size > self.options.size_limit && inner.evict_lru() {}

        for tag in entry.tags() {
            inner
                .tags
                .entry(tag.clone())
                .or_default()
                .insert(key.to_owned());
        }
        inner.total_size += size;
        let slot = Slot {
            entry: Arc::new(entry),
            expires_at,
            size,
        };
        if let Some((evicted_key, evicted)) = inner.entries.push(key.to_owned(), slot) {
            debug!(key = %evicted_key, "evicting least recently used entry to make room");
            inner.unindex(&evicted_key, &evicted);
        }
        Ok(())
    }
}

impl EntryStore for MemoryStore {
    fn try_get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<Arc<StoredEntry>>> {
        Box::pin(async move { Ok(self.get_live(key).await) })
    }

    fn set<'a>(&'a self, key: &'a str, entry: StoredEntry, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(self.insert(key, entry, ttl))
    }

    fn evict<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.inner.lock().await.remove(key);
            Ok(())
        })
    }

    fn evict_by_tag<'a>(&'a self, tag: &'a str) -> StoreFuture<'a, usize> {
        Box::pin(async move {
            let mut inner = self.inner.lock().await;
            let keys = inner.tags.remove(tag).unwrap_or_default();
            let mut removed = 0;
            for key in &keys {
                if inner.remove(key) {
                    removed += 1;
                }
            }
            debug!(tag, removed, "evicted entries by tag");
            Ok(removed)
        })
    }

    fn try_get_vary_rules<'a>(&'a self, base_key: &'a str) -> StoreFuture<'a, Option<VaryByRules>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut inner = self.inner.lock().await;
            match inner.vary.get(base_key) {
                Some(record) if record.expires_at > now => return Ok(Some(record.rules.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
            inner.vary.pop(base_key);
            Ok(None)
        })
    }

    fn set_vary_rules<'a>(
        &'a self,
        base_key: &'a str,
        rules: VaryByRules,
        ttl: Duration,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = self.clock.now();
            let expires_at = expiry(now, ttl);
            let mut inner = self.inner.lock().await;
            // A live record outlives the variant being written and keeps
            // every dimension it already had.
            let record = match inner.vary.pop(base_key) {
                Some(mut existing) if existing.expires_at > now => {
                    existing.rules.merge(&rules);
                    existing.expires_at = existing.expires_at.max(expires_at);
                    existing
                }
                _ => VaryRecord { rules, expires_at },
            };
            inner.vary.push(base_key.to_owned(), record);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::http::{Headers, StatusCode};

    const MINUTE: Duration = Duration::from_secs(60);

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000)))
    }

    fn store_with(clock: Arc<ManualClock>, options: MemoryStoreOptions) -> MemoryStore {
        MemoryStore::with_options(options, clock)
    }

    fn entry(body: &'static str, tags: &[&str]) -> StoredEntry {
        StoredEntry::new(
            StatusCode::Ok,
            &Headers::new(),
            Bytes::from_static(body.as_bytes()),
            SystemTime::UNIX_EPOCH,
        )
        .with_tags(tags.iter().map(|t| t.to_string()))
    }

    #[tokio::test]
    async fn set_is_visible_to_next_get() {
        let store = store_with(clock(), MemoryStoreOptions::default());
        assert!(store.try_get("a").await.unwrap().is_none());
        store.set("a", entry("one", &[]), MINUTE).await.unwrap();
        let got = store.try_get("a").await.unwrap().unwrap();
        assert_eq!(got.body().as_ref(), b"one");
    }

    #[tokio::test]
    async fn storing_twice_keeps_latest_value_only() {
        let store = store_with(clock(), MemoryStoreOptions::default());
        store.set("a", entry("v1", &["t"]), MINUTE).await.unwrap();
        store.set("a", entry("v2", &["t"]), MINUTE).await.unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(store.size().await, 2);
        let got = store.try_get("a").await.unwrap().unwrap();
        assert_eq!(got.body().as_ref(), b"v2");
    }

    #[tokio::test]
    async fn evict_by_tag_removes_only_tagged_entries() {
        let store = store_with(clock(), MemoryStoreOptions::default());
        store.set("a", entry("a", &["T", "x"]), MINUTE).await.unwrap();
        store.set("b", entry("b", &["T"]), MINUTE).await.unwrap();
        store.set("c", entry("c", &["x"]), MINUTE).await.unwrap();

        assert_eq!(store.evict_by_tag("T").await.unwrap(), 2);
        assert!(store.try_get("a").await.unwrap().is_none());
        assert!(store.try_get("b").await.unwrap().is_none());
        assert!(store.try_get("c").await.unwrap().is_some());
        assert_eq!(store.evict_by_tag("T").await.unwrap(), 0);
        assert_eq!(store.evict_by_tag("x").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn retagged_entry_is_not_evicted_by_its_old_tag() {
        let store = store_with(clock(), MemoryStoreOptions::default());
        store.set("a", entry("v1", &["old"]), MINUTE).await.unwrap();
        store.set("a", entry("v2", &["new"]), MINUTE).await.unwrap();
        assert_eq!(store.evict_by_tag("old").await.unwrap(), 0);
        assert!(store.try_get("a").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let clock = clock();
        let store = store_with(clock.clone(), MemoryStoreOptions::default());
        store.set("a", entry("a", &["t"]), MINUTE).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(store.try_get("a").await.unwrap().is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.try_get("a").await.unwrap().is_none());
        assert!(store.is_empty().await);
        assert_eq!(store.evict_by_tag("t").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let options = MemoryStoreOptions {
            max_entries: 2,
            ..MemoryStoreOptions::default()
        };
        let store = store_with(clock(), options);
        store.set("hot", entry("h", &["t"]), MINUTE).await.unwrap();
        store.set("cold", entry("c", &["t"]), MINUTE).await.unwrap();
        for _ in 0..3 {
            assert!(store.try_get("hot").await.unwrap().is_some());
        }
        store.set("new", entry("n", &[]), MINUTE).await.unwrap();

        assert!(store.try_get("cold").await.unwrap().is_none());
        assert!(store.try_get("hot").await.unwrap().is_some());
        assert!(store.try_get("new").await.unwrap().is_some());
        assert_eq!(store.len().await, 2);
        assert_eq!(store.size().await, 2);
        assert_eq!(store.evict_by_tag("t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn size_limit_rejects_and_evicts() {
        let options = MemoryStoreOptions {
            max_entries: 100,
            size_limit: 8,
        };
        let store = store_with(clock(), options);
        let too_big = store.set("x", entry("123456789", &[]), MINUTE).await;
        assert!(matches!(too_big, Err(StoreError::TooLarge { size: 9, limit: 8 })));

        store.set("a", entry("12345", &[]), MINUTE).await.unwrap();
        store.set("b", entry("1234", &[]), MINUTE).await.unwrap();
        assert!(store.try_get("a").await.unwrap().is_none());
        assert_eq!(store.size().await, 4);
    }

    #[tokio::test]
    async fn vary_records_round_trip_and_expire() {
        let clock = clock();
        let store = store_with(clock.clone(), MemoryStoreOptions::default());
        let rules = VaryByRules::new().header("accept-language");
        store.set_vary_rules("GET\x1e\x1e/", rules.clone(), MINUTE).await.unwrap();
        assert_eq!(store.try_get_vary_rules("GET\x1e\x1e/").await.unwrap(), Some(rules));

        clock.advance(MINUTE);
        assert_eq!(store.try_get_vary_rules("GET\x1e\x1e/").await.unwrap(), None);
    }

    #[tokio::test]
    async fn vary_record_keeps_longest_lifetime_and_all_dimensions() {
        let clock = clock();
        let store = store_with(clock.clone(), MemoryStoreOptions::default());
        let base = "GET\x1e\x1e/";
        store
            .set_vary_rules(base, VaryByRules::new().header("accept-language"), Duration::from_secs(600))
            .await
            .unwrap();
        store
            .set_vary_rules(base, VaryByRules::new().header("accept-encoding"), Duration::from_secs(5))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        let rules = store.try_get_vary_rules(base).await.unwrap().unwrap();
        assert_eq!(rules.headers(), ["accept-language", "accept-encoding"]);

        clock.advance(Duration::from_secs(600));
        assert_eq!(store.try_get_vary_rules(base).await.unwrap(), None);
    }

    #[tokio::test]
    async fn huge_ttl_saturates_instead_of_overflowing() {
        let store = store_with(clock(), MemoryStoreOptions::default());
        store.set("a", entry("a", &[]), Duration::MAX).await.unwrap();
        store
            .set_vary_rules("GET\x1e\x1e/", VaryByRules::new(), Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        assert!(store.try_get("a").await.unwrap().is_some());
        assert!(store.try_get_vary_rules("GET\x1e\x1e/").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_drops_everything() {
        let store = store_with(clock(), MemoryStoreOptions::default());
        store.set("a", entry("a", &["t"]), MINUTE).await.unwrap();
        store.evict("missing").await.unwrap();
        store.clear().await;
        assert!(store.is_empty().await);
        assert_eq!(store.size().await, 0);
    }
}
