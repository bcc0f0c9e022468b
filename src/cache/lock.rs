//! Request locking: one backend execution per cache key at a time.
//!
//! The first request to miss on a key becomes its *owner* and holds a
//! [`LockGuard`] while the backend runs. Later requests for the same key
//! wait until the guard is dropped, then look the key up again instead of
//! calling the backend themselves. Dropping the guard is the only way to
//! release, so a failed or cancelled owner still wakes its waiters.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::trace;

use super::error::LockError;

/// Release handle held by the owner of a key. Dropping it releases the key.
pub struct LockGuard {
    _release: Box<dyn Send + Sync>,
}

impl LockGuard {
    /// Wraps any value whose `Drop` releases the underlying lock.
    pub fn new(release: impl Send + Sync + 'static) -> Self {
        Self {
            _release: Box::new(release),
        }
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {}
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").finish_non_exhaustive()
    }
}

/// Result of [`RequestLockManager::acquire_or_wait`].
#[derive(Debug)]
pub enum LockAcquisition {
    /// The caller owns the key and must invoke the backend.
    Owner(LockGuard),
    /// Another request owned the key and has since released it.
    Released,
}

/// Boxed future returned by [`RequestLockManager::acquire_or_wait`].
pub type LockFuture<'a> = Pin<Box<dyn Future<Output = Result<LockAcquisition, LockError>> + Send + 'a>>;

/// Per-key mutual exclusion for cache-miss executions.
///
/// Keys are independent: holding one never blocks another.
pub trait RequestLockManager: Send + Sync {
    /// Becomes the owner of `key`, or waits for the current owner to release.
    ///
    /// A wait that is still pending at `deadline` fails with
    /// [`LockError::Timeout`].
    fn acquire_or_wait<'a>(&'a self, key: &'a str, deadline: Instant) -> LockFuture<'a>;
}

/// [`RequestLockManager`] backed by a concurrent map of per-key mutexes.
///
/// An entry is created on the first miss for a key and removed when its
/// owner's guard drops.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use outcache::cache::{KeyedLockManager, LockAcquisition, RequestLockManager};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let locks = KeyedLockManager::new();
/// let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
///
/// let first = locks.acquire_or_wait("k", deadline).await.unwrap();
/// assert!(matches!(first, LockAcquisition::Owner(_)));
/// assert_eq!(locks.in_flight(), 1);
///
/// drop(first);
/// assert_eq!(locks.in_flight(), 0);
/// # }
/// ```
#[derive(Default)]
pub struct KeyedLockManager {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys that currently have an owner.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }
}

struct OwnedKey {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    lock: Arc<Mutex<()>>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for OwnedKey {
    fn drop(&mut self) {
        // Only remove the entry this owner created.
        self.locks
            .remove_if(&self.key, |_, current| Arc::ptr_eq(current, &self.lock));
        trace!(key = %self.key, "request lock released");
    }
}

impl RequestLockManager for KeyedLockManager {
    fn acquire_or_wait<'a>(&'a self, key: &'a str, deadline: Instant) -> LockFuture<'a> {
        Box::pin(async move {
            // Uncontended: a fresh mutex locks without waiting.
            let candidate = Arc::new(Mutex::new(()));
            let guard = Arc::clone(&candidate).lock_owned().await;

            let existing = match self.locks.entry(key.to_owned()) {
                Entry::Occupied(entry) => Arc::clone(entry.get()),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&candidate));
                    trace!(key, "request lock acquired");
                    return Ok(LockAcquisition::Owner(LockGuard::new(OwnedKey {
                        key: key.to_owned(),
                        locks: Arc::clone(&self.locks),
                        lock: candidate,
                        _guard: guard,
                    })));
                }
            };
            drop(guard);

            let started = Instant::now();
            match tokio::time::timeout_at(deadline, existing.lock_owned()).await {
                Ok(_released) => {
                    trace!(key, waited = ?started.elapsed(), "request lock owner finished");
                    Ok(LockAcquisition::Released)
                }
                Err(_) => Err(LockError::Timeout {
                    key: key.to_owned(),
                    waited: started.elapsed(),
                }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn soon() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn first_caller_owns_and_drop_removes_entry() {
        let locks = KeyedLockManager::new();
        let owner = locks.acquire_or_wait("k", soon()).await.unwrap();
        assert!(matches!(owner, LockAcquisition::Owner(_)));
        assert_eq!(locks.in_flight(), 1);
        drop(owner);
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn waiter_resumes_after_owner_releases() {
        let locks = Arc::new(KeyedLockManager::new());
        let LockAcquisition::Owner(guard) = locks.acquire_or_wait("k", soon()).await.unwrap() else {
            panic!("expected owner");
        };

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire_or_wait("k", soon()).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        guard.release();
        let outcome = waiter.await.unwrap().unwrap();
        assert!(matches!(outcome, LockAcquisition::Released));
        assert_eq!(locks.in_flight(), 0);
    }

    #[tokio::test]
    async fn keys_do_not_block_each_other() {
        let locks = KeyedLockManager::new();
        let _a = locks.acquire_or_wait("a", soon()).await.unwrap();
        let b = locks.acquire_or_wait("b", soon()).await.unwrap();
        assert!(matches!(b, LockAcquisition::Owner(_)));
        assert_eq!(locks.in_flight(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_at_deadline() {
        let locks = KeyedLockManager::new();
        let _owner = locks.acquire_or_wait("k", soon()).await.unwrap();
        let deadline = Instant::now() + Duration::from_millis(250);
        let err = locks.acquire_or_wait("k", deadline).await.unwrap_err();
        let LockError::Timeout { key, waited } = err;
        assert_eq!(key, "k");
        assert!(waited >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn cancelled_owner_still_releases() {
        let locks = Arc::new(KeyedLockManager::new());
        let owner_task = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire_or_wait("k", soon()).await.unwrap();
                std::future::pending::<()>().await;
            })
        };
        while locks.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        owner_task.abort();
        let _ = owner_task.await;

        let next = locks.acquire_or_wait("k", soon()).await.unwrap();
        assert!(matches!(next, LockAcquisition::Owner(_)));
    }
}
