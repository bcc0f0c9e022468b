//! Error taxonomy of the cache engine.
//!
//! Only [`BackendError`] ever reaches the caller of
//! [`OutputCache::execute`](super::OutputCache::execute). Store and lock
//! failures are logged and the request degrades to an uncached execution.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by the backend that produces uncached responses.
///
/// Never cached. Propagated to the caller untouched.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend failed: {message}")]
    Failed { message: String },

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl BackendError {
    /// Shorthand for [`BackendError::Failed`].
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Failure of an [`EntryStore`](super::EntryStore) operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entry store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("entry of {size} bytes exceeds the store limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },
}

/// Failure while waiting on another request's in-flight execution.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("gave up waiting for in-flight request on {key} after {waited:?}")]
    Timeout { key: String, waited: Duration },
}

/// Failure while loading [`OutputCacheOptions`](super::OutputCacheOptions).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid output cache options: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown cacheable status code {0}")]
    UnknownStatus(u16),
}
