//! Per-request caching state.

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tracing::debug;

use super::key::{CacheKey, VaryByRules};
use crate::http::Headers;

/// Where a request is in the caching pipeline.
///
/// ```text
/// Start -> EligibilityChecked -> LookupAttempted -> FreshServe -------------> Served
///                                                -> Miss -> Locked -> BackendInvoked
///                                                   -> CacheabilityChecked -> Stored | Skipped -> Served
/// ```
///
/// `Locked` is skipped when locking is off or the wait fell through, and
/// ineligible requests jump from `EligibilityChecked` to `BackendInvoked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineState {
    #[default]
    Start,
    EligibilityChecked,
    LookupAttempted,
    FreshServe,
    Miss,
    Locked,
    BackendInvoked,
    CacheabilityChecked,
    Stored,
    Skipped,
    Served,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of one request as it moves through [`OutputCache`](super::OutputCache).
///
/// The flags are decided in two phases. `enable_caching`, `attempt_caching`,
/// `allow_lookup`, `allow_storage` and `allow_locking` are settled before the
/// backend runs, and a policy's request hook may flip them. The
/// `is_response_cacheable` flag is only set after the backend responded.
#[derive(Debug, Clone, Default)]
pub struct CachingContext {
    /// Output caching is on for the matched route.
    pub enable_caching: bool,
    /// The request itself qualifies (method, authorization).
    pub attempt_caching: bool,
    pub allow_lookup: bool,
    pub allow_storage: bool,
    pub allow_locking: bool,
    pub is_response_cacheable: bool,
    pub is_entry_fresh: bool,

    /// When the backend response was received.
    pub response_time: Option<SystemTime>,
    /// Parsed response `Date`.
    pub response_date: Option<SystemTime>,
    /// Parsed response `Expires`.
    pub response_expires: Option<SystemTime>,
    pub response_max_age: Option<Duration>,
    pub response_shared_max_age: Option<Duration>,
    /// Age of the entry found on lookup, fresh or not.
    pub cached_entry_age: Option<Duration>,

    pub tags: HashSet<String>,
    pub vary_by_rules: VaryByRules,
    /// Headers captured for storage, with `Date` filled in when missing.
    pub cached_response_headers: Headers,
    /// Lifetime that beats any freshness the response declares.
    pub response_expiration_override: Option<Duration>,

    /// Past this instant the request stops waiting on other requests.
    pub deadline: Option<Instant>,

    state: PipelineState,
    base_key: Option<String>,
    final_key: Option<CacheKey>,
}

impl CachingContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// A context whose lock waits end no later than `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn base_key(&self) -> Option<&str> {
        self.base_key.as_deref()
    }

    pub fn final_key(&self) -> Option<&CacheKey> {
        self.final_key.as_ref()
    }

    pub(crate) fn advance(&mut self, next: PipelineState) {
        debug!(from = %self.state, to = %next, key = ?self.final_key, "caching state");
        self.state = next;
    }

    pub(crate) fn set_base_key(&mut self, key: String) {
        self.base_key = Some(key);
    }

    pub(crate) fn set_final_key(&mut self, key: CacheKey) {
        self.final_key = Some(key);
    }
}
