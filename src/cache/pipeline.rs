//! The output-caching engine.
//!
//! [`OutputCache`] runs each request through the state machine described on
//! [`PipelineState`]: decide eligibility, look the key up, serve a fresh hit,
//! otherwise collapse concurrent misses behind the request lock, call the
//! backend, decide whether the response may be stored, store it and serve it.
//!
//! Store and lock failures never reach the caller. They are logged and the
//! request carries on as if the cache were empty.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::context::{CachingContext, PipelineState};
use super::control::{CacheControl, MAX_DELTA_SECONDS};
use super::entry::StoredEntry;
use super::error::{BackendError, LockError, StoreError};
use super::freshness::evaluate;
use super::key::VaryKeyComposer;
use super::lock::{KeyedLockManager, LockAcquisition, LockGuard, RequestLockManager};
use super::memory::MemoryStore;
use super::policy::{CachePolicy, OutputCacheOptions};
use super::store::EntryStore;
use crate::http::{Headers, Request, Response, StatusCode};

/// Headers a `304 Not Modified` repeats from the stored response.
const NOT_MODIFIED_HEADERS: [&str; 7] = [
    "cache-control",
    "content-location",
    "date",
    "etag",
    "expires",
    "last-modified",
    "vary",
];

/// Lock wait bound used when `lock_timeout` is too large to add to now.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Boxed future returned by [`Backend::invoke`].
pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, BackendError>> + Send + 'a>>;

/// Produces the uncached response for a request.
///
/// Implemented for every `Fn(Request) -> impl Future<Output = Result<Response, BackendError>>`,
/// so plain async closures work:
///
/// ```
/// use outcache::cache::{Backend, BackendError};
/// use outcache::http::{Request, Response, StatusCode};
///
/// fn assert_backend(_: &dyn Backend) {}
///
/// assert_backend(&|_req: Request| async { Ok::<_, BackendError>(Response::new(StatusCode::Ok)) });
/// ```
pub trait Backend: Send + Sync {
    fn invoke(&self, request: Request) -> BackendFuture<'_>;
}

impl<F, Fut> Backend for F
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response, BackendError>> + Send + 'static,
{
    fn invoke(&self, request: Request) -> BackendFuture<'_> {
        Box::pin(self(request))
    }
}

enum Coordination {
    /// Another request stored the entry while this one was waiting.
    Hit(Response),
    /// Call the backend, holding the guard if this request owns the key.
    Proceed(Option<LockGuard>),
}

/// HTTP output cache.
///
/// # Examples
///
/// ```
/// use outcache::cache::{BackendError, CachePolicy, OutputCache, OutputCacheOptions};
/// use outcache::http::{Method, Request, Response, StatusCode};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), BackendError> {
/// let options = OutputCacheOptions::default()
///     .route("/items", CachePolicy::new().vary_by_query("category").tag("catalog"));
/// let cache = OutputCache::new(options);
///
/// let backend = |_req: Request| async { Ok::<_, BackendError>(Response::new(StatusCode::Ok).body("shoes")) };
///
/// let first = cache.execute(Request::new(Method::Get, "/items?category=shoes"), backend).await?;
/// let second = cache.execute(Request::new(Method::Get, "/items?category=shoes"), backend).await?;
/// assert_eq!(first.body_bytes(), second.body_bytes());
/// assert!(second.headers().contains("age"));
///
/// cache.invalidate_by_tag("catalog").await.unwrap();
/// # Ok(())
/// # }
/// ```
pub struct OutputCache {
    store: Arc<dyn EntryStore>,
    locks: Arc<dyn RequestLockManager>,
    clock: Arc<dyn Clock>,
    composer: VaryKeyComposer,
    options: OutputCacheOptions,
}

impl OutputCache {
    /// An engine over an in-process [`MemoryStore`] bounded by `options.store`.
    pub fn new(options: OutputCacheOptions) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(MemoryStore::with_options(options.store, Arc::clone(&clock)));
        Self::with_parts(options, store, Arc::new(KeyedLockManager::new()), clock)
    }

    /// An engine over caller-supplied collaborators. The store should read the
    /// same clock as the engine.
    pub fn with_parts(
        options: OutputCacheOptions,
        store: Arc<dyn EntryStore>,
        locks: Arc<dyn RequestLockManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            locks,
            clock,
            composer: VaryKeyComposer::new(options.keys),
            options,
        }
    }

    pub fn options(&self) -> &OutputCacheOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<dyn EntryStore> {
        &self.store
    }

    /// Runs `request` through the cache under the policy of its route.
    pub async fn execute<F, Fut>(&self, request: Request, backend: F) -> Result<Response, BackendError>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, BackendError>>,
    {
        let mut ctx = CachingContext::new();
        self.execute_in(&mut ctx, request, backend).await
    }

    /// Like [`execute`](Self::execute), leaving the final state in `ctx`.
    pub async fn execute_in<F, Fut>(
        &self,
        ctx: &mut CachingContext,
        request: Request,
        backend: F,
    ) -> Result<Response, BackendError>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, BackendError>>,
    {
        let policy = self.options.policy_for(request.path());
        self.execute_with_policy(ctx, policy, request, backend).await
    }

    /// Runs `request` through the cache with a [`Backend`] trait object.
    pub async fn serve(&self, request: Request, backend: &dyn Backend) -> Result<Response, BackendError> {
        self.execute(request, |req| backend.invoke(req)).await
    }

    /// Runs `request` through the cache under an explicit `policy`.
    pub async fn execute_with_policy<F, Fut>(
        &self,
        ctx: &mut CachingContext,
        policy: &CachePolicy,
        request: Request,
        backend: F,
    ) -> Result<Response, BackendError>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, BackendError>>,
    {
        let request_cc = CacheControl::from_headers(request.headers());
        check_eligibility(ctx, policy, &request, &request_cc);

        if !(ctx.enable_caching && ctx.attempt_caching) {
            debug!(method = %request.method(), path = request.path(), "output caching not attempted");
            let response = backend(request).await?;
            ctx.advance(PipelineState::BackendInvoked);
            ctx.advance(PipelineState::Served);
            return Ok(response);
        }

        let base_key = self.composer.compute_base_key(&request);
        ctx.set_base_key(base_key.clone());
        self.resolve_final_key(ctx, &request, &base_key).await;

        if ctx.allow_lookup {
            if let Some(response) = self.lookup(ctx, &request, &request_cc).await {
                return Ok(response);
            }
        }
        ctx.advance(PipelineState::Miss);

        if request_cc.only_if_cached() {
            debug!(path = request.path(), "only-if-cached request missed");
            ctx.advance(PipelineState::Served);
            return Ok(Response::new(StatusCode::GatewayTimeout));
        }

        let guard = match self.coordinate(ctx, &request, &request_cc, &base_key).await {
            Coordination::Hit(response) => return Ok(response),
            Coordination::Proceed(guard) => guard,
        };

        // An error here drops the guard, which wakes any waiters.
        let response = backend(request.clone()).await?;
        ctx.advance(PipelineState::BackendInvoked);

        let response_cc = CacheControl::from_headers(response.headers());
        self.capture_response(ctx, &response, &response_cc);

        ctx.is_response_cacheable = match uncacheable_reason(ctx, policy, &response, &response_cc) {
            Some(reason) => {
                debug!(status = response.status().as_u16(), reason, "response not cacheable");
                false
            }
            None => true,
        };
        ctx.advance(PipelineState::CacheabilityChecked);

        if ctx.is_response_cacheable && self.store_response(ctx, policy, &base_key, &request, &response).await {
            ctx.advance(PipelineState::Stored);
        } else {
            ctx.advance(PipelineState::Skipped);
        }

        drop(guard);
        ctx.advance(PipelineState::Served);
        Ok(response)
    }

    /// Removes every entry tagged with `tag`.
    pub async fn invalidate_by_tag(&self, tag: &str) -> Result<usize, StoreError> {
        let removed = self.store.evict_by_tag(tag).await?;
        info!(tag, removed, "invalidated cached responses");
        Ok(removed)
    }

    /// Removes the entry `request` would currently be served from.
    pub async fn evict(&self, request: &Request) -> Result<(), StoreError> {
        let base_key = self.composer.compute_base_key(request);
        let mut rules = self.options.policy_for(request.path()).rules_for(request);
        if let Some(recorded) = self.store.try_get_vary_rules(&base_key).await? {
            rules.merge(&recorded);
        }
        let key = self.composer.compute_final_key(request, &rules);
        self.store.evict(key.as_str()).await?;
        info!(key = %key, path = request.path(), "evicted cached response");
        Ok(())
    }

    /// Folds the recorded vary rules for `base_key` into the context and
    /// recomputes the final key.
    async fn resolve_final_key(&self, ctx: &mut CachingContext, request: &Request, base_key: &str) {
        match self.store.try_get_vary_rules(base_key).await {
            Ok(Some(recorded)) => ctx.vary_by_rules.merge(&recorded),
            Ok(None) => {}
            Err(err) => warn!(error = %err, "vary rules lookup failed, using route defaults"),
        }
        ctx.set_final_key(self.composer.compute_final_key(request, &ctx.vary_by_rules));
    }

    async fn lookup(
        &self,
        ctx: &mut CachingContext,
        request: &Request,
        request_cc: &CacheControl,
    ) -> Option<Response> {
        let key = ctx.final_key()?.clone();
        let entry = match self.store.try_get(key.as_str()).await {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = %key, error = %err, "cache lookup failed, treating as miss");
                None
            }
        };
        ctx.advance(PipelineState::LookupAttempted);
        let entry = entry?;

        let freshness = evaluate(&entry, request_cc, self.clock.now());
        ctx.cached_entry_age = Some(freshness.age);
        ctx.is_entry_fresh = freshness.fresh;
        if !freshness.fresh {
            debug!(key = %key, age = ?freshness.age, "cached response is stale");
            return None;
        }

        ctx.advance(PipelineState::FreshServe);
        let response = replay(&entry, request, freshness.age);
        debug!(key = %key, status = response.status().as_u16(), age = ?freshness.age, "serving cached response");
        ctx.advance(PipelineState::Served);
        Some(response)
    }

    async fn coordinate(
        &self,
        ctx: &mut CachingContext,
        request: &Request,
        request_cc: &CacheControl,
        base_key: &str,
    ) -> Coordination {
        if !ctx.allow_locking {
            return Coordination::Proceed(None);
        }
        let Some(key) = ctx.final_key().cloned() else {
            return Coordination::Proceed(None);
        };

        let now = Instant::now();
        let bound = now
            .checked_add(self.options.lock_timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let deadline = ctx.deadline.map_or(bound, |deadline| deadline.min(bound));

        match self.locks.acquire_or_wait(key.as_str(), deadline).await {
            Ok(LockAcquisition::Owner(guard)) => {
                ctx.advance(PipelineState::Locked);
                // The previous owner may have stored between our miss and the acquire.
                if ctx.allow_lookup {
                    if let Some(response) = self.lookup(ctx, request, request_cc).await {
                        return Coordination::Hit(response);
                    }
                }
                Coordination::Proceed(Some(guard))
            }
            Ok(LockAcquisition::Released) => {
                debug!(key = %key, "in-flight request finished, looking up again");
                if ctx.allow_lookup {
                    self.resolve_final_key(ctx, request, base_key).await;
                    if let Some(response) = self.lookup(ctx, request, request_cc).await {
                        return Coordination::Hit(response);
                    }
                }
                ctx.advance(PipelineState::Miss);
                Coordination::Proceed(None)
            }
            Err(LockError::Timeout { key, waited }) => {
                warn!(key = %key, waited = ?waited, "request lock wait expired, invoking backend");
                Coordination::Proceed(None)
            }
        }
    }

    fn capture_response(&self, ctx: &mut CachingContext, response: &Response, response_cc: &CacheControl) {
        let headers = response.headers();
        ctx.response_time = Some(self.clock.now());
        ctx.response_date = headers.get("date").and_then(parse_date);
        // An unparseable `Expires` means already expired.
        ctx.response_expires = headers
            .get("expires")
            .map(|value| parse_date(value).unwrap_or(SystemTime::UNIX_EPOCH));
        ctx.response_max_age = response_cc.max_age();
        ctx.response_shared_max_age = response_cc.shared_max_age();
    }

    /// Stores the response. Returns `false` if nothing was written.
    async fn store_response(
        &self,
        ctx: &mut CachingContext,
        policy: &CachePolicy,
        base_key: &str,
        request: &Request,
        response: &Response,
    ) -> bool {
        for name in response.headers().get_list("vary") {
            ctx.vary_by_rules.add_header(name);
        }
        let key = self.composer.compute_final_key(request, &ctx.vary_by_rules);
        ctx.set_final_key(key.clone());

        let now = ctx.response_time.unwrap_or_else(|| self.clock.now());
        let mut headers = response.headers().clone();
        if !headers.contains("date") {
            headers.set("Date", httpdate::fmt_http_date(now));
        }
        ctx.cached_response_headers = headers;

        let declares_freshness = ctx.response_shared_max_age.is_some()
            || ctx.response_max_age.is_some()
            || ctx.response_expires.is_some();
        if ctx.response_expiration_override.is_none() && !declares_freshness {
            ctx.response_expiration_override = Some(policy.expiration);
        }
        ctx.tags.extend(policy.tags_for(request, response));

        let entry = StoredEntry::new(
            response.status(),
            &ctx.cached_response_headers,
            response.body_bytes().clone(),
            now,
        )
        .with_vary_by(ctx.vary_by_rules.clone())
        .with_tags(ctx.tags.iter().cloned())
        .with_response_date(ctx.response_date.or(Some(now)))
        .with_expires(ctx.response_expires)
        .with_max_age(ctx.response_max_age)
        .with_shared_max_age(ctx.response_shared_max_age)
        .with_expiration_override(ctx.response_expiration_override);

        let ttl = entry
            .lifetime()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(entry.age_at(now))
            .min(Duration::from_secs(MAX_DELTA_SECONDS));
        if ttl.is_zero() {
            debug!(key = %key, "response is already stale, not storing");
            return false;
        }

        if let Err(err) = self
            .store
            .set_vary_rules(base_key, ctx.vary_by_rules.without_custom(), ttl)
            .await
        {
            warn!(error = %err, "failed to record vary rules");
        }

        let status = response.status().as_u16();
        match self.store.set(key.as_str(), entry, ttl).await {
            Ok(()) => {
                info!(key = %key, status, ttl = ?ttl, tags = ?ctx.tags, "stored response");
                true
            }
            Err(err) => {
                warn!(key = %key, error = %err, "failed to store response");
                false
            }
        }
    }
}

fn check_eligibility(ctx: &mut CachingContext, policy: &CachePolicy, request: &Request, request_cc: &CacheControl) {
    ctx.enable_caching = policy.enabled;
    ctx.attempt_caching = policy.allows_method(request.method())
        && (policy.cache_authorized || !request.headers().contains("authorization"));
    ctx.allow_lookup = true;
    ctx.allow_storage = !request_cc.no_store();
    ctx.allow_locking = policy.locking;
    ctx.vary_by_rules = policy.rules_for(request);
    ctx.tags = policy.tags.iter().cloned().collect();
    if policy.override_response_freshness {
        ctx.response_expiration_override = Some(policy.expiration);
    }
    policy.run_request_hook(request, ctx);
    ctx.advance(PipelineState::EligibilityChecked);
}

fn uncacheable_reason(
    ctx: &CachingContext,
    policy: &CachePolicy,
    response: &Response,
    response_cc: &CacheControl,
) -> Option<&'static str> {
    let headers = response.headers();
    if !ctx.allow_storage {
        Some("storage not allowed for this request")
    } else if !policy.allows_status(response.status()) {
        Some("status not cacheable")
    } else if response_cc.no_store() || response_cc.no_cache() {
        Some("response forbids caching")
    } else if response_cc.is_private() {
        Some("response is private")
    } else if headers.contains("set-cookie") {
        Some("response sets cookies")
    } else if headers.get_list("vary").any(|name| name == "*") {
        Some("response varies on everything")
    } else if !response.trailers().is_empty() {
        Some("response has trailers")
    } else if response.body_bytes().len() > policy.max_body_size {
        Some("body exceeds the size limit")
    } else {
        None
    }
}

/// Builds the response for a fresh hit, answering conditional requests with
/// `304 Not Modified`.
fn replay(entry: &StoredEntry, request: &Request, age: Duration) -> Response {
    if !is_not_modified(entry, request) {
        return entry.to_response(age);
    }
    let mut headers = Headers::new();
    for name in NOT_MODIFIED_HEADERS {
        for value in entry.headers().get_all(name) {
            headers.insert(name, value);
        }
    }
    headers.set("Age", age.as_secs().to_string());
    Response::from_parts(StatusCode::NotModified, headers, Bytes::new())
}

fn is_not_modified(entry: &StoredEntry, request: &Request) -> bool {
    let headers = request.headers();
    if headers.contains("if-none-match") {
        // `If-Modified-Since` is ignored when `If-None-Match` is present.
        return headers.get_list("if-none-match").any(|tag| {
            tag == "*" || entry.etag().is_some_and(|etag| weak_tag(tag) == weak_tag(etag))
        });
    }
    match (headers.get("if-modified-since").and_then(parse_date), entry.last_modified()) {
        (Some(since), Some(modified)) => modified <= since,
        _ => false,
    }
}

fn weak_tag(tag: &str) -> &str {
    tag.trim().trim_start_matches("W/")
}

fn parse_date(value: &str) -> Option<SystemTime> {
    httpdate::parse_http_date(value).ok()
}
