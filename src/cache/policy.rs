//! Caching policies and engine options.
//!
//! A [`CachePolicy`] is the per-route configuration surface: whether caching
//! is on, which methods and statuses qualify, how long entries live, which
//! dimensions they vary by, how they are tagged and whether misses are
//! collapsed behind a request lock. The serializable part loads from JSON
//! through [`OutputCacheOptions::from_json`]; hooks are attached in code.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use super::context::CachingContext;
use super::error::ConfigError;
use super::key::{KeyOptions, VaryByRules};
use super::memory::MemoryStoreOptions;
use crate::http::{Method, Request, Response, StatusCode};

/// Derives tags from a request and the response produced for it.
pub type TagPolicy = Arc<dyn Fn(&Request, &Response) -> Vec<String> + Send + Sync>;

/// Derives the value of a custom vary dimension from a request.
pub type ValueProvider = Arc<dyn Fn(&Request) -> String + Send + Sync>;

/// Adjusts the caching flags of a request before lookup.
pub type RequestHook = Arc<dyn Fn(&Request, &mut CachingContext) + Send + Sync>;

fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_secs)
}

#[derive(Clone, Default)]
struct PolicyHooks {
    tag_policy: Option<TagPolicy>,
    vary_values: Vec<(String, ValueProvider)>,
    on_request: Option<RequestHook>,
}

impl fmt::Debug for PolicyHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyHooks")
            .field("tag_policy", &self.tag_policy.is_some())
            .field(
                "vary_values",
                &self.vary_values.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("on_request", &self.on_request.is_some())
            .finish()
    }
}

/// Caching behavior for one route (or for every route, as the base policy).
///
/// Defaults: enabled, `GET`/`HEAD`, status `200` only, 60 second expiration,
/// 64 MiB body limit, locking on, requests carrying `Authorization` not cached.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use outcache::cache::CachePolicy;
///
/// let policy = CachePolicy::new()
///     .expire(Duration::from_secs(300))
///     .vary_by_query("category")
///     .vary_by_header("Accept-Language")
///     .tag("catalog");
///
/// assert_eq!(policy.expiration, Duration::from_secs(300));
/// assert_eq!(policy.tags, vec!["catalog".to_string()]);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    /// Whether output caching applies to the route at all.
    pub enabled: bool,
    /// Methods whose responses may be cached, compared case-insensitively.
    pub methods: Vec<String>,
    /// Response statuses that may be stored.
    pub statuses: Vec<u16>,
    /// Largest body that will be stored, in bytes.
    pub max_body_size: usize,
    /// Lifetime given to responses that carry no freshness information.
    #[serde(deserialize_with = "seconds")]
    pub expiration: Duration,
    /// Forces `expiration` even when the response carries its own freshness.
    pub override_response_freshness: bool,
    /// Default vary rules for the route.
    pub vary: VaryByRules,
    /// Tags attached to every entry stored under this policy.
    pub tags: Vec<String>,
    /// Collapse concurrent misses for the same key into one backend call.
    pub locking: bool,
    /// Cache requests that carry an `Authorization` header.
    pub cache_authorized: bool,
    #[serde(skip)]
    hooks: PolicyHooks,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            methods: vec!["GET".to_string(), "HEAD".to_string()],
            statuses: vec![200],
            max_body_size: 64 * 1024 * 1024,
            expiration: Duration::from_secs(60),
            override_response_freshness: false,
            vary: VaryByRules::default(),
            tags: Vec::new(),
            locking: true,
            cache_authorized: false,
            hooks: PolicyHooks::default(),
        }
    }
}

impl CachePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that turns output caching off.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Sets the default lifetime.
    #[must_use]
    pub fn expire(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    /// Uses the policy lifetime even when the response declares its own.
    #[must_use]
    pub fn override_freshness(mut self) -> Self {
        self.override_response_freshness = true;
        self
    }

    #[must_use]
    pub fn vary_by_header(mut self, name: impl AsRef<str>) -> Self {
        self.vary = self.vary.header(name);
        self
    }

    #[must_use]
    pub fn vary_by_query(mut self, name: impl Into<String>) -> Self {
        self.vary = self.vary.query(name);
        self
    }

    #[must_use]
    pub fn vary_by_all_query(mut self) -> Self {
        self.vary = self.vary.all_query();
        self
    }

    /// Adds a custom vary dimension computed from each request.
    #[must_use]
    pub fn vary_by_value<F>(mut self, name: impl Into<String>, provider: F) -> Self
    where
        F: Fn(&Request) -> String + Send + Sync + 'static,
    {
        self.hooks.vary_values.push((name.into(), Arc::new(provider)));
        self
    }

    /// Adds a static tag.
    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    /// Installs a function computing extra tags from the request and response.
    #[must_use]
    pub fn tag_with<F>(mut self, policy: F) -> Self
    where
        F: Fn(&Request, &Response) -> Vec<String> + Send + Sync + 'static,
    {
        self.hooks.tag_policy = Some(Arc::new(policy));
        self
    }

    #[must_use]
    pub fn locking(mut self, enabled: bool) -> Self {
        self.locking = enabled;
        self
    }

    /// Replaces the cacheable status set.
    #[must_use]
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = StatusCode>) -> Self {
        self.statuses = statuses.into_iter().map(StatusCode::as_u16).collect();
        self
    }

    /// Replaces the cacheable method set.
    #[must_use]
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = methods.into_iter().map(|m| m.canonical()).collect();
        self
    }

    #[must_use]
    pub fn max_body_size(mut self, bytes: usize) -> Self {
        self.max_body_size = bytes;
        self
    }

    #[must_use]
    pub fn cache_authorized(mut self, allowed: bool) -> Self {
        self.cache_authorized = allowed;
        self
    }

    /// Installs a hook that may adjust the context flags of each request.
    #[must_use]
    pub fn on_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Request, &mut CachingContext) + Send + Sync + 'static,
    {
        self.hooks.on_request = Some(Arc::new(hook));
        self
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    pub fn allows_status(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status.as_u16())
    }

    /// Route vary rules with the custom dimensions resolved for `request`.
    pub fn rules_for(&self, request: &Request) -> VaryByRules {
        let mut rules = self.vary.without_custom();
        for (name, provider) in &self.hooks.vary_values {
            rules.set_custom(name.clone(), provider(request));
        }
        rules
    }

    /// Static tags plus whatever the tag policy derives.
    pub fn tags_for(&self, request: &Request, response: &Response) -> Vec<String> {
        let mut tags = self.tags.clone();
        if let Some(policy) = &self.hooks.tag_policy {
            tags.extend(policy(request, response));
        }
        tags
    }

    pub(crate) fn run_request_hook(&self, request: &Request, ctx: &mut CachingContext) {
        if let Some(hook) = &self.hooks.on_request {
            hook(request, ctx);
        }
    }
}

/// A policy bound to a path prefix.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutePolicy {
    /// Path prefix, matched on segment boundaries (`/items` matches
    /// `/items` and `/items/9`, not `/itemsets`). Case-insensitive unless
    /// [`KeyOptions::case_sensitive_paths`] is set, the same rule the base key
    /// follows.
    pub path: String,
    #[serde(default)]
    pub policy: CachePolicy,
}

impl RoutePolicy {
    fn matches(&self, path: &str, case_sensitive: bool) -> bool {
        let prefix = self.path.trim_end_matches('/');
        if prefix.is_empty() {
            return true;
        }
        if path.len() < prefix.len() || !path.is_char_boundary(prefix.len()) {
            return false;
        }
        let (head, rest) = path.split_at(prefix.len());
        let head_matches = if case_sensitive {
            head == prefix
        } else {
            head.to_uppercase() == prefix.to_uppercase()
        };
        head_matches && (rest.is_empty() || rest.starts_with('/'))
    }
}

/// Engine-wide options.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use outcache::cache::OutputCacheOptions;
///
/// let options = OutputCacheOptions::from_json(r#"{
///     "base_policy": { "expiration": 30 },
///     "routes": [
///         { "path": "/items", "policy": { "expiration": 120, "vary": { "query": { "names": ["category"] } } } },
///         { "path": "/admin", "policy": { "enabled": false } }
///     ],
///     "lock_timeout": 5
/// }"#).unwrap();
///
/// assert_eq!(options.policy_for("/items/9").expiration, Duration::from_secs(120));
/// assert!(!options.policy_for("/admin").enabled);
/// assert_eq!(options.policy_for("/other").expiration, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputCacheOptions {
    /// Applies to every path without a more specific route policy.
    pub base_policy: CachePolicy,
    pub routes: Vec<RoutePolicy>,
    pub keys: KeyOptions,
    /// Upper bound on how long a request waits for another's execution.
    #[serde(deserialize_with = "seconds")]
    pub lock_timeout: Duration,
    /// Bounds used when the engine builds its own [`MemoryStore`](super::MemoryStore).
    pub store: MemoryStoreOptions,
}

impl Default for OutputCacheOptions {
    fn default() -> Self {
        Self {
            base_policy: CachePolicy::default(),
            routes: Vec::new(),
            keys: KeyOptions::default(),
            lock_timeout: Duration::from_secs(30),
            store: MemoryStoreOptions::default(),
        }
    }
}

impl OutputCacheOptions {
    /// Parses options from JSON and validates status codes.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)?;
        let policies = std::iter::once(&options.base_policy).chain(options.routes.iter().map(|r| &r.policy));
        for policy in policies {
            if let Some(bad) = policy
                .statuses
                .iter()
                .copied()
                .find(|code| StatusCode::from_u16(*code).is_none())
            {
                return Err(ConfigError::UnknownStatus(bad));
            }
        }
        Ok(options)
    }

    /// Adds a route policy.
    #[must_use]
    pub fn route(mut self, path: impl Into<String>, policy: CachePolicy) -> Self {
        self.routes.push(RoutePolicy {
            path: path.into(),
            policy,
        });
        self
    }

    /// Replaces the base policy.
    #[must_use]
    pub fn base(mut self, policy: CachePolicy) -> Self {
        self.base_policy = policy;
        self
    }

    /// The most specific route policy for `path`, else the base policy.
    pub fn policy_for(&self, path: &str) -> &CachePolicy {
        self.routes
            .iter()
            .filter(|route| route.matches(path, self.keys.case_sensitive_paths))
            .max_by_key(|route| route.path.trim_end_matches('/').len())
            .map(|route| &route.policy)
            .unwrap_or(&self.base_policy)
    }
}
