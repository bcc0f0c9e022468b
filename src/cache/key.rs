//! Cache key composition.
//!
//! A resource is first addressed by its *base key* (method, host, path). The
//! base key finds the vary record that says which request dimensions select
//! a variant; the *final key* folds those dimensions in and is hashed.
//!
//! Canonical form of the final key, before hashing:
//!
//! ```text
//! BASE \x1e H \x1e accept-language=en \x1e x-tenant      <- absent header, no '='
//!      \x1e Q \x1e category=shoes \x1e size=9\x1f10
//!      \x1e C \x1e region=eu
//! ```
//!
//! `\x1e` separates segments and `\x1f` joins the values of one name. Neither
//! byte can appear in a header name, a parsed query string or a canonical
//! method/path.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::http::Request;

const KEY_DELIMITER: char = '\x1e';
const VALUE_DELIMITER: char = '\x1f';

/// Which query parameters select a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryVary {
    /// Only the named parameters.
    Names(Vec<String>),
    /// Every parameter present on the request.
    All,
}

impl Default for QueryVary {
    fn default() -> Self {
        Self::Names(Vec::new())
    }
}

/// The request dimensions whose values select distinct cache entries for the
/// same base resource.
///
/// Header names compare case-insensitively. Custom dimensions are values the
/// route derives from the request (tenant, feature flag, ...) and are hashed
/// in registration order.
///
/// # Examples
///
/// ```
/// use outcache::cache::{QueryVary, VaryByRules};
///
/// let rules = VaryByRules::new()
///     .header("Accept-Language")
///     .query("category")
///     .custom("region", "eu");
///
/// assert_eq!(rules.headers(), ["accept-language"]);
/// assert_eq!(rules.query_vary(), &QueryVary::Names(vec!["category".into()]));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaryByRules {
    #[serde(default)]
    headers: Vec<String>,
    #[serde(default)]
    query: QueryVary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    custom: Vec<(String, String)>,
}

impl VaryByRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header dimension. Duplicates are ignored.
    #[must_use]
    pub fn header(mut self, name: impl AsRef<str>) -> Self {
        self.add_header(name.as_ref());
        self
    }

    /// Adds a query parameter dimension. No-op once varying by all parameters.
    #[must_use]
    pub fn query(mut self, name: impl Into<String>) -> Self {
        self.add_query(name.into());
        self
    }

    /// Varies by every query parameter.
    #[must_use]
    pub fn all_query(mut self) -> Self {
        self.query = QueryVary::All;
        self
    }

    /// Adds a custom dimension with its value for the current request.
    #[must_use]
    pub fn custom(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_custom(name.into(), value.into());
        self
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn query_vary(&self) -> &QueryVary {
        &self.query
    }

    pub fn custom_values(&self) -> &[(String, String)] {
        &self.custom
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
            && self.custom.is_empty()
            && matches!(&self.query, QueryVary::Names(n) if n.is_empty())
    }

    pub(crate) fn add_header(&mut self, name: &str) {
        let name = name.trim().to_ascii_lowercase();
        if !name.is_empty() && !self.headers.contains(&name) {
            self.headers.push(name);
        }
    }

    fn add_query(&mut self, name: String) {
        if let QueryVary::Names(names) = &mut self.query {
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    pub(crate) fn set_custom(&mut self, name: String, value: String) {
        match self.custom.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.custom.push((name, value)),
        }
    }

    /// Unions the header and query dimensions of `other` into `self`.
    ///
    /// Custom values are request-specific and are taken from `self` only.
    pub fn merge(&mut self, other: &VaryByRules) {
        for header in &other.headers {
            self.add_header(header);
        }
        match &other.query {
            QueryVary::All => self.query = QueryVary::All,
            QueryVary::Names(names) => {
                for name in names {
                    self.add_query(name.clone());
                }
            }
        }
    }

    /// The rules minus the per-request custom values; this is what gets
    /// recorded against a base key.
    pub fn without_custom(&self) -> VaryByRules {
        VaryByRules {
            headers: self.headers.clone(),
            query: self.query.clone(),
            custom: Vec::new(),
        }
    }

    /// `true` when every header/query dimension of `self` is already in `other`.
    pub(crate) fn is_covered_by(&self, other: &VaryByRules) -> bool {
        let headers = self.headers.iter().all(|h| other.headers.contains(h));
        let query = match (&self.query, &other.query) {
            (_, QueryVary::All) => true,
            (QueryVary::All, QueryVary::Names(_)) => false,
            (QueryVary::Names(mine), QueryVary::Names(theirs)) => {
                mine.iter().all(|n| theirs.contains(n))
            }
        };
        headers && query
    }
}

/// Knobs that shape the base key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyOptions {
    /// Keep path case as received. Paths are uppercased otherwise.
    pub case_sensitive_paths: bool,
    /// Include the `Host` header in the base key.
    pub vary_by_host: bool,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            case_sensitive_paths: false,
            vary_by_host: true,
        }
    }
}

/// A hashed final cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Builds base and final keys from requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct VaryKeyComposer {
    options: KeyOptions,
}

impl VaryKeyComposer {
    pub fn new(options: KeyOptions) -> Self {
        Self { options }
    }

    /// Method, host and path. Known before any vary rules are resolved.
    pub fn compute_base_key(&self, request: &Request) -> String {
        let host = if self.options.vary_by_host {
            request
                .headers()
                .get("host")
                .map(str::to_ascii_lowercase)
                .unwrap_or_default()
        } else {
            String::new()
        };
        let path = if self.options.case_sensitive_paths {
            request.path().to_owned()
        } else {
            request.path().to_uppercase()
        };

        let method = request.method().canonical();
        let mut key = String::with_capacity(method.len() + host.len() + path.len() + 2);
        key.push_str(&method);
        key.push(KEY_DELIMITER);
        key.push_str(&host);
        key.push(KEY_DELIMITER);
        key.push_str(&path);
        key
    }

    /// Canonical pre-hash string for `request` under `rules`.
    pub fn canonical_string(&self, request: &Request, rules: &VaryByRules) -> String {
        let mut out = self.compute_base_key(request);

        out.push(KEY_DELIMITER);
        out.push('H');
        let mut headers: Vec<&String> = rules.headers.iter().collect();
        headers.sort();
        headers.dedup();
        for name in headers {
            let mut values = request.headers().get_all(name).peekable();
            push_segment(&mut out, name, values.peek().is_some().then_some(values));
        }

        out.push(KEY_DELIMITER);
        out.push('Q');
        match &rules.query {
            QueryVary::All => {
                let mut pairs: Vec<(&str, &str)> = request.query_pairs().collect();
                pairs.sort();
                for (name, value) in pairs {
                    push_segment(&mut out, name, Some(std::iter::once(value)));
                }
            }
            QueryVary::Names(names) => {
                let mut names: Vec<&String> = names.iter().collect();
                names.sort();
                names.dedup();
                for name in names {
                    let mut values = request.query_values(name).peekable();
                    push_segment(&mut out, name, values.peek().is_some().then_some(values));
                }
            }
        }

        out.push(KEY_DELIMITER);
        out.push('C');
        for (name, value) in &rules.custom {
            push_segment(&mut out, name, Some(std::iter::once(value.as_str())));
        }

        out
    }

    /// Hashes the canonical string with SHA-256.
    ///
    /// # Examples
    ///
    /// ```
    /// use outcache::cache::{KeyOptions, VaryByRules, VaryKeyComposer};
    /// use outcache::http::{Method, Request};
    ///
    /// let composer = VaryKeyComposer::new(KeyOptions::default());
    /// let rules = VaryByRules::new().query("category");
    ///
    /// let shoes = Request::new(Method::Get, "/items?category=shoes&utm=x");
    /// let shoes_again = Request::new(Method::Get, "/items?utm=y&category=shoes");
    /// let hats = Request::new(Method::Get, "/items?category=hats");
    ///
    /// let key = composer.compute_final_key(&shoes, &rules);
    /// assert_eq!(key, composer.compute_final_key(&shoes_again, &rules));
    /// assert_ne!(key, composer.compute_final_key(&hats, &rules));
    /// ```
    pub fn compute_final_key(&self, request: &Request, rules: &VaryByRules) -> CacheKey {
        let canonical = self.canonical_string(request, rules);
        CacheKey(hex::encode(Sha256::digest(canonical.as_bytes())))
    }
}

// `name` alone marks an absent dimension; `name=` is a present-but-empty one.
fn push_segment<'a>(out: &mut String, name: &str, values: Option<impl Iterator<Item = &'a str>>) {
    out.push(KEY_DELIMITER);
    out.push_str(name);
    let Some(values) = values else {
        return;
    };
    out.push('=');
    for (i, value) in values.enumerate() {
        if i > 0 {
            out.push(VALUE_DELIMITER);
        }
        out.push_str(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Method;

    fn composer() -> VaryKeyComposer {
        VaryKeyComposer::new(KeyOptions::default())
    }

    fn get(target: &str) -> Request {
        Request::new(Method::Get, target).header("Host", "Shop.Example")
    }

    #[test]
    fn base_key_uppercases_method_and_path() {
        let req = Request::new(Method::Custom("get".into()), "/Items/").header("host", "A");
        assert_eq!(composer().compute_base_key(&req), "GET\x1ea\x1e/ITEMS/");
    }

    #[test]
    fn base_key_respects_case_sensitive_paths_and_host_option() {
        let c = VaryKeyComposer::new(KeyOptions {
            case_sensitive_paths: true,
            vary_by_host: false,
        });
        assert_eq!(c.compute_base_key(&get("/Items")), "GET\x1e\x1e/Items");
    }

    #[test]
    fn unnamed_header_does_not_change_key() {
        let rules = VaryByRules::new().header("Accept-Language");
        let a = get("/items").header("Accept-Language", "en").header("X-Trace", "1");
        let b = get("/items").header("accept-language", "en").header("X-Trace", "2");
        assert_eq!(
            composer().compute_final_key(&a, &rules),
            composer().compute_final_key(&b, &rules)
        );
    }

    #[test]
    fn named_header_with_different_values_changes_key() {
        let rules = VaryByRules::new().header("Accept-Language");
        let en = get("/items").header("Accept-Language", "en");
        let fr = get("/items").header("Accept-Language", "fr");
        assert_ne!(
            composer().compute_final_key(&en, &rules),
            composer().compute_final_key(&fr, &rules)
        );
    }

    #[test]
    fn absent_header_differs_from_empty_header() {
        let rules = VaryByRules::new().header("X-Tenant");
        let absent = get("/items");
        let empty = get("/items").header("X-Tenant", "");
        assert_ne!(
            composer().compute_final_key(&absent, &rules),
            composer().compute_final_key(&empty, &rules)
        );
    }

    #[test]
    fn header_rule_order_does_not_matter() {
        let ab = VaryByRules::new().header("A").header("B");
        let ba = VaryByRules::new().header("b").header("a");
        let req = get("/").header("A", "1").header("B", "2");
        assert_eq!(
            composer().compute_final_key(&req, &ab),
            composer().compute_final_key(&req, &ba)
        );
    }

    #[test]
    fn vary_by_all_query_sorts_by_name_then_value() {
        let rules = VaryByRules::new().all_query();
        let c = composer();
        let canonical = c.canonical_string(&get("/s?b=2&a=9&a=1"), &rules);
        assert!(canonical.ends_with("\x1eQ\x1ea=1\x1ea=9\x1eb=2\x1eC"));
        assert_eq!(
            c.compute_final_key(&get("/s?b=2&a=9&a=1"), &rules),
            c.compute_final_key(&get("/s?a=1&b=2&a=9"), &rules)
        );
    }

    #[test]
    fn named_query_joins_repeated_values() {
        let rules = VaryByRules::new().query("size");
        let canonical = composer().canonical_string(&get("/s?size=9&size=10"), &rules);
        assert!(canonical.contains("\x1esize=9\x1f10"));
    }

    #[test]
    fn custom_dimensions_keep_registration_order() {
        let rules = VaryByRules::new().custom("z", "1").custom("a", "2");
        let canonical = composer().canonical_string(&get("/"), &rules);
        assert!(canonical.ends_with("\x1eC\x1ez=1\x1ea=2"));
    }

    #[test]
    fn final_key_is_sha256_hex() {
        let key = composer().compute_final_key(&get("/"), &VaryByRules::new());
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn merge_unions_dimensions_but_keeps_own_custom_values() {
        let mut mine = VaryByRules::new().header("a").custom("tenant", "t1");
        let theirs = VaryByRules::new().header("B").query("q").custom("tenant", "t2");
        mine.merge(&theirs);
        assert_eq!(mine.headers(), ["a", "b"]);
        assert_eq!(mine.query_vary(), &QueryVary::Names(vec!["q".into()]));
        assert_eq!(mine.custom_values(), [("tenant".to_string(), "t1".to_string())]);
        assert!(theirs.without_custom().is_covered_by(&mine));
    }

    #[test]
    fn named_query_is_ignored_after_all() {
        let rules = VaryByRules::new().all_query().query("x");
        assert_eq!(rules.query_vary(), &QueryVary::All);
    }
}
