//! Immutable snapshot of a cached response.

use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use bytes::Bytes;

use super::key::VaryByRules;
use crate::http::{Headers, Response, StatusCode};

/// Headers that describe one connection or one hop and never belong in a
/// stored response, plus fields recomputed on every replay.
const UNSTORED_HEADERS: [&str; 11] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "set-cookie",
    "age",
];

/// Returns `true` when `name` may be stored with a cached response.
pub fn is_storable_header(name: &str) -> bool {
    !UNSTORED_HEADERS
        .iter()
        .any(|unstored| unstored.eq_ignore_ascii_case(name))
}

/// A stored response plus the metadata the freshness evaluator needs.
///
/// Built once per successful store and shared as `Arc<StoredEntry>`; a
/// re-store replaces the whole value.
#[derive(Debug, Clone)]
pub struct StoredEntry {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    vary_by: VaryByRules,
    tags: HashSet<String>,
    response_date: Option<SystemTime>,
    response_expires: Option<SystemTime>,
    max_age: Option<Duration>,
    shared_max_age: Option<Duration>,
    expiration_override: Option<Duration>,
    created_at: SystemTime,
}

impl StoredEntry {
    /// Captures a response. Unstorable headers are dropped here.
    pub fn new(status: StatusCode, headers: &Headers, body: Bytes, created_at: SystemTime) -> Self {
        let mut headers = headers.clone();
        headers.retain(|name, _| is_storable_header(name));
        Self {
            status,
            headers,
            body,
            vary_by: VaryByRules::default(),
            tags: HashSet::new(),
            response_date: None,
            response_expires: None,
            max_age: None,
            shared_max_age: None,
            expiration_override: None,
            created_at,
        }
    }

    #[must_use]
    pub fn with_vary_by(mut self, rules: VaryByRules) -> Self {
        self.vary_by = rules;
        self
    }

    #[must_use]
    pub fn with_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    #[must_use]
    pub fn with_response_date(mut self, date: Option<SystemTime>) -> Self {
        self.response_date = date;
        self
    }

    #[must_use]
    pub fn with_expires(mut self, expires: Option<SystemTime>) -> Self {
        self.response_expires = expires;
        self
    }

    #[must_use]
    pub fn with_max_age(mut self, max_age: Option<Duration>) -> Self {
        self.max_age = max_age;
        self
    }

    #[must_use]
    pub fn with_shared_max_age(mut self, shared_max_age: Option<Duration>) -> Self {
        self.shared_max_age = shared_max_age;
        self
    }

    #[must_use]
    pub fn with_expiration_override(mut self, expiration: Option<Duration>) -> Self {
        self.expiration_override = expiration;
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn vary_by(&self) -> &VaryByRules {
        &self.vary_by
    }

    pub fn tags(&self) -> &HashSet<String> {
        &self.tags
    }

    pub fn response_date(&self) -> Option<SystemTime> {
        self.response_date
    }

    pub fn response_expires(&self) -> Option<SystemTime> {
        self.response_expires
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }

    pub fn shared_max_age(&self) -> Option<Duration> {
        self.shared_max_age
    }

    pub fn expiration_override(&self) -> Option<Duration> {
        self.expiration_override
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// The instant ages are measured from: the response `Date`, else creation.
    pub fn origin_time(&self) -> SystemTime {
        self.response_date.unwrap_or(self.created_at)
    }

    /// Freshness lifetime. Explicit override first, then `s-maxage`,
    /// `max-age`, and finally `Expires - Date`. `None` means the entry was
    /// never fresh.
    pub fn lifetime(&self) -> Option<Duration> {
        self.expiration_override
            .or(self.shared_max_age)
            .or(self.max_age)
            .or_else(|| {
                let expires = self.response_expires?;
                // An `Expires` at or before `Date` is a zero lifetime.
                Some(
                    expires
                        .duration_since(self.origin_time())
                        .unwrap_or(Duration::ZERO),
                )
            })
    }

    /// Age at `now`, clamped to zero when the clock is behind the origin.
    pub fn age_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.origin_time())
            .unwrap_or(Duration::ZERO)
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get("etag")
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.headers
            .get("last-modified")
            .and_then(|v| httpdate::parse_http_date(v).ok())
    }

    /// Approximate memory footprint used for store size limits.
    pub fn size(&self) -> usize {
        self.body.len() + self.headers.byte_size()
    }

    /// Replays the entry as a response carrying an `Age` header.
    pub fn to_response(&self, age: Duration) -> Response {
        let mut response = Response::from_parts(self.status, self.headers.clone(), self.body.clone());
        response.headers_mut().set("Age", age.as_secs().to_string());
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch_plus(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn hop_by_hop_and_cookies_are_not_stored() {
        let headers: Headers = [
            ("Content-Type", "text/plain"),
            ("Connection", "keep-alive"),
            ("Set-Cookie", "session=1"),
            ("Age", "12"),
        ]
        .into_iter()
        .collect();
        let entry = StoredEntry::new(StatusCode::Ok, &headers, Bytes::new(), epoch_plus(0));
        assert_eq!(entry.headers().len(), 1);
        assert!(entry.headers().contains("content-type"));
    }

    #[test]
    fn lifetime_prefers_override_then_shared_then_max_age() {
        let base = StoredEntry::new(StatusCode::Ok, &Headers::new(), Bytes::new(), epoch_plus(0))
            .with_max_age(Some(Duration::from_secs(60)));
        assert_eq!(base.lifetime(), Some(Duration::from_secs(60)));

        let shared = base.clone().with_shared_max_age(Some(Duration::from_secs(30)));
        assert_eq!(shared.lifetime(), Some(Duration::from_secs(30)));

        let overridden = shared.with_expiration_override(Some(Duration::from_secs(5)));
        assert_eq!(overridden.lifetime(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn lifetime_from_expires_minus_date() {
        let entry = StoredEntry::new(StatusCode::Ok, &Headers::new(), Bytes::new(), epoch_plus(0))
            .with_response_date(Some(epoch_plus(100)))
            .with_expires(Some(epoch_plus(145)));
        assert_eq!(entry.lifetime(), Some(Duration::from_secs(45)));

        let past = entry.with_expires(Some(epoch_plus(50)));
        assert_eq!(past.lifetime(), Some(Duration::ZERO));
    }

    #[test]
    fn replay_sets_age_header() {
        let entry = StoredEntry::new(StatusCode::Ok, &Headers::new(), Bytes::from("x"), epoch_plus(0));
        let response = entry.to_response(Duration::from_millis(12_900));
        assert_eq!(response.headers().get("age"), Some("12"));
        assert_eq!(response.body_bytes().as_ref(), b"x");
    }
}
