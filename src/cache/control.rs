//! `Cache-Control` parsing for both request and response directives.

use std::time::Duration;

use crate::http::Headers;

/// Largest delta-seconds value honored. Larger values, including ones that
/// overflow `u64`, read as this (RFC 9111 §1.2.2).
pub const MAX_DELTA_SECONDS: u64 = 1 << 31;

fn delta_seconds(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(value.parse::<u64>().map_or(MAX_DELTA_SECONDS, |s| s.min(MAX_DELTA_SECONDS)))
}

/// A single `Cache-Control` directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Public,
    Private,
    NoStore,
    NoCache,
    /// Parsed but never acted on: stale entries are not served at all.
    MustRevalidate,
    OnlyIfCached,
    MaxAge(u64),
    SMaxAge(u64),
    MinFresh(u64),
    /// Anything the engine does not act on, kept for diagnostics.
    Extension(String),
}

impl Directive {
    /// Parses one comma-separated token. Returns `None` for a valued directive
    /// whose value is not a non-negative integer, which RFC 9111 §4.2.1 says
    /// must be ignored.
    pub fn parse(token: &str) -> Option<Self> {
        let token = token.trim().to_ascii_lowercase();

        if let Some((name, value)) = token.split_once('=') {
            let value = value.trim().trim_matches('"');
            let seconds = || delta_seconds(value);
            return match name.trim() {
                "max-age" => seconds().map(Self::MaxAge),
                "s-maxage" => seconds().map(Self::SMaxAge),
                "min-fresh" => seconds().map(Self::MinFresh),
                // `private="Set-Cookie"` still makes the response private.
                "private" => Some(Self::Private),
                "no-cache" => Some(Self::NoCache),
                _ => Some(Self::Extension(token.clone())),
            };
        }

        Some(match token.as_str() {
            "public" => Self::Public,
            "private" => Self::Private,
            "no-store" => Self::NoStore,
            "no-cache" => Self::NoCache,
            "must-revalidate" => Self::MustRevalidate,
            "only-if-cached" => Self::OnlyIfCached,
            _ => Self::Extension(token),
        })
    }
}

/// Parsed `Cache-Control` header.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use outcache::cache::CacheControl;
///
/// let cc = CacheControl::parse("public, max-age=60, s-maxage=30");
/// assert_eq!(cc.max_age(), Some(Duration::from_secs(60)));
/// assert_eq!(cc.shared_max_age(), Some(Duration::from_secs(30)));
/// assert!(!cc.no_store());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    directives: Vec<Directive>,
}

impl CacheControl {
    /// Parses a single header value.
    pub fn parse(value: &str) -> Self {
        Self {
            directives: value.split(',').filter_map(Directive::parse).collect(),
        }
    }

    /// Collects every `Cache-Control` value in `headers`.
    ///
    /// For requests without `Cache-Control`, `Pragma: no-cache` is read as
    /// `Cache-Control: no-cache` (RFC 9111 §5.4).
    pub fn from_headers(headers: &Headers) -> Self {
        let directives: Vec<Directive> = headers
            .get_list("cache-control")
            .filter_map(Directive::parse)
            .collect();

        if directives.is_empty()
            && headers
                .get_list("pragma")
                .any(|p| p.eq_ignore_ascii_case("no-cache"))
        {
            return Self {
                directives: vec![Directive::NoCache],
            };
        }

        Self { directives }
    }

    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    fn has(&self, directive: &Directive) -> bool {
        self.directives.contains(directive)
    }

    pub fn no_cache(&self) -> bool {
        self.has(&Directive::NoCache)
    }

    pub fn no_store(&self) -> bool {
        self.has(&Directive::NoStore)
    }

    pub fn is_private(&self) -> bool {
        self.has(&Directive::Private)
    }

    pub fn only_if_cached(&self) -> bool {
        self.has(&Directive::OnlyIfCached)
    }

    /// `max-age`, first occurrence wins.
    pub fn max_age(&self) -> Option<Duration> {
        self.directives.iter().find_map(|d| match d {
            Directive::MaxAge(s) => Some(Duration::from_secs(*s)),
            _ => None,
        })
    }

    /// `s-maxage`, first occurrence wins.
    pub fn shared_max_age(&self) -> Option<Duration> {
        self.directives.iter().find_map(|d| match d {
            Directive::SMaxAge(s) => Some(Duration::from_secs(*s)),
            _ => None,
        })
    }

    pub fn min_fresh(&self) -> Option<Duration> {
        self.directives.iter().find_map(|d| match d {
            Directive::MinFresh(s) => Some(Duration::from_secs(*s)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_case_and_quoted_values() {
        let cc = CacheControl::parse(r#"Public, MAX-AGE="120", must-revalidate"#);
        assert_eq!(cc.max_age(), Some(Duration::from_secs(120)));
        assert!(cc.directives().contains(&Directive::MustRevalidate));
        assert!(cc.directives().contains(&Directive::Public));
    }

    #[test]
    fn invalid_seconds_are_ignored() {
        let cc = CacheControl::parse("max-age=soon, min-fresh=-1");
        assert_eq!(cc.max_age(), None);
        assert_eq!(cc.min_fresh(), None);
    }

    #[test]
    fn oversized_seconds_are_clamped() {
        let max = Duration::from_secs(MAX_DELTA_SECONDS);
        let cc = CacheControl::parse("max-age=18446744073709551615, s-maxage=99999999999999999999999");
        assert_eq!(cc.max_age(), Some(max));
        assert_eq!(cc.shared_max_age(), Some(max));
        assert_eq!(CacheControl::parse("max-age=+5").max_age(), None);
    }

    #[test]
    fn private_with_field_names_is_private() {
        let cc = CacheControl::parse(r#"private="Set-Cookie", max-age=10"#);
        assert!(cc.is_private());
    }

    #[test]
    fn headers_are_merged_across_lines() {
        let mut h = Headers::new();
        h.insert("Cache-Control", "max-age=5");
        h.insert("cache-control", "no-store");
        let cc = CacheControl::from_headers(&h);
        assert!(cc.no_store());
        assert_eq!(cc.max_age(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn pragma_no_cache_applies_without_cache_control() {
        let mut h = Headers::new();
        h.insert("Pragma", "no-cache");
        assert!(CacheControl::from_headers(&h).no_cache());

        h.insert("Cache-Control", "max-age=30");
        assert!(!CacheControl::from_headers(&h).no_cache());
    }
}
