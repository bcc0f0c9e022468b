//! Freshness evaluation.
//!
//! Pure functions over a [`StoredEntry`], the request's `Cache-Control`
//! directives and a caller-supplied `now`. Nothing here reads a clock or
//! touches the store.

use std::time::{Duration, SystemTime};

use super::control::CacheControl;
use super::entry::StoredEntry;

/// Outcome of a freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Freshness {
    /// Age of the entry at the evaluation instant.
    pub age: Duration,
    /// Effective lifetime after request directives were applied.
    pub threshold: Option<Duration>,
    pub fresh: bool,
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        self.fresh
    }
}

/// Evaluates `entry` against the request directives at `now`.
///
/// - no lifetime information means stale;
/// - request `no-cache` means stale regardless of age;
/// - request `max-age=N` caps the lifetime at `N`;
/// - request `min-fresh=N` needs at least `N` of remaining lifetime.
///
/// # Examples
///
/// ```
/// use std::time::{Duration, SystemTime};
/// use bytes::Bytes;
/// use outcache::cache::{evaluate, CacheControl, StoredEntry};
/// use outcache::http::{Headers, StatusCode};
///
/// let now = SystemTime::now();
/// let entry = StoredEntry::new(StatusCode::Ok, &Headers::new(), Bytes::new(), now)
///     .with_response_date(Some(now - Duration::from_secs(30)))
///     .with_max_age(Some(Duration::from_secs(60)));
///
/// assert!(evaluate(&entry, &CacheControl::default(), now).is_fresh());
/// assert!(!evaluate(&entry, &CacheControl::parse("no-cache"), now).is_fresh());
/// ```
pub fn evaluate(entry: &StoredEntry, request: &CacheControl, now: SystemTime) -> Freshness {
    let age = entry.age_at(now);

    let Some(lifetime) = entry.lifetime() else {
        return Freshness {
            age,
            threshold: None,
            fresh: false,
        };
    };

    let threshold = match request.max_age() {
        Some(requested) => lifetime.min(requested),
        None => lifetime,
    };

    let mut fresh = !request.no_cache() && age <= threshold;

    if let Some(min_fresh) = request.min_fresh() {
        // Remaining lifetime is measured against the entry's own lifetime.
        fresh &= lifetime.saturating_sub(age) >= min_fresh;
    }

    Freshness {
        age,
        threshold: Some(threshold),
        fresh,
    }
}

/// Boolean shorthand for [`evaluate`].
pub fn is_fresh(entry: &StoredEntry, request: &CacheControl, now: SystemTime) -> bool {
    evaluate(entry, request, now).fresh
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::http::{Headers, StatusCode};

    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000 + secs)
    }

    fn entry_dated(date: SystemTime, max_age: Option<u64>) -> StoredEntry {
        StoredEntry::new(StatusCode::Ok, &Headers::new(), Bytes::new(), date)
            .with_response_date(Some(date))
            .with_max_age(max_age.map(Duration::from_secs))
    }

    #[test]
    fn fresh_within_max_age_then_stale_after_clock_advance() {
        let now = t(100);
        let entry = entry_dated(t(70), Some(60));
        let none = CacheControl::default();

        let at_now = evaluate(&entry, &none, now);
        assert!(at_now.fresh);
        assert_eq!(at_now.age, Duration::from_secs(30));

        assert!(!is_fresh(&entry, &none, now + Duration::from_secs(31)));
    }

    #[test]
    fn exactly_at_lifetime_is_still_fresh() {
        let entry = entry_dated(t(0), Some(60));
        assert!(is_fresh(&entry, &CacheControl::default(), t(60)));
        assert!(!is_fresh(&entry, &CacheControl::default(), t(61)));
    }

    #[test]
    fn no_cache_request_is_never_fresh() {
        let entry = entry_dated(t(100), Some(3600));
        assert!(!is_fresh(&entry, &CacheControl::parse("no-cache"), t(100)));
    }

    #[test]
    fn missing_lifetime_is_immediately_stale() {
        let entry = entry_dated(t(100), None);
        let f = evaluate(&entry, &CacheControl::default(), t(100));
        assert!(!f.fresh);
        assert_eq!(f.threshold, None);
    }

    #[test]
    fn request_max_age_tightens_threshold() {
        let entry = entry_dated(t(0), Some(60));
        let cc = CacheControl::parse("max-age=10");
        assert!(is_fresh(&entry, &cc, t(10)));
        assert!(!is_fresh(&entry, &cc, t(11)));
        assert_eq!(evaluate(&entry, &cc, t(0)).threshold, Some(Duration::from_secs(10)));
    }

    #[test]
    fn request_max_age_cannot_extend_lifetime() {
        let entry = entry_dated(t(0), Some(60));
        assert!(!is_fresh(&entry, &CacheControl::parse("max-age=600"), t(61)));
    }

    #[test]
    fn min_fresh_requires_remaining_lifetime() {
        let entry = entry_dated(t(0), Some(60));
        let cc = CacheControl::parse("min-fresh=20");
        assert!(is_fresh(&entry, &cc, t(40)));
        assert!(!is_fresh(&entry, &cc, t(41)));
    }

    #[test]
    fn age_uses_creation_time_without_date() {
        let entry = StoredEntry::new(StatusCode::Ok, &Headers::new(), Bytes::new(), t(0))
            .with_max_age(Some(Duration::from_secs(5)));
        assert!(is_fresh(&entry, &CacheControl::default(), t(5)));
        assert!(!is_fresh(&entry, &CacheControl::default(), t(6)));
    }

    #[test]
    fn clock_behind_date_counts_as_zero_age() {
        let entry = entry_dated(t(100), Some(1));
        let f = evaluate(&entry, &CacheControl::default(), t(50));
        assert_eq!(f.age, Duration::ZERO);
        assert!(f.fresh);
    }
}
