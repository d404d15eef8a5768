// src/core/proxy/policy.rs

//! Derives HTTP caching rules from request and response headers.
//!
//! Both entry points are pure functions of their inputs (plus the supplied
//! clock reading), which keeps the freshness math straightforward to test.

use super::headers::{format_http_date, joined_value, parse_http_date};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{
    CACHE_CONTROL, DATE, ETAG, EXPIRES, HeaderMap, HeaderValue, IF_MATCH, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, IF_UNMODIFIED_SINCE, LAST_MODIFIED, PRAGMA, SET_COOKIE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound on any freshness lifetime, in seconds (ten years).
pub const MAX_FRESHNESS_LIFETIME: i64 = 10 * 365 * 24 * 60 * 60;

/// Why a policy forbids caching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoCacheReason {
    /// `private`, `no-cache` or `no-store`.
    Directive,
    SetCookie,
    /// The response carried no freshness directive and no validators.
    NoCachingMetadata,
    ObjectTooLarge,
    ClientRequested,
}

/// Freshness and validation rules for one cached object or client request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachingPolicy {
    /// Computed on lookup, never stored.
    #[serde(skip)]
    pub is_fresh: bool,
    pub no_cache: bool,
    pub no_transform: bool,
    /// Seconds of freshness. `-1` means already stale, `0` means unset.
    pub freshness_lifetime: i64,
    pub can_revalidate: bool,
    pub must_revalidate: bool,
    pub is_negative_cache: bool,
    pub last_modified: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    pub date: Option<DateTime<Utc>>,
    pub local_date: Option<DateTime<Utc>>,
    pub etag: String,
    pub if_none_match_value: String,
    pub if_match_value: String,
    pub if_modified_since_time: Option<DateTime<Utc>>,
    pub if_unmodified_since_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub no_cache_reason: Option<NoCacheReason>,
}

impl CachingPolicy {
    fn forbid(&mut self, reason: NoCacheReason) {
        self.no_cache = true;
        self.freshness_lifetime = -1;
        self.no_cache_reason = Some(reason);
    }

    /// True unless `local_date + freshness_lifetime` lies before `now`.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let Some(local) = self.local_date else {
            return false;
        };
        match TimeDelta::try_seconds(self.freshness_lifetime) {
            // An expiry past the representable range never lapses.
            Some(lifetime) => local
                .checked_add_signed(lifetime)
                .is_none_or(|expiry| expiry >= now),
            None => false,
        }
    }

    /// True when the client sent any validator of its own.
    pub fn has_client_validators(&self) -> bool {
        !self.if_none_match_value.is_empty()
            || !self.if_match_value.is_empty()
            || self.if_modified_since_time.is_some()
            || self.if_unmodified_since_time.is_some()
    }
}

#[derive(Debug, Default)]
struct Directives {
    found_freshness: bool,
    has_max_age: bool,
    has_shared_max_age: bool,
}

fn parse_cache_control(value: &str, cp: &mut CachingPolicy) -> Directives {
    let mut d = Directives::default();
    let normalized = value.to_ascii_lowercase().replace(' ', "");

    for part in normalized.split(',').filter(|p| !p.is_empty()) {
        let (name, arg) = match part.split_once('=') {
            Some((n, v)) => (n, Some(v.trim_matches('"'))),
            None => (part, None),
        };
        let seconds = arg
            .and_then(|a| a.parse::<i64>().ok())
            .map(|secs| secs.min(MAX_FRESHNESS_LIFETIME));

        match name {
            "private" | "no-cache" | "no-store" => {
                cp.forbid(NoCacheReason::Directive);
                return d;
            }
            "s-maxage" => {
                d.found_freshness = true;
                if let Some(secs) = seconds {
                    d.has_shared_max_age = true;
                    cp.freshness_lifetime = secs;
                }
            }
            "max-age" => {
                d.found_freshness = true;
                if !d.has_shared_max_age {
                    if let Some(secs) = seconds {
                        d.has_max_age = true;
                        cp.freshness_lifetime = secs;
                    }
                }
            }
            "must-revalidate" | "proxy-revalidate" => {
                cp.must_revalidate = true;
                cp.freshness_lifetime = 0;
            }
            "no-transform" => cp.no_transform = true,
            _ => {}
        }

        if d.found_freshness && cp.freshness_lifetime == 0 {
            cp.must_revalidate = true;
        }
    }
    d
}

fn header_str<'a>(headers: &'a HeaderMap, name: &reqwest::header::HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Builds the caching policy of an origin response.
///
/// A missing or malformed `Date` header is replaced in `headers` so the
/// stored copy always carries a usable date.
pub fn for_response(
    status: u16,
    negative_cache: &HashMap<u16, Duration>,
    headers: &mut HeaderMap,
    now: DateTime<Utc>,
) -> CachingPolicy {
    let mut cp = CachingPolicy {
        local_date: Some(now),
        ..Default::default()
    };

    if let Some(ttl) = negative_cache.get(&status) {
        cp.freshness_lifetime = i64::try_from(ttl.as_secs())
            .unwrap_or(MAX_FRESHNESS_LIFETIME)
            .min(MAX_FRESHNESS_LIFETIME);
        cp.expires = TimeDelta::from_std(*ttl).ok().map(|d| now + d);
        cp.is_negative_cache = true;
        return cp;
    }

    if headers.contains_key(SET_COOKIE) {
        cp.forbid(NoCacheReason::SetCookie);
        return cp;
    }

    let directives = joined_value(headers, &CACHE_CONTROL)
        .map(|cc| parse_cache_control(&cc, &mut cp))
        .unwrap_or_default();
    if cp.no_cache {
        return cp;
    }

    let last_modified = header_str(headers, &LAST_MODIFIED).map(str::to_string);
    let expires = header_str(headers, &EXPIRES).map(str::to_string);
    let etag = header_str(headers, &ETAG).map(str::to_string);

    if last_modified.is_none() && expires.is_none() && etag.is_none() && !directives.found_freshness
    {
        cp.forbid(NoCacheReason::NoCachingMetadata);
        return cp;
    }

    let date = match header_str(headers, &DATE).and_then(parse_http_date) {
        Some(d) => d,
        None => {
            if let Ok(v) = HeaderValue::from_str(&format_http_date(now)) {
                headers.insert(DATE, v);
            }
            now
        }
    };
    cp.date = Some(date);

    if !directives.has_max_age && !directives.has_shared_max_age && !cp.must_revalidate {
        if let Some(raw) = expires {
            match parse_http_date(&raw) {
                Some(exp) if exp >= date => {
                    cp.expires = Some(exp);
                    cp.freshness_lifetime = (exp - date).num_seconds().min(MAX_FRESHNESS_LIFETIME);
                }
                Some(exp) => {
                    cp.expires = Some(exp);
                    cp.freshness_lifetime = -1;
                    cp.must_revalidate = true;
                }
                None => {
                    cp.freshness_lifetime = -1;
                    cp.must_revalidate = true;
                }
            }
        }
    }

    if let Some(etag) = etag {
        cp.etag = etag;
        cp.can_revalidate = true;
    }
    if let Some(lm) = last_modified.as_deref().and_then(parse_http_date) {
        cp.last_modified = Some(lm);
        cp.can_revalidate = true;
    }
    if !cp.can_revalidate {
        return cp;
    }

    if cp.freshness_lifetime == 0 && !cp.must_revalidate {
        if let Some(lm) = cp.last_modified.filter(|lm| *lm < date) {
            cp.freshness_lifetime = (date - lm).num_seconds() / 5;
        }
    }

    cp
}

/// Builds the caching policy a client request asks for, including its validators.
pub fn for_request(headers: &HeaderMap) -> CachingPolicy {
    let mut cp = CachingPolicy::default();

    let pragma = joined_value(headers, &PRAGMA).unwrap_or_default();
    if pragma.to_ascii_lowercase().contains("no-cache") {
        cp.forbid(NoCacheReason::ClientRequested);
        return cp;
    }

    if let Some(cc) = joined_value(headers, &CACHE_CONTROL) {
        parse_cache_control(&cc, &mut cp);
        if cp.no_cache {
            cp.no_cache_reason = Some(NoCacheReason::ClientRequested);
            return cp;
        }
    }

    cp.if_modified_since_time = header_str(headers, &IF_MODIFIED_SINCE).and_then(parse_http_date);
    cp.if_unmodified_since_time =
        header_str(headers, &IF_UNMODIFIED_SINCE).and_then(parse_http_date);
    cp.if_none_match_value = header_str(headers, &IF_NONE_MATCH).unwrap_or_default().to_string();
    cp.if_match_value = header_str(headers, &IF_MATCH).unwrap_or_default().to_string();
    cp
}

fn normalize_etag(tag: &str) -> &str {
    let tag = tag.trim();
    let tag = tag.strip_prefix("W/").unwrap_or(tag);
    tag.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(tag)
}

fn if_none_match_satisfied(etag: &str, header: &str) -> bool {
    if etag.is_empty() {
        return false;
    }
    if header.trim() == "*" {
        return true;
    }
    let etag = normalize_etag(etag);
    header.split(',').any(|candidate| normalize_etag(candidate) == etag)
}

/// Returns true when every validator the client sent says its own copy of
/// the stored object is still good, so a 304 can be served.
pub fn is_client_fresh(request: &CachingPolicy, stored: &CachingPolicy) -> bool {
    if !request.has_client_validators() {
        return false;
    }

    let mut fresh = true;
    if !request.if_none_match_value.is_empty() {
        fresh &= if_none_match_satisfied(&stored.etag, &request.if_none_match_value);
    }
    if !request.if_match_value.is_empty() {
        fresh &= normalize_etag(&request.if_match_value) != normalize_etag(&stored.etag);
    }
    if let Some(ims) = request.if_modified_since_time {
        fresh &= stored.last_modified.is_some_and(|lm| lm <= ims);
    }
    if let Some(ius) = request.if_unmodified_since_time {
        fresh &= stored.last_modified.is_some_and(|lm| lm > ius);
    }
    fresh
}
