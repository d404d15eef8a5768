// src/core/proxy/headers.rs

//! Header names, HTTP date handling and the header shaping applied to
//! upstream requests and client responses.

use super::status::{Engine, FastForwardStatus, LookupStatus};
use crate::core::timeseries::ExtentList;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{
    ACCEPT_ENCODING, CONTENT_LENGTH, HOST, HeaderMap, HeaderName, HeaderValue, IF_MATCH,
    IF_MODIFIED_SINCE, IF_NONE_MATCH, IF_UNMODIFIED_SINCE,
};
use std::net::IpAddr;

pub const RESULT_HEADER: &str = "x-stride-result";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_FORWARDED_BY: &str = "x-forwarded-by";

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Formats a timestamp as an RFC 1123 HTTP date.
pub fn format_http_date(t: DateTime<Utc>) -> String {
    t.format(HTTP_DATE_FORMAT).to_string()
}

/// Parses an HTTP date in RFC 1123, RFC 850 or asctime form.
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(t) = DateTime::parse_from_rfc2822(raw) {
        return Some(t.with_timezone(&Utc));
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Returns every value of `name` joined with commas, or `None` when absent.
pub fn joined_value(headers: &HeaderMap, name: &HeaderName) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(","))
    }
}

/// Removes the validators a client sends to us; they are never forwarded upstream.
pub fn strip_conditionals(headers: &mut HeaderMap) {
    for name in [IF_MATCH, IF_NONE_MATCH, IF_MODIFIED_SINCE, IF_UNMODIFIED_SINCE] {
        headers.remove(name);
    }
}

/// Shapes the headers of a request about to be sent to an origin.
pub fn prepare_upstream(headers: &mut HeaderMap, client_addr: Option<IpAddr>) {
    headers.remove(ACCEPT_ENCODING);
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);

    if let Some(addr) = client_addr {
        let forwarded = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => format!("{existing}, {addr}"),
            _ => addr.to_string(),
        };
        if let Ok(v) = HeaderValue::from_str(&forwarded) {
            headers.insert(X_FORWARDED_FOR, v);
        }
    }

    let by = format!("Stride {}", env!("CARGO_PKG_VERSION"));
    if let Ok(v) = HeaderValue::from_str(&by) {
        headers.insert(X_FORWARDED_BY, v);
    }
}

/// Copies every header in `src` over `dst`, replacing existing values of the same name.
pub fn merge(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in src.keys() {
        dst.remove(name);
        for value in src.get_all(name) {
            dst.append(name.clone(), value.clone());
        }
    }
}

/// Writes the diagnostic result header describing how a response was produced.
pub fn set_result_header(
    headers: &mut HeaderMap,
    engine: Engine,
    status: LookupStatus,
    fetched: Option<&ExtentList>,
    ff_status: Option<FastForwardStatus>,
) {
    let mut parts = vec![format!("engine={engine}"), format!("status={status}")];
    if let Some(fetched) = fetched.filter(|f| !f.is_empty()) {
        parts.push(format!("fetched=[{fetched}]"));
    }
    if let Some(ff) = ff_status {
        parts.push(format!("ffstatus={}", ff.as_str()));
    }
    if let Ok(v) = HeaderValue::from_str(&parts.join("; ")) {
        headers.insert(RESULT_HEADER, v);
    }
}
