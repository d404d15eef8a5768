// src/core/proxy/key.rs

//! Cache key derivation.
//!
//! A key is the SHA-1 of the request path, the sorted key material selected
//! by the path configuration, and an optional disambiguator. Sorting makes
//! the key independent of parameter and header ordering.

use super::request::ProxyRequest;
use crate::config::PathConfig;
use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use url::Url;

const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
const MULTIPART_FORM: &str = "multipart/form-data";
const APPLICATION_JSON: &str = "application/json";

type HasherFn = dyn Fn(&ProxyRequest, &str) -> String + Send + Sync;

/// A per-path replacement for the default key derivation.
#[derive(Clone)]
pub struct KeyHasher(Arc<HasherFn>);

impl KeyHasher {
    pub fn new(f: impl Fn(&ProxyRequest, &str) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn derive(&self, req: &ProxyRequest, extra: &str) -> String {
        (self.0)(req, extra)
    }
}

impl fmt::Debug for KeyHasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyHasher(..)")
    }
}

pub fn sha1_hex(input: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derives the cache key for `req`.
///
/// Without a path configuration only the path and `extra` are hashed. When
/// `template_url` is given its query parameters are used in place of the
/// request's, so that range-rewritten requests share a key.
pub fn derive_cache_key(
    req: &ProxyRequest,
    path: Option<&PathConfig>,
    template_url: Option<&Url>,
    extra: &str,
) -> String {
    let url_path = req.url.path();
    let Some(pc) = path else {
        return sha1_hex(&format!("{url_path}{extra}"));
    };
    if let Some(hasher) = &pc.key_hasher {
        return hasher.derive(req, extra);
    }

    let media = req.media_type();
    let body_fields = form_fields(req, media.as_deref());
    let is_form = matches!(media.as_deref(), Some(FORM_URLENCODED | MULTIPART_FORM));

    let params: Vec<(String, String)> = if req.method == Method::POST && is_form {
        body_fields.clone()
    } else if let Some(template) = template_url {
        template.query_pairs().into_owned().collect()
    } else {
        req.url.query_pairs().into_owned().collect()
    };

    let mut tokens: Vec<String> = Vec::new();

    if let Some(auth) = req.headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        tokens.push(format!("authorization.{auth}."));
    }
    tokens.push(format!("method.{}.", req.method));

    if pc.cache_key_params.len() == 1 && pc.cache_key_params[0] == "*" {
        let mut all: BTreeMap<&str, &str> = BTreeMap::new();
        for (k, v) in &params {
            all.entry(k.as_str()).or_insert(v.as_str());
        }
        tokens.extend(all.iter().map(|(k, v)| format!("{k}.{v}.")));
    } else {
        for name in &pc.cache_key_params {
            if let Some(v) = first_value(&params, name).filter(|v| !v.is_empty()) {
                tokens.push(format!("{name}.{v}."));
            }
        }
    }

    for name in &pc.cache_key_headers {
        if let Some(v) = req
            .headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            tokens.push(format!("{name}.{v}."));
        }
    }

    let body_method = matches!(req.method, Method::POST | Method::PUT | Method::PATCH);
    if body_method && !pc.cache_key_form_fields.is_empty() {
        match media.as_deref() {
            Some(FORM_URLENCODED | MULTIPART_FORM) => {
                for field in &pc.cache_key_form_fields {
                    if let Some(v) = first_value(&body_fields, field).filter(|v| !v.is_empty()) {
                        tokens.push(format!("{field}.{v}."));
                    }
                }
            }
            Some(APPLICATION_JSON) => {
                if let Ok(doc) = serde_json::from_slice::<Value>(&req.body) {
                    for field in &pc.cache_key_form_fields {
                        if let Some(v) = json_field(&doc, field) {
                            tokens.push(format!("{field}.{v}."));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    tokens.sort();
    sha1_hex(&format!("{url_path}.{}{extra}", tokens.concat()))
}

fn first_value<'a>(pairs: &'a [(String, String)], name: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Decodes a url-encoded or multipart body into name/value pairs.
fn form_fields(req: &ProxyRequest, media: Option<&str>) -> Vec<(String, String)> {
    match media {
        Some(FORM_URLENCODED) => url::form_urlencoded::parse(&req.body).into_owned().collect(),
        Some(MULTIPART_FORM) => multipart_boundary(req)
            .map(|b| multipart_fields(&req.body, &b))
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn multipart_boundary(req: &ProxyRequest) -> Option<String> {
    let raw = req
        .headers
        .get(reqwest::header::CONTENT_TYPE)?
        .to_str()
        .ok()?;
    raw.split(';').skip(1).find_map(|param| {
        let (k, v) = param.trim().split_once('=')?;
        k.eq_ignore_ascii_case("boundary")
            .then(|| v.trim_matches('"').to_string())
    })
}

/// Extracts the non-file fields of a multipart body.
///
/// Handles the subset browsers and HTTP clients send for form posts: CRLF
/// line endings and one `Content-Disposition: form-data` header per part
/// whose `name` parameter is a token or a quoted string. Parts with a
/// `filename` parameter are skipped. Values that are not UTF-8 are keyed by
/// their hex encoding. Nested multipart bodies and RFC 2231 `name*=`
/// parameters are not understood; such parts contribute nothing.
fn multipart_fields(body: &[u8], boundary: &str) -> Vec<(String, String)> {
    let delimiter = format!("--{boundary}");
    let mut fields = Vec::new();

    for part in split_bytes(body, delimiter.as_bytes()).skip(1) {
        if part.starts_with(b"--") {
            break;
        }
        let part = part.strip_prefix(b"\r\n").unwrap_or(part);
        let Some(head_end) = find_bytes(part, b"\r\n\r\n") else {
            continue;
        };
        let Ok(head) = std::str::from_utf8(&part[..head_end]) else {
            continue;
        };
        let value = &part[head_end + 4..];
        let value = value.strip_suffix(b"\r\n").unwrap_or(value);

        let Some(disposition) = head.split("\r\n").find_map(|line| {
            let (header, rest) = line.split_once(':')?;
            header
                .trim()
                .eq_ignore_ascii_case("content-disposition")
                .then_some(rest)
        }) else {
            continue;
        };
        let params = disposition_params(disposition);
        if params.iter().any(|(k, _)| k == "filename") {
            continue;
        }
        if let Some((_, name)) = params.into_iter().find(|(k, _)| k == "name") {
            let value = match std::str::from_utf8(value) {
                Ok(text) => text.to_string(),
                Err(_) => hex::encode(value),
            };
            fields.push((name, value));
        }
    }
    fields
}

/// Parses the parameters after the disposition type into lowercase keys and
/// unquoted values. Stops at the first malformed parameter.
fn disposition_params(raw: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let Some((_, mut rest)) = raw.split_once(';') else {
        return params;
    };

    loop {
        rest = rest.trim_start();
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().to_ascii_lowercase();
        let after = after.trim_start();

        let value = if let Some(quoted) = after.strip_prefix('"') {
            let mut value = String::new();
            let mut close = None;
            let mut chars = quoted.char_indices();
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => value.extend(chars.next().map(|(_, escaped)| escaped)),
                    '"' => {
                        close = Some(i + 1);
                        break;
                    }
                    _ => value.push(c),
                }
            }
            let Some(close) = close else {
                break;
            };
            let tail = quoted[close..].trim_start();
            rest = match tail.strip_prefix(';') {
                Some(next) => next,
                None if tail.is_empty() => tail,
                None => {
                    params.push((key, value));
                    break;
                }
            };
            value
        } else {
            let (token, next) = after.split_once(';').unwrap_or((after, ""));
            rest = next;
            token.trim().to_string()
        };
        params.push((key, value));
        if rest.trim().is_empty() {
            break;
        }
    }
    params
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_bytes<'a>(body: &'a [u8], delimiter: &'a [u8]) -> impl Iterator<Item = &'a [u8]> {
    let mut rest = Some(body);
    std::iter::from_fn(move || {
        let current = rest?;
        match find_bytes(current, delimiter) {
            Some(i) => {
                rest = Some(&current[i + delimiter.len()..]);
                Some(&current[..i])
            }
            None => {
                rest = None;
                Some(current)
            }
        }
    })
}

/// Follows a `/`-delimited path into a JSON document and renders the scalar found there.
fn json_field(doc: &Value, path: &str) -> Option<String> {
    let mut current = doc;
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current = current.as_object()?.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => n.as_f64().map(|f| format!("{f:.4}")),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
