// src/core/proxy/document.rs

use super::policy::CachingPolicy;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The unit of cache storage: a buffered response plus the policy that governs it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpDocument {
    pub status_code: u16,
    pub status: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Bytes,
    pub caching_policy: Option<CachingPolicy>,
}

impl HttpDocument {
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let mut doc = Self {
            status_code: status.as_u16(),
            status: status.to_string(),
            body,
            ..Default::default()
        };
        doc.set_headers(headers);
        doc
    }

    pub fn set_headers(&mut self, headers: &HeaderMap) {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            map.entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        self.headers = map;
    }

    /// Rebuilds a `HeaderMap`, skipping entries that are no longer valid header text.
    pub fn header_map(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, values) in &self.headers {
            let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = HeaderValue::from_str(value) {
                    headers.append(name.clone(), value);
                }
            }
        }
        headers
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::BAD_GATEWAY)
    }
}
