// src/core/proxy/request.rs

//! The request and response values that flow between the front end, the
//! caching engines and the origin.

use super::status::LookupStatus;
use crate::core::errors::StrideError;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use reqwest::{Method, StatusCode};
use std::net::IpAddr;
use url::Url;

/// A request bound for an origin. `url` is already rewritten to the origin's address.
///
/// The body is held as immutable `Bytes` so it can be inspected for cache-key
/// material and still be forwarded unchanged.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_addr: Option<IpAddr>,
}

impl ProxyRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            client_addr: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_client_addr(mut self, addr: IpAddr) -> Self {
        self.client_addr = Some(addr);
        self
    }

    /// The lowercased media type of the body, without parameters.
    pub fn media_type(&self) -> Option<String> {
        let raw = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        let media = raw.split(';').next().unwrap_or_default().trim();
        Some(media.to_ascii_lowercase())
    }

    /// Returns the first value of a query string parameter.
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }
}

/// A fully buffered response from an origin.
#[derive(Debug, Clone)]
pub struct OriginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl OriginResponse {
    /// The response used when the origin could not be reached at all.
    pub fn bad_gateway(reason: &str) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            headers: HeaderMap::new(),
            body: Bytes::from(reason.to_string()),
        }
    }
}

/// Body chunks in the order the origin sends them.
pub type BodyStream = BoxStream<'static, Result<Bytes, StrideError>>;

/// An origin response whose head has arrived while the body may still be in transit.
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// The body length the origin declared, if it declared one.
    pub content_length: Option<usize>,
    pub body: BodyStream,
}

impl StreamingResponse {
    /// Drains the body into a buffered response.
    pub async fn collect(self) -> Result<OriginResponse, StrideError> {
        let mut body = Vec::with_capacity(self.content_length.unwrap_or_default());
        let mut chunks = self.body;
        while let Some(chunk) = chunks.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(OriginResponse {
            status: self.status,
            headers: self.headers,
            body: Bytes::from(body),
        })
    }
}

impl From<OriginResponse> for StreamingResponse {
    fn from(response: OriginResponse) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            content_length: Some(response.body.len()),
            body: stream::once(async move { Ok(response.body) }).boxed(),
        }
    }
}

/// What a caching engine hands back to the front end.
#[derive(Debug, Clone)]
pub struct EngineResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub lookup_status: LookupStatus,
}

impl EngineResponse {
    pub fn was_hit(&self) -> bool {
        self.lookup_status == LookupStatus::Hit
    }
}
