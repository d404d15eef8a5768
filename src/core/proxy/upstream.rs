// src/core/proxy/upstream.rs

//! Origin access. Engines only see the `Upstream` trait, which keeps them
//! testable against an in-process origin.

use super::headers;
use super::request::{OriginResponse, ProxyRequest, StreamingResponse};
use crate::core::errors::StrideError;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, HeaderMap, HeaderName, TRANSFER_ENCODING};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sends one request to an origin.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Returns the response with its body fully buffered.
    async fn fetch(&self, req: &ProxyRequest) -> Result<OriginResponse, StrideError>;

    /// Returns as soon as the response head is in, leaving the body as a stream.
    /// Falls back to `fetch` for upstreams that only buffer.
    async fn fetch_streaming(&self, req: &ProxyRequest) -> Result<StreamingResponse, StrideError> {
        self.fetch(req).await.map(StreamingResponse::from)
    }
}

/// A reqwest-backed origin client with a fixed per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
}

impl HttpUpstream {
    pub fn new(timeout: Duration) -> Result<Self, StrideError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    async fn send(&self, req: &ProxyRequest) -> Result<reqwest::Response, StrideError> {
        Ok(self
            .client
            .request(req.method.clone(), req.url.clone())
            .headers(req.headers.clone())
            .body(req.body.clone())
            .send()
            .await?)
    }
}

const HOP_BY_HOP: [HeaderName; 3] = [CONNECTION, TRANSFER_ENCODING, CONTENT_LENGTH];

fn forwardable_headers(response: &reqwest::Response) -> HeaderMap {
    let mut headers = response.headers().clone();
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
    headers
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, req: &ProxyRequest) -> Result<OriginResponse, StrideError> {
        let response = self.send(req).await?;
        let status = response.status();
        let headers = forwardable_headers(&response);
        let body = response.bytes().await?;

        Ok(OriginResponse {
            status,
            headers,
            body,
        })
    }

    async fn fetch_streaming(&self, req: &ProxyRequest) -> Result<StreamingResponse, StrideError> {
        let response = self.send(req).await?;
        let status = response.status();
        let headers = forwardable_headers(&response);
        let content_length = response
            .content_length()
            .and_then(|len| usize::try_from(len).ok());
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(StrideError::from))
            .boxed();

        Ok(StreamingResponse {
            status,
            headers,
            content_length,
            body,
        })
    }
}

fn shape(req: &ProxyRequest) -> ProxyRequest {
    let mut shaped = req.clone();
    headers::prepare_upstream(&mut shaped.headers, shaped.client_addr);
    shaped
}

/// Shapes `req` for the origin and sends it. Transport failures become a 502
/// response so every caller deals with a single outcome type.
pub async fn fetch_origin(upstream: &dyn Upstream, req: &ProxyRequest) -> OriginResponse {
    let shaped = shape(req);
    let started = Instant::now();
    match upstream.fetch(&shaped).await {
        Ok(response) => {
            debug!(
                "Origin {} {} answered {} in {:?}",
                shaped.method,
                shaped.url,
                response.status,
                started.elapsed()
            );
            response
        }
        Err(e) => {
            warn!("Origin request {} {} failed: {}", shaped.method, shaped.url, e);
            OriginResponse::bad_gateway(&e.to_string())
        }
    }
}

/// Like `fetch_origin`, but resolves once the response head has arrived.
pub async fn fetch_origin_streaming(upstream: &dyn Upstream, req: &ProxyRequest) -> StreamingResponse {
    let shaped = shape(req);
    let started = Instant::now();
    match upstream.fetch_streaming(&shaped).await {
        Ok(response) => {
            debug!(
                "Origin {} {} sent head {} ({:?} bytes declared) in {:?}",
                shaped.method,
                shaped.url,
                response.status,
                response.content_length,
                started.elapsed()
            );
            response
        }
        Err(e) => {
            warn!("Origin request {} {} failed: {}", shaped.method, shaped.url, e);
            OriginResponse::bad_gateway(&e.to_string()).into()
        }
    }
}
