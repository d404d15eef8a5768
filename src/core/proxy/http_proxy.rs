// src/core/proxy/http_proxy.rs

//! Plain proxying for requests no cache engine handles.
//!
//! Concurrent identical GETs are collapsed: the first becomes the leader and
//! fetches from the origin, the rest wait for its response head and then
//! attach to a `ProgressiveCollapseForwarder` that the origin body streams
//! into. A request arriving mid-transfer still receives the body from the
//! first byte.

use super::collapse::{HTTP_BLOCK_SIZE, ProgressiveCollapseForwarder};
use super::headers::set_result_header;
use super::key::sha1_hex;
use super::request::{BodyStream, EngineResponse, OriginResponse, ProxyRequest};
use super::status::{Engine, LookupStatus};
use super::upstream::{Upstream, fetch_origin, fetch_origin_streaming};
use crate::core::errors::StrideError;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, HeaderMap};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Holds `None` until the leader has the origin's response head.
type Published = watch::Receiver<Option<Arc<ProgressiveCollapseForwarder>>>;
type InflightMap = DashMap<String, Published>;

#[derive(Debug)]
pub struct HttpProxy {
    inflight: Arc<InflightMap>,
    /// Declared lengths above this are not used to size the forwarder; such
    /// bodies are handed over in one piece once complete.
    max_sized_body: usize,
}

/// Ends a collapsed request, even when the leader is cancelled before the
/// origin answers. The key is unregistered before readers are woken, so a
/// request that sees the outcome never attaches to the finished transfer.
struct LeaderGuard {
    key: String,
    inflight: Arc<InflightMap>,
    publisher: watch::Sender<Option<Arc<ProgressiveCollapseForwarder>>>,
    failed: bool,
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.inflight.remove(&self.key);
        if let Some(forwarder) = self.publisher.borrow().as_ref() {
            if self.failed {
                forwarder.abort();
            } else {
                forwarder.close();
            }
        }
    }
}

impl HttpProxy {
    pub fn new(max_sized_body: usize) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            max_sized_body,
        }
    }

    pub async fn proxy(&self, upstream: &dyn Upstream, req: ProxyRequest) -> EngineResponse {
        if req.method != Method::GET {
            return respond(fetch_origin(upstream, &req).await);
        }

        let auth = req
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let key = sha1_hex(&format!("{}.{auth}", req.url));

        let (publisher, published) = watch::channel(None);
        let leader_of = match self.inflight.entry(key.clone()) {
            Entry::Occupied(e) => Err(e.get().clone()),
            Entry::Vacant(e) => {
                e.insert(published);
                Ok(())
            }
        };
        if let Err(mut published) = leader_of {
            debug!("Collapsing proxied request for {}", req.url);
            let forwarder = published
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|f| f.as_ref().map(Arc::clone));
            return match forwarder {
                Some(forwarder) => follow(&forwarder).await,
                None => abandoned(),
            };
        }

        let mut guard = LeaderGuard {
            key,
            inflight: Arc::clone(&self.inflight),
            publisher,
            failed: false,
        };
        let origin = fetch_origin_streaming(upstream, &req).await;
        let declared = origin
            .content_length
            .filter(|&len| len <= self.max_sized_body)
            .unwrap_or(0);
        let forwarder = Arc::new(ProgressiveCollapseForwarder::new(declared));
        forwarder.set_response_head(origin.status, origin.headers);
        guard.publisher.send_replace(Some(Arc::clone(&forwarder)));

        let feeding = Arc::clone(&forwarder);
        let body = origin.body;
        tokio::spawn(async move {
            if let Err(e) = feed(&feeding, body, declared).await {
                warn!("Proxied body from origin failed part way: {}", e);
                guard.failed = true;
            }
            drop(guard);
        });
        follow(&forwarder).await
    }
}

/// Copies the origin body into `forwarder`. A chunk is passed on as soon as
/// it arrives if the remaining slots still cover the rest of the declared
/// length in whole `HTTP_BLOCK_SIZE` writes plus one final write; otherwise
/// it is held back until enough bytes accumulate.
async fn feed(
    forwarder: &ProgressiveCollapseForwarder,
    mut body: BodyStream,
    declared: usize,
) -> Result<(), StrideError> {
    let mut pending: Vec<u8> = Vec::new();
    let mut written = 0;
    let mut writes = 0;
    while let Some(chunk) = body.next().await {
        pending.extend_from_slice(&chunk?);
        let unwritten_after = declared.saturating_sub(written + pending.len());
        let free = forwarder.slots().saturating_sub(writes);
        if free > unwritten_after / HTTP_BLOCK_SIZE + 1 {
            written += forwarder.write(&pending)?;
            writes += 1;
            pending.clear();
        }
    }
    if !pending.is_empty() {
        forwarder.write(&pending)?;
    }
    Ok(())
}

async fn follow(forwarder: &ProgressiveCollapseForwarder) -> EngineResponse {
    let mut body: Vec<u8> = Vec::new();
    let streamed = forwarder.add_client(&mut body).await;
    match (streamed, forwarder.response_head()) {
        (Ok(()), Some(head)) => respond(OriginResponse {
            status: head.status,
            headers: head.headers,
            body: Bytes::from(body),
        }),
        (result, _) => {
            if let Err(e) = result {
                warn!("Collapsed read failed: {}", e);
            }
            abandoned()
        }
    }
}

fn abandoned() -> EngineResponse {
    respond(OriginResponse {
        status: StatusCode::BAD_GATEWAY,
        headers: HeaderMap::new(),
        body: Bytes::from_static(b"origin request was abandoned"),
    })
}

fn respond(response: OriginResponse) -> EngineResponse {
    let lookup_status = if response.status.is_server_error() {
        LookupStatus::ProxyError
    } else {
        LookupStatus::ProxyOnly
    };
    let mut headers = response.headers;
    set_result_header(&mut headers, Engine::HttpProxy, lookup_status, None, None);
    EngineResponse {
        status: response.status,
        headers,
        body: response.body,
        lookup_status,
    }
}
