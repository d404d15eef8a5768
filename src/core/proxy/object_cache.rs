// src/core/proxy/object_cache.rs

//! Caching of opaque responses under HTTP freshness and validation rules.

use super::coalescer::RequestCoalescer;
use super::document::HttpDocument;
use super::headers::{self, format_http_date, set_result_header};
use super::key::derive_cache_key;
use super::policy::{self, CachingPolicy, NoCacheReason};
use super::request::{EngineResponse, OriginResponse, ProxyRequest};
use super::status::{Engine, LookupStatus};
use super::upstream::{Upstream, fetch_origin};
use super::{RequestContext, record_request};
use crate::core::cache::{Cache, query_cache, remove_document, write_cache};
use crate::core::errors::StrideError;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::header::{HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// What a cache lookup found.
enum Lookup {
    Miss,
    Fresh(HttpDocument),
    Revalidate(HttpDocument),
}

#[derive(Clone)]
pub struct ObjectProxyCache {
    cache: Arc<dyn Cache>,
    coalescer: Arc<RequestCoalescer>,
    upstream: Arc<dyn Upstream>,
}

impl ObjectProxyCache {
    pub fn new(
        cache: Arc<dyn Cache>,
        coalescer: Arc<RequestCoalescer>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            cache,
            coalescer,
            upstream,
        }
    }

    /// Serves `req` from the cache when fresh, revalidating or refetching otherwise.
    ///
    /// `ttl_override` replaces the storage TTL and gives a freshness lifetime to
    /// successful responses that carry no caching metadata at all. `skip_lock`
    /// is for callers already holding the coalescer guard for this key.
    pub async fn fetch(
        &self,
        req: ProxyRequest,
        ctx: RequestContext<'_>,
        ttl_override: Option<Duration>,
        skip_lock: bool,
    ) -> EngineResponse {
        let started = Instant::now();
        let key = format!(
            "{}.{}",
            ctx.origin.cache_key_prefix,
            derive_cache_key(&req, Some(ctx.path), None, "")
        );
        let _guard = if skip_lock {
            None
        } else {
            Some(self.coalescer.acquire(&key).await)
        };

        let response = self.fetch_locked(req, ctx, &key, ttl_override).await;
        record_request(
            &ctx.origin.name,
            Engine::ObjectProxyCache,
            &response,
            started.elapsed(),
        );
        response
    }

    async fn fetch_locked(
        &self,
        req: ProxyRequest,
        ctx: RequestContext<'_>,
        key: &str,
        ttl_override: Option<Duration>,
    ) -> EngineResponse {
        let now = Utc::now();
        let request_policy = policy::for_request(&req.headers);

        let mut upstream_req = req;
        headers::strip_conditionals(&mut upstream_req.headers);

        if request_policy.no_cache {
            debug!("Client requested no-cache; purging '{}'", key);
            remove_document(self.cache.as_ref(), key).await;
            let origin = fetch_origin(self.upstream.as_ref(), &upstream_req).await;
            let mut headers = origin.headers;
            set_result_header(
                &mut headers,
                Engine::ObjectProxyCache,
                LookupStatus::Purge,
                None,
                None,
            );
            return EngineResponse {
                status: origin.status,
                headers,
                body: origin.body,
                lookup_status: LookupStatus::Purge,
            };
        }

        let (doc, lookup_status) = match self.lookup(key, now).await {
            Lookup::Fresh(doc) => {
                debug!("Object cache hit for '{}'", key);
                (doc, LookupStatus::Hit)
            }
            Lookup::Revalidate(doc) => {
                let (doc, status) = self.revalidate(ctx, upstream_req, doc, now).await;
                let doc = self
                    .settle(ctx, key, doc, &request_policy, ttl_override)
                    .await;
                (doc, status)
            }
            Lookup::Miss => {
                let origin = fetch_origin(self.upstream.as_ref(), &upstream_req).await;
                let doc = document_from_origin(ctx, origin, now);
                let doc = self
                    .settle(ctx, key, doc, &request_policy, ttl_override)
                    .await;
                (doc, LookupStatus::KeyMiss)
            }
        };

        let stored_policy = doc.caching_policy.clone().unwrap_or_default();
        let client_fresh = doc.status_code == StatusCode::OK.as_u16()
            && policy::is_client_fresh(&request_policy, &stored_policy);
        let (status, body) = if client_fresh {
            (StatusCode::NOT_MODIFIED, Bytes::new())
        } else {
            (doc.status_code(), doc.body.clone())
        };

        let mut headers = doc.header_map();
        set_result_header(&mut headers, Engine::ObjectProxyCache, lookup_status, None, None);
        EngineResponse {
            status,
            headers,
            body,
            lookup_status,
        }
    }

    async fn lookup(&self, key: &str, now: DateTime<Utc>) -> Lookup {
        let mut doc = match query_cache(self.cache.as_ref(), key).await {
            Ok(doc) => doc,
            Err(StrideError::KeyNotFound) => return Lookup::Miss,
            Err(e) => {
                debug!("Discarding unreadable cache entry '{}': {}", key, e);
                remove_document(self.cache.as_ref(), key).await;
                return Lookup::Miss;
            }
        };
        let Some(cp) = doc.caching_policy.as_mut() else {
            return Lookup::Miss;
        };

        cp.is_fresh = cp.is_fresh_at(now);
        if cp.is_fresh {
            Lookup::Fresh(doc)
        } else if cp.can_revalidate {
            Lookup::Revalidate(doc)
        } else {
            Lookup::Miss
        }
    }

    /// Asks the origin whether a stale document is still current.
    async fn revalidate(
        &self,
        ctx: RequestContext<'_>,
        mut upstream_req: ProxyRequest,
        mut doc: HttpDocument,
        now: DateTime<Utc>,
    ) -> (HttpDocument, LookupStatus) {
        let cp = doc.caching_policy.clone().unwrap_or_default();
        if !cp.etag.is_empty()
            && let Ok(v) = HeaderValue::from_str(&cp.etag)
        {
            upstream_req.headers.insert(IF_NONE_MATCH, v);
        }
        if let Some(lm) = cp.last_modified
            && let Ok(v) = HeaderValue::from_str(&format_http_date(lm))
        {
            upstream_req.headers.insert(IF_MODIFIED_SINCE, v);
        }

        let origin = fetch_origin(self.upstream.as_ref(), &upstream_req).await;
        if origin.status != StatusCode::NOT_MODIFIED {
            return (document_from_origin(ctx, origin, now), LookupStatus::KeyMiss);
        }

        debug!("Origin revalidated cached object for {}", upstream_req.url);
        let mut merged = doc.header_map();
        headers::merge(&mut merged, &origin.headers);
        let refreshed =
            policy::for_response(doc.status_code, &ctx.origin.negative_cache, &mut merged, now);
        doc.set_headers(&merged);
        doc.caching_policy = Some(refreshed);
        (doc, LookupStatus::Hit)
    }

    /// Applies the final cacheability rules to a freshly obtained document
    /// and writes it to, or removes it from, the cache.
    async fn settle(
        &self,
        ctx: RequestContext<'_>,
        key: &str,
        mut doc: HttpDocument,
        request_policy: &CachingPolicy,
        ttl_override: Option<Duration>,
    ) -> HttpDocument {
        let config = self.cache.configuration();
        let mut cp: CachingPolicy = doc.caching_policy.take().unwrap_or_default();
        cp.no_transform |= request_policy.no_transform;
        if request_policy.no_cache && !cp.no_cache {
            cp.no_cache = true;
            cp.no_cache_reason = Some(NoCacheReason::ClientRequested);
        }

        if doc.body.len() > config.max_object_size_bytes {
            cp.no_cache = true;
            cp.no_cache_reason = Some(NoCacheReason::ObjectTooLarge);
        }

        let metadata_missing = cp.no_cache_reason == Some(NoCacheReason::NoCachingMetadata);
        if let Some(ttl) = ttl_override
            && metadata_missing
            && doc.status_code == StatusCode::OK.as_u16()
        {
            cp.no_cache = false;
            cp.no_cache_reason = None;
            cp.freshness_lifetime = lifetime_secs(ttl);
        } else if cp.freshness_lifetime == 0 && !cp.no_cache && !cp.must_revalidate {
            cp.freshness_lifetime = lifetime_secs(ctx.path.default_ttl);
        }

        let cacheable = !cp.no_cache && (cp.can_revalidate || cp.freshness_lifetime > 0);
        let store_ttl = ttl_override.unwrap_or_else(|| {
            config
                .object_ttl
                .max(Duration::from_secs(cp.freshness_lifetime.max(0) as u64))
        });
        doc.caching_policy = Some(cp);

        if cacheable {
            if let Err(e) = write_cache(self.cache.as_ref(), key, &doc, store_ttl).await {
                warn!("Failed to write cache entry '{}': {}", key, e);
            }
        } else {
            debug!("Response for '{}' is not cacheable; removing entry", key);
            remove_document(self.cache.as_ref(), key).await;
        }
        doc
    }
}

fn lifetime_secs(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs())
        .unwrap_or(policy::MAX_FRESHNESS_LIFETIME)
        .min(policy::MAX_FRESHNESS_LIFETIME)
}

fn document_from_origin(
    ctx: RequestContext<'_>,
    origin: OriginResponse,
    now: DateTime<Utc>,
) -> HttpDocument {
    let mut headers = origin.headers;
    let cp = policy::for_response(
        origin.status.as_u16(),
        &ctx.origin.negative_cache,
        &mut headers,
        now,
    );
    let mut doc = HttpDocument::new(origin.status, &headers, origin.body);
    doc.caching_policy = Some(cp);
    doc
}
