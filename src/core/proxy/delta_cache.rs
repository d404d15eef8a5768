// src/core/proxy/delta_cache.rs

//! Time-series aware caching: serves the cached part of a range query and
//! asks the origin only for the missing extents.

use super::coalescer::RequestCoalescer;
use super::document::HttpDocument;
use super::headers::set_result_header;
use super::http_proxy::HttpProxy;
use super::key::derive_cache_key;
use super::object_cache::ObjectProxyCache;
use super::policy;
use super::request::{EngineResponse, OriginResponse, ProxyRequest};
use super::status::{Engine, FastForwardStatus, LookupStatus};
use super::upstream::{Upstream, fetch_origin};
use super::{RequestContext, record_request};
use crate::config::{EvictionMethod, HandlerKind, PathConfig};
use crate::core::cache::{Cache, query_cache, remove_document, write_cache};
use crate::core::errors::StrideError;
use crate::core::metrics::PROXY_REQUEST_ELEMENTS_TOTAL;
use crate::core::origins::TimeseriesClient;
use crate::core::timeseries::{Extent, ExtentList, TimeRangeQuery, Timeseries, truncate};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, HeaderMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// The time boundaries a single request is evaluated against.
#[derive(Debug, Clone, Copy)]
struct Window {
    now: DateTime<Utc>,
    /// The normalized extent of the request.
    requested: Extent,
    /// `now` truncated to the query step.
    now_aligned: DateTime<Utc>,
    /// Data older than this is never cached.
    oldest: DateTime<Utc>,
    /// Data newer than this is never cached.
    backfill_end: DateTime<Utc>,
}

impl Window {
    fn new(ctx: RequestContext<'_>, trq: &TimeRangeQuery, now: DateTime<Utc>) -> Self {
        let now_aligned = truncate(now, trq.step);
        let tolerance = if trq.is_offset {
            TimeDelta::zero()
        } else {
            TimeDelta::from_std(ctx.origin.backfill_tolerance).unwrap_or(TimeDelta::MAX)
        };
        let backfill_end = now_aligned
            .checked_sub_signed(tolerance)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let oldest = trq
            .step
            .checked_mul(ctx.origin.timeseries_retention_factor)
            .and_then(|span| now_aligned.checked_sub_signed(span))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        Self {
            now,
            requested: trq.extent,
            now_aligned,
            oldest,
            backfill_end,
        }
    }

    /// True when no part of the query can be served from or written to the cache.
    fn excludes(&self, extent: &Extent) -> bool {
        extent.end < self.oldest || extent.start > self.backfill_end
    }
}

/// A cached series together with the headers it was stored with.
struct Cached<S> {
    series: S,
    headers: HeaderMap,
}

pub struct DeltaProxyCache<C: TimeseriesClient> {
    client: Arc<C>,
    cache: Arc<dyn Cache>,
    coalescer: Arc<RequestCoalescer>,
    upstream: Arc<dyn Upstream>,
    object_cache: ObjectProxyCache,
    http_proxy: Arc<HttpProxy>,
}

impl<C: TimeseriesClient> DeltaProxyCache<C> {
    pub fn new(
        client: Arc<C>,
        cache: Arc<dyn Cache>,
        coalescer: Arc<RequestCoalescer>,
        upstream: Arc<dyn Upstream>,
        http_proxy: Arc<HttpProxy>,
    ) -> Self {
        let object_cache =
            ObjectProxyCache::new(cache.clone(), coalescer.clone(), upstream.clone());
        Self {
            client,
            cache,
            coalescer,
            upstream,
            object_cache,
            http_proxy,
        }
    }

    pub async fn fetch(&self, mut req: ProxyRequest, ctx: RequestContext<'_>) -> EngineResponse {
        let started = Instant::now();
        let mut trq = match self.client.parse_time_range_query(&req) {
            Ok(trq) => trq,
            Err(e) => {
                debug!(
                    "Not a cacheable {} range query ({}); proxying",
                    self.client.name(),
                    e
                );
                return self.http_proxy.proxy(self.upstream.as_ref(), req).await;
            }
        };

        let now = Utc::now();
        trq.fast_forward_disable |= ctx.origin.fast_forward_disable;
        trq.normalize_extent(now);
        let window = Window::new(ctx, &trq, now);
        if ctx.origin.timeseries_eviction_method == EvictionMethod::Oldest
            && window.excludes(&trq.extent)
        {
            debug!(
                "Range {} is outside the cacheable window; proxying",
                trq.extent
            );
            return self.http_proxy.proxy(self.upstream.as_ref(), req).await;
        }

        let extent = trq.extent;
        self.client.set_extent(&mut req, &trq, &extent);
        let key = format!(
            "{}.{}",
            ctx.origin.cache_key_prefix,
            derive_cache_key(&req, Some(ctx.path), trq.template_url.as_ref(), "")
        );

        let guard = self.coalescer.acquire(&key).await;
        let Some(response) = self.fetch_locked(&req, ctx, &trq, &key, window).await else {
            drop(guard);
            return self.http_proxy.proxy(self.upstream.as_ref(), req).await;
        };
        drop(guard);
        record_request(
            &ctx.origin.name,
            Engine::DeltaProxyCache,
            &response,
            started.elapsed(),
        );
        response
    }

    /// Serves the query under the key's lock. `None` means the query should
    /// bypass the cache entirely.
    async fn fetch_locked(
        &self,
        req: &ProxyRequest,
        ctx: RequestContext<'_>,
        trq: &TimeRangeQuery,
        key: &str,
        window: Window,
    ) -> Option<EngineResponse> {
        let request_policy = policy::for_request(&req.headers);
        let (cached, mut lookup_status) = if request_policy.no_cache {
            debug!("Client requested no-cache; purging '{}'", key);
            remove_document(self.cache.as_ref(), key).await;
            (None, LookupStatus::Purge)
        } else {
            match self.lookup(key).await {
                Some(cached) => (Some(cached), LookupStatus::PartialHit),
                None => (None, LookupStatus::KeyMiss),
            }
        };

        let full_fetch = cached.is_none();
        let mut gaps = ExtentList::new();
        let (mut cts, headers) = match cached {
            Some(Cached {
                mut series,
                headers,
            }) => {
                if series.step() <= TimeDelta::zero() {
                    series.set_step(trq.step);
                }
                if ctx.origin.timeseries_eviction_method == EvictionMethod::Lru
                    && outside_full_cache(&series, trq, ctx.origin.timeseries_retention_factor)
                {
                    debug!(
                        "Range {} lies outside the full cached series '{}'; proxying",
                        trq.extent, key
                    );
                    return None;
                }
                gaps = trq.calculate_deltas(&series.extents());
                if gaps.is_empty() {
                    lookup_status = LookupStatus::Hit;
                } else if gaps.len() == 1 && gaps[0] == trq.extent {
                    lookup_status = LookupStatus::RangeMiss;
                }
                (series, headers)
            }
            None => {
                let origin = fetch_origin(self.upstream.as_ref(), req).await;
                if origin.status != StatusCode::OK {
                    warn!(
                        "Origin answered {} for range query {}; not caching",
                        origin.status, req.url
                    );
                    return Some(passthrough(origin, lookup_status));
                }
                match self.client.unmarshal_timeseries(&origin.body) {
                    Ok(mut series) => {
                        series.set_extents(ExtentList(vec![trq.extent]));
                        series.set_step(trq.step);
                        (series, origin.headers)
                    }
                    Err(e) => {
                        warn!(
                            "Could not parse {} timeseries for {}: {}",
                            self.client.name(),
                            req.url,
                            e
                        );
                        return Some(passthrough(origin, lookup_status));
                    }
                }
            }
        };

        let fetched_ranges = if full_fetch {
            ExtentList(vec![trq.extent])
        } else {
            gaps.clone()
        };

        let gap_fills = gaps.iter().map(|gap| self.fill_gap(req, trq, *gap));
        let (filled, (ff_status, ff_series)) = tokio::join!(
            join_all(gap_fills),
            self.fast_forward(req, ctx, trq, window)
        );
        let filled: Vec<C::Series> = filled.into_iter().flatten().collect();

        let mut uncached = filled.iter().map(|s| s.value_count()).sum::<usize>();
        if full_fetch {
            uncached += cts.value_count();
        }
        if !filled.is_empty() {
            cts.merge(true, filled);
        }
        let cached_values = cts.value_count().saturating_sub(uncached);

        let mut rts = cts.clone();
        if lookup_status != LookupStatus::KeyMiss {
            rts.crop(&trq.extent);
        }
        if let Some(ff) = ff_series
            && let Some(ff_extent) = ff.extents().outer_extent()
            && ff_extent.start > trq.extent.end
        {
            rts.merge(false, vec![ff]);
        }
        rts.set_extents(ExtentList::new());
        rts.set_step(TimeDelta::zero());

        let write_back = self.write_back(cts, &headers, key, ctx, lookup_status, window);
        let report = async {
            PROXY_REQUEST_ELEMENTS_TOTAL
                .with_label_values(&[ctx.origin.name.as_str(), "cached"])
                .inc_by(cached_values as f64);
            PROXY_REQUEST_ELEMENTS_TOTAL
                .with_label_values(&[ctx.origin.name.as_str(), "uncached"])
                .inc_by(uncached as f64);
            debug!(
                "Delta cache {} for '{}': {} cached values, {} fetched, ffstatus={}",
                lookup_status,
                key,
                cached_values,
                uncached,
                ff_status.as_str()
            );
        };
        let render = async { self.client.marshal_timeseries(&rts) };
        let (_, _, body) = tokio::join!(write_back, report, render);

        let mut headers = headers;
        headers.remove(CONTENT_LENGTH);
        let fetched = (!fetched_ranges.is_empty()).then_some(&fetched_ranges);
        set_result_header(
            &mut headers,
            Engine::DeltaProxyCache,
            lookup_status,
            fetched,
            Some(ff_status),
        );

        Some(match body {
            Ok(body) => EngineResponse {
                status: StatusCode::OK,
                headers,
                body,
                lookup_status,
            },
            Err(e) => {
                warn!("Failed to marshal timeseries for '{}': {}", key, e);
                EngineResponse {
                    status: StatusCode::BAD_GATEWAY,
                    headers,
                    body: Bytes::from(e.to_string()),
                    lookup_status,
                }
            }
        })
    }

    /// Loads the cached series for `key`. Unreadable entries are removed.
    async fn lookup(&self, key: &str) -> Option<Cached<C::Series>> {
        let doc = match query_cache(self.cache.as_ref(), key).await {
            Ok(doc) => doc,
            Err(StrideError::KeyNotFound) => return None,
            Err(e) => {
                debug!("Discarding unreadable cache entry '{}': {}", key, e);
                remove_document(self.cache.as_ref(), key).await;
                return None;
            }
        };
        match self.client.unmarshal_timeseries(&doc.body) {
            Ok(series) => Some(Cached {
                series,
                headers: doc.header_map(),
            }),
            Err(e) => {
                warn!("Cached timeseries '{}' failed to unmarshal: {}", key, e);
                remove_document(self.cache.as_ref(), key).await;
                None
            }
        }
    }

    /// Fetches one missing extent. Failed or empty responses yield `None`.
    async fn fill_gap(
        &self,
        req: &ProxyRequest,
        trq: &TimeRangeQuery,
        gap: Extent,
    ) -> Option<C::Series> {
        let mut gap_req = req.clone();
        self.client.set_extent(&mut gap_req, trq, &gap);
        let origin = fetch_origin(self.upstream.as_ref(), &gap_req).await;
        if origin.status != StatusCode::OK {
            warn!("Gap fill {} answered {}; dropping", gap, origin.status);
            return None;
        }
        if origin.body.is_empty() {
            debug!("Gap fill {} returned an empty body; dropping", gap);
            return None;
        }
        match self.client.unmarshal_timeseries(&origin.body) {
            Ok(mut series) => {
                series.set_extents(ExtentList(vec![gap]));
                series.set_step(trq.step);
                Some(series)
            }
            Err(e) => {
                warn!("Gap fill {} could not be parsed: {}", gap, e);
                None
            }
        }
    }

    /// Fetches the latest instantaneous value when the query reaches up to now.
    async fn fast_forward(
        &self,
        req: &ProxyRequest,
        ctx: RequestContext<'_>,
        trq: &TimeRangeQuery,
        window: Window,
    ) -> (FastForwardStatus, Option<C::Series>) {
        let ff_ttl = self.cache.configuration().fast_forward_ttl;
        let ff_span = TimeDelta::from_std(ff_ttl).unwrap_or(TimeDelta::MAX);
        if trq.fast_forward_disable || trq.step <= ff_span || trq.extent.end != window.now_aligned
        {
            return (FastForwardStatus::Off, None);
        }

        let ff_req = match self.client.fast_forward_request(req, trq) {
            Ok(r) => r,
            Err(e) => {
                debug!("Fast forward unavailable: {}", e);
                return (FastForwardStatus::Err, None);
            }
        };
        let ff_path = PathConfig::new(ff_req.url.path(), HandlerKind::ProxyCache)
            .exact()
            .with_key_params(&["query"]);
        let ff_ctx = RequestContext::new(ctx.origin, &ff_path);

        let response = self
            .object_cache
            .fetch(ff_req, ff_ctx, Some(ff_ttl), false)
            .await;
        if response.status != StatusCode::OK {
            warn!("Fast forward request answered {}", response.status);
            return (FastForwardStatus::Err, None);
        }
        match self.client.unmarshal_instantaneous(&response.body) {
            Ok(series) => {
                let status = if response.was_hit() {
                    FastForwardStatus::Hit
                } else {
                    FastForwardStatus::Miss
                };
                (status, Some(series))
            }
            Err(e) => {
                warn!("Fast forward response could not be parsed: {}", e);
                (FastForwardStatus::Err, None)
            }
        }
    }

    /// Stores the merged series, cropped to what the eviction method retains.
    async fn write_back(
        &self,
        mut series: C::Series,
        headers: &HeaderMap,
        key: &str,
        ctx: RequestContext<'_>,
        lookup_status: LookupStatus,
        window: Window,
    ) {
        if !matches!(
            lookup_status,
            LookupStatus::KeyMiss | LookupStatus::PartialHit | LookupStatus::RangeMiss
        ) {
            return;
        }

        match ctx.origin.timeseries_eviction_method {
            EvictionMethod::Oldest => {
                series.crop(&Extent::new(window.oldest, window.backfill_end));
            }
            EvictionMethod::Lru => {
                let size = usize::try_from(ctx.origin.timeseries_retention_factor).unwrap_or(0);
                series.crop_to_size(size, window.backfill_end, &window.requested, window.now);
            }
        }
        if series.value_count() == 0 {
            debug!("Nothing cacheable left in '{}' after cropping", key);
            return;
        }

        let body = match self.client.marshal_timeseries(&series) {
            Ok(body) => body,
            Err(e) => {
                warn!("Failed to marshal timeseries '{}' for caching: {}", key, e);
                return;
            }
        };
        let doc = HttpDocument::new(StatusCode::OK, headers, body);
        let ttl = self.cache.configuration().timeseries_ttl;
        if let Err(e) = write_cache(self.cache.as_ref(), key, &doc, ttl).await {
            warn!("Failed to write timeseries '{}': {}", key, e);
        }
    }
}

/// True when the cached series already holds its full timestamp budget and
/// `trq` lies entirely before or after it.
fn outside_full_cache<S: Timeseries>(series: &S, trq: &TimeRangeQuery, retention: i32) -> bool {
    let count = series.timestamp_count();
    let full = count > 0 && usize::try_from(retention).is_ok_and(|r| count >= r);
    let Some(cached) = series.extents().outer_extent() else {
        return false;
    };
    full && (trq.extent.end < cached.start || trq.extent.start > cached.end)
}

/// Hands an origin response back unchanged apart from the result header.
fn passthrough(origin: OriginResponse, lookup_status: LookupStatus) -> EngineResponse {
    let mut headers = origin.headers;
    set_result_header(
        &mut headers,
        Engine::DeltaProxyCache,
        lookup_status,
        None,
        None,
    );
    EngineResponse {
        status: origin.status,
        headers,
        body: origin.body,
        lookup_status,
    }
}
