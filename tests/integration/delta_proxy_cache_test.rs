// tests/integration/delta_proxy_cache_test.rs

use super::test_helpers::*;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{CACHE_CONTROL, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode};
use serde_json::json;
use std::time::Duration;
use stride::core::cache::{Cache, query_cache, write_cache};
use stride::core::origins::TimeseriesClient;
use stride::core::origins::prometheus::PrometheusClient;
use stride::core::proxy::LookupStatus;
use stride::core::proxy::document::HttpDocument;
use stride::core::timeseries::Timeseries;

fn secs(n: i64) -> TimeDelta {
    TimeDelta::seconds(n)
}

#[tokio::test]
async fn test_cold_miss_then_full_hit() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let target = range_target(now - secs(3600), now - secs(1800));

    let first = proxy.get(&target).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.lookup_status, LookupStatus::KeyMiss);
    assert!(result_header(&first).contains("status=kmiss"));
    assert_eq!(sample_times(&first).len(), 31);
    assert_eq!(proxy.origin.request_count(), 1);

    let second = proxy.get(&target).await;
    assert_eq!(second.status, StatusCode::OK);
    assert_eq!(second.lookup_status, LookupStatus::Hit);
    assert_eq!(proxy.origin.request_count(), 1, "a full hit must not reach the origin");
    assert_eq!(sample_times(&second), sample_times(&first));

    let header = result_header(&second);
    assert!(header.contains("engine=DeltaProxyCache"), "{header}");
    assert!(header.contains("status=hit"), "{header}");
    assert!(!header.contains("fetched="), "{header}");
    assert!(header.contains("ffstatus=off"), "{header}");
}

#[tokio::test]
async fn test_response_strips_cache_bookkeeping() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let target = range_target(now - secs(3600), now - secs(1800));
    proxy.get(&target).await;

    let hit = proxy.get(&target).await;
    let matrix = decode_matrix(&hit);
    assert!(matrix.extents.is_empty());
    assert_eq!(matrix.step_ms, None);
    assert_eq!(matrix.status, "success");
    assert_eq!(matrix.data.result_type, "matrix");
}

#[tokio::test]
async fn test_partial_overlap_fetches_only_the_gap() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let t = now.timestamp();

    proxy
        .get(&range_target(now - secs(3600), now - secs(1800)))
        .await;
    let response = proxy
        .get(&range_target(now - secs(2400), now - secs(600)))
        .await;

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.lookup_status, LookupStatus::PartialHit);
    assert_eq!(
        proxy.origin.range_windows(),
        vec![(t - 3600, t - 1800), (t - 1740, t - 600)]
    );
    assert!(
        result_header(&response).contains(&format!("fetched=[{}-{}]", t - 1740, t - 600)),
        "{}",
        result_header(&response)
    );

    let times = sample_times(&response);
    let expected: Vec<i64> = (0..=30).map(|i| t - 2400 + i * 60).collect();
    assert_eq!(times, expected, "merged samples must be contiguous and unique");
}

#[tokio::test]
async fn test_disjoint_range_is_a_range_miss() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();

    proxy
        .get(&range_target(now - secs(7200), now - secs(6000)))
        .await;
    let response = proxy
        .get(&range_target(now - secs(3600), now - secs(3000)))
        .await;

    assert_eq!(response.lookup_status, LookupStatus::RangeMiss);
    assert_eq!(sample_times(&response).len(), 11);
    assert_eq!(proxy.origin.request_count(), 2);

    // Both windows are cached now.
    let again = proxy
        .get(&range_target(now - secs(7200), now - secs(6000)))
        .await;
    assert_eq!(again.lookup_status, LookupStatus::Hit);
    assert_eq!(proxy.origin.request_count(), 2);
}

#[tokio::test]
async fn test_origin_error_on_cold_miss_is_not_cached() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let target = range_target(now - secs(3600), now - secs(1800));

    proxy
        .origin
        .fail_with(Some(Failure::Status(StatusCode::BAD_GATEWAY)));
    let failed = proxy.get(&target).await;
    assert_eq!(failed.status, StatusCode::BAD_GATEWAY);
    assert!(proxy.cache.is_empty());

    proxy.origin.fail_with(None);
    let retried = proxy.get(&target).await;
    assert_eq!(retried.status, StatusCode::OK);
    assert_eq!(retried.lookup_status, LookupStatus::KeyMiss);
    assert_eq!(proxy.origin.request_count(), 2);
}

#[tokio::test]
async fn test_unreachable_origin_yields_bad_gateway() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    proxy.origin.fail_with(Some(Failure::Unreachable));

    let response = proxy
        .get(&range_target(now - secs(3600), now - secs(1800)))
        .await;
    assert_eq!(response.status, StatusCode::BAD_GATEWAY);
    assert!(proxy.cache.is_empty());
}

#[tokio::test]
async fn test_failed_gap_fill_is_dropped() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();

    proxy
        .get(&range_target(now - secs(3600), now - secs(1800)))
        .await;
    proxy
        .origin
        .fail_with(Some(Failure::Status(StatusCode::INTERNAL_SERVER_ERROR)));
    let response = proxy
        .get(&range_target(now - secs(2400), now - secs(600)))
        .await;

    // The cached part is still served.
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.lookup_status, LookupStatus::PartialHit);
    assert_eq!(sample_times(&response).len(), 11);
}

#[tokio::test]
async fn test_client_no_cache_purges() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let target = range_target(now - secs(3600), now - secs(1800));
    proxy.get(&target).await;

    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    let purged = proxy.request(Method::GET, &target, headers).await;
    assert_eq!(purged.lookup_status, LookupStatus::Purge);
    assert_eq!(purged.status, StatusCode::OK);
    assert_eq!(proxy.origin.request_count(), 2);

    let after = proxy.get(&target).await;
    assert_eq!(after.lookup_status, LookupStatus::KeyMiss);
    assert_eq!(proxy.origin.request_count(), 3);
}

#[tokio::test]
async fn test_backfill_tolerance_keeps_recent_points_out_of_the_cache() {
    let config = r#"
[[origins]]
name = "prom"
origin_url = "http://prom.test:9090"
fast_forward_disable = true
backfill_tolerance = "10m"
"#;
    let proxy = TestProxy::new(config);
    let now = aligned_now();
    let t = now.timestamp();
    let target = range_target(now - secs(1800), now);

    let first = proxy.get(&target).await;
    assert_eq!(sample_times(&first).len(), 31);

    let second = proxy.get(&target).await;
    assert_eq!(second.lookup_status, LookupStatus::PartialHit);
    let windows = proxy.origin.range_windows();
    let (gap_start, gap_end) = windows[1];
    assert_eq!(gap_end, t);
    // The minute may have rolled over between the two requests.
    assert!((t - 540..=t - 480).contains(&gap_start), "gap starts at {gap_start}");
    assert_eq!(sample_times(&second).len(), 31);
}

#[tokio::test]
async fn test_range_outside_retention_is_proxied() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let target = range_target(now - secs(40 * 86400), now - secs(39 * 86400));

    let response = proxy.get(&target).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.lookup_status, LookupStatus::ProxyOnly);
    assert!(result_header(&response).contains("engine=HTTPProxy"));
    assert!(proxy.cache.is_empty());
}

#[tokio::test]
async fn test_unparseable_range_query_is_proxied() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let response = proxy.get("/api/v1/query_range?query=up").await;
    assert_eq!(response.lookup_status, LookupStatus::ProxyOnly);
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(proxy.origin.request_count(), 1);
}

#[tokio::test]
async fn test_concurrent_identical_queries_are_coalesced() {
    let proxy = std::sync::Arc::new(TestProxy::new(PROMETHEUS_CONFIG));
    proxy.origin.set_delay(Duration::from_millis(100));
    let now = aligned_now();
    let target = range_target(now - secs(3600), now - secs(1800));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let proxy = proxy.clone();
            let target = target.clone();
            tokio::spawn(async move { proxy.get(&target).await })
        })
        .collect();

    let mut statuses = Vec::new();
    for handle in handles {
        let response = handle.await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(sample_times(&response).len(), 31);
        statuses.push(response.lookup_status);
    }
    assert_eq!(proxy.origin.request_count(), 1);
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == LookupStatus::KeyMiss)
            .count(),
        1
    );
    assert!(proxy.state.coalescer.is_empty());
}

#[tokio::test]
async fn test_cached_series_is_cropped_to_request() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let t = now.timestamp();

    proxy
        .get(&range_target(now - secs(3600), now - secs(600)))
        .await;
    let inner = proxy
        .get(&range_target(now - secs(3000), now - secs(2400)))
        .await;
    assert_eq!(inner.lookup_status, LookupStatus::Hit);
    let times = sample_times(&inner);
    assert_eq!(times.first(), Some(&(t - 3000)));
    assert_eq!(times.last(), Some(&(t - 2400)));
    assert_eq!(decode_matrix(&inner).value_count(), 11);
}

/// Sample timestamps (seconds) of the series cached for `target`.
async fn cached_times(proxy: &TestProxy, target: &str) -> Vec<i64> {
    let doc = query_cache(proxy.cache.as_ref(), &proxy.cache_key(target))
        .await
        .expect("series should be cached");
    let series = PrometheusClient::new()
        .unmarshal_timeseries(&doc.body)
        .expect("cached body should be a matrix");
    let mut times: Vec<i64> = series
        .data
        .result
        .iter()
        .flat_map(|s| s.values.iter().map(|v| v.timestamp.timestamp()))
        .collect();
    times.sort_unstable();
    times.dedup();
    times
}

#[tokio::test]
async fn test_unreadable_cache_entry_is_refetched() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let t = now.timestamp();
    let target = range_target(now - secs(3600), now - secs(1800));
    proxy
        .cache
        .store(
            &proxy.cache_key(&target),
            Bytes::from_static(b"\x01garbage"),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

    let response = proxy.get(&target).await;
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.lookup_status, LookupStatus::KeyMiss);
    assert_eq!(sample_times(&response).len(), 31);
    assert_eq!(proxy.origin.range_windows(), vec![(t - 3600, t - 1800)]);
    assert_eq!(cached_times(&proxy, &target).await.len(), 31);
}

#[tokio::test]
async fn test_cached_body_that_is_not_a_matrix_is_replaced() {
    let proxy = TestProxy::new(PROMETHEUS_CONFIG);
    let now = aligned_now();
    let t = now.timestamp();
    let target = range_target(now - secs(3600), now - secs(1800));
    let junk = HttpDocument::new(
        StatusCode::OK,
        &HeaderMap::new(),
        Bytes::from_static(b"<html>not json</html>"),
    );
    write_cache(
        proxy.cache.as_ref(),
        &proxy.cache_key(&target),
        &junk,
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    let first = proxy.get(&target).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.lookup_status, LookupStatus::KeyMiss);
    assert!(result_header(&first).contains("status=kmiss"));
    assert_eq!(proxy.origin.range_windows(), vec![(t - 3600, t - 1800)]);

    let second = proxy.get(&target).await;
    assert_eq!(second.lookup_status, LookupStatus::Hit);
    assert_eq!(sample_times(&second), sample_times(&first));
    assert_eq!(proxy.origin.request_count(), 1);
}

/// Prometheus with fast forward left on.
const FAST_FORWARD_CONFIG: &str = r#"
[[origins]]
name = "prom"
origin_url = "http://prom.test:9090"
"#;

fn instant_object(at: DateTime<Utc>) -> MockObject {
    let body = json!({
        "status": "success",
        "data": {
            "resultType": "vector",
            "result": [{"metric": {"__name__": "up", "job": "mock"}, "value": [at.timestamp(), "1"]}],
        },
    });
    MockObject::ok(&body.to_string()).header("content-type", "application/json")
}

fn instant_request_count(proxy: &TestProxy) -> usize {
    proxy
        .origin
        .requests()
        .iter()
        .filter(|r| r.url.path().ends_with("/api/v1/query"))
        .count()
}

#[tokio::test]
async fn test_fast_forward_appends_the_latest_point() {
    let proxy = TestProxy::new(FAST_FORWARD_CONFIG);
    let now = aligned_now();
    let t = now.timestamp();
    proxy
        .origin
        .set_object("/api/v1/query", instant_object(now + secs(30)));
    let target = range_target(now - secs(600), now);

    let first = proxy.get(&target).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.lookup_status, LookupStatus::KeyMiss);
    assert!(result_header(&first).contains("ffstatus=miss"), "{}", result_header(&first));
    let times = sample_times(&first);
    assert_eq!(times.len(), 12);
    assert_eq!(times[10], t);
    assert_eq!(times[11], t + 30);

    // The fast-forward point is never written to the cached series.
    let cached = cached_times(&proxy, &target).await;
    assert_eq!(cached.len(), 11);
    assert_eq!(cached.last(), Some(&t));

    let second = proxy.get(&target).await;
    assert_eq!(second.lookup_status, LookupStatus::Hit);
    assert!(result_header(&second).contains("ffstatus=hit"), "{}", result_header(&second));
    assert_eq!(sample_times(&second), times);
    assert_eq!(instant_request_count(&proxy), 1);
    assert_eq!(proxy.origin.range_windows().len(), 1);
}

#[tokio::test]
async fn test_fast_forward_point_not_newer_than_the_range_is_ignored() {
    let proxy = TestProxy::new(FAST_FORWARD_CONFIG);
    let now = aligned_now();
    proxy.origin.set_object("/api/v1/query", instant_object(now));

    let response = proxy.get(&range_target(now - secs(600), now)).await;
    assert!(result_header(&response).contains("ffstatus=miss"));
    assert_eq!(sample_times(&response).len(), 11);
}

#[tokio::test]
async fn test_fast_forward_is_off_for_ranges_ending_in_the_past() {
    let proxy = TestProxy::new(FAST_FORWARD_CONFIG);
    let now = aligned_now();

    let response = proxy
        .get(&range_target(now - secs(3600), now - secs(1800)))
        .await;
    assert!(result_header(&response).contains("ffstatus=off"));
    assert_eq!(sample_times(&response).len(), 31);
    assert_eq!(instant_request_count(&proxy), 0);
}

/// Prometheus with LRU eviction and room for 13 timestamps per series.
const LRU_CONFIG: &str = r#"
[[origins]]
name = "prom"
origin_url = "http://prom.test:9090"
fast_forward_disable = true
timeseries_eviction_method = "lru"
timeseries_retention_factor = 13
"#;

#[tokio::test]
async fn test_lru_caches_ranges_older_than_the_retention_window() {
    let proxy = TestProxy::new(LRU_CONFIG);
    let now = aligned_now();
    let target = range_target(now - secs(7200), now - secs(6900));

    let first = proxy.get(&target).await;
    assert_eq!(first.lookup_status, LookupStatus::KeyMiss);
    let second = proxy.get(&target).await;
    assert_eq!(second.lookup_status, LookupStatus::Hit);
    assert_eq!(proxy.origin.request_count(), 1);
}

#[tokio::test]
async fn test_lru_keeps_at_most_the_retention_factor_of_timestamps() {
    let proxy = TestProxy::new(LRU_CONFIG);
    let now = aligned_now();
    let t = now.timestamp();
    let target = range_target(now - secs(3600), now - secs(1800));

    let first = proxy.get(&target).await;
    assert_eq!(sample_times(&first).len(), 31, "the client still gets every point");
    let expected: Vec<i64> = (0..13).map(|i| t - 2520 + i * 60).collect();
    assert_eq!(cached_times(&proxy, &target).await, expected);

    let second = proxy.get(&target).await;
    assert_eq!(second.lookup_status, LookupStatus::PartialHit);
    assert_eq!(proxy.origin.range_windows()[1], (t - 3600, t - 2580));
    assert_eq!(sample_times(&second).len(), 31);
}

#[tokio::test]
async fn test_lru_evicts_the_least_recently_requested_range() {
    let proxy = TestProxy::new(LRU_CONFIG);
    let now = aligned_now();
    let t = now.timestamp();
    let range = |start: i64, end: i64| range_target(now - secs(start), now - secs(end));

    proxy.get(&range(7200, 6900)).await;
    let b = proxy.get(&range(3600, 3300)).await;
    assert_eq!(b.lookup_status, LookupStatus::RangeMiss);
    // Extending the first range makes it more recent than the second.
    let a = proxy.get(&range(7200, 6840)).await;
    assert_eq!(a.lookup_status, LookupStatus::PartialHit);
    let c = proxy.get(&range(5400, 5100)).await;
    assert_eq!(c.lookup_status, LookupStatus::RangeMiss);

    let mut expected: Vec<i64> = (0..7).map(|i| t - 7200 + i * 60).collect();
    expected.extend((0..6).map(|i| t - 5400 + i * 60));
    assert_eq!(cached_times(&proxy, &range(5400, 5100)).await, expected);

    // The cache is full, so ranges entirely outside it bypass it.
    let newer = proxy.get(&range(3600, 3300)).await;
    assert_eq!(newer.status, StatusCode::OK);
    assert_eq!(newer.lookup_status, LookupStatus::ProxyOnly);
    assert!(result_header(&newer).contains("engine=HTTPProxy"));
    let older = proxy.get(&range(9000, 8700)).await;
    assert_eq!(older.lookup_status, LookupStatus::ProxyOnly);
    assert_eq!(cached_times(&proxy, &range(5400, 5100)).await, expected);
}
