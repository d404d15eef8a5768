// src/core/metrics.rs

//! Defines and registers Prometheus metrics for proxy monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Gauge, HistogramVec, TextEncoder, register_counter_vec, register_gauge,
    register_histogram_vec,
};

lazy_static! {
    // --- Request Counters ---
    /// Total proxied requests, labeled by origin, engine, cache status and HTTP status.
    pub static ref PROXY_REQUESTS_TOTAL: CounterVec =
        register_counter_vec!(
            "stride_proxy_requests_total",
            "Total number of proxied requests.",
            &["origin", "engine", "status", "http_status"]
        ).unwrap();
    /// Timeseries values served, split into values served from cache and values fetched from the origin.
    pub static ref PROXY_REQUEST_ELEMENTS_TOTAL: CounterVec =
        register_counter_vec!(
            "stride_proxy_request_elements_total",
            "Count of timeseries values returned, labeled by cached or uncached.",
            &["origin", "type"]
        ).unwrap();

    // --- Cache Counters ---
    /// Cache backend operations, labeled by operation and outcome.
    pub static ref CACHE_OPERATIONS_TOTAL: CounterVec =
        register_counter_vec!(
            "stride_cache_operations_total",
            "Total number of cache backend operations.",
            &["operation", "outcome"]
        ).unwrap();

    // --- Gauges ---
    /// Number of cache keys currently held by the request coalescer.
    pub static ref COALESCER_KEYS: Gauge =
        register_gauge!("stride_coalescer_keys", "Number of cache keys with in-flight requests.").unwrap();

    // --- Histograms ---
    /// Time spent serving a proxied request.
    pub static ref PROXY_REQUEST_DURATION_SECONDS: HistogramVec =
        register_histogram_vec!(
            "stride_proxy_request_duration_seconds",
            "Time required to proxy a request, in seconds.",
            &["origin", "engine", "status"]
        ).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap_or_default()
}
