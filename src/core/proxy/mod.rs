// src/core/proxy/mod.rs

//! The request-serving engines and the primitives they share.

pub mod coalescer;
pub mod collapse;
pub mod delta_cache;
pub mod document;
pub mod headers;
pub mod http_proxy;
pub mod key;
pub mod object_cache;
pub mod policy;
pub mod request;
pub mod status;
pub mod upstream;

pub use coalescer::RequestCoalescer;
pub use delta_cache::DeltaProxyCache;
pub use http_proxy::HttpProxy;
pub use object_cache::ObjectProxyCache;
pub use request::{BodyStream, EngineResponse, OriginResponse, ProxyRequest, StreamingResponse};
pub use status::{Engine, LookupStatus};
pub use upstream::{HttpUpstream, Upstream};

use crate::config::{OriginConfig, PathConfig};
use crate::core::metrics::{PROXY_REQUEST_DURATION_SECONDS, PROXY_REQUESTS_TOTAL};
use std::time::Duration;

/// The origin and path configuration a request was routed to.
#[derive(Debug, Clone, Copy)]
pub struct RequestContext<'a> {
    pub origin: &'a OriginConfig,
    pub path: &'a PathConfig,
}

impl<'a> RequestContext<'a> {
    pub fn new(origin: &'a OriginConfig, path: &'a PathConfig) -> Self {
        Self { origin, path }
    }
}

/// Records the request counters and latency for a finished request.
pub fn record_request(
    origin: &str,
    engine: Engine,
    response: &EngineResponse,
    elapsed: Duration,
) {
    let status = response.lookup_status.as_str();
    PROXY_REQUESTS_TOTAL
        .with_label_values(&[origin, engine.as_str(), status, response.status.as_str()])
        .inc();
    PROXY_REQUEST_DURATION_SECONDS
        .with_label_values(&[origin, engine.as_str(), status])
        .observe(elapsed.as_secs_f64());
}
