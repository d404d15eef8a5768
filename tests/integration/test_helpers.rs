// tests/integration/test_helpers.rs

//! An in-process origin and a proxy wired to it, for end-to-end engine tests.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{ETAG, HeaderMap, HeaderName, HeaderValue, IF_NONE_MATCH};
use reqwest::{Method, StatusCode};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use stride::config::Config;
use stride::core::cache::{Cache, MemoryCache};
use stride::core::errors::StrideError;
use stride::core::origins::TimeseriesClient;
use stride::core::origins::prometheus::{
    MatrixEnvelope, PrometheusClient, format_time, parse_step, parse_time,
};
use stride::core::proxy::key::derive_cache_key;
use stride::core::proxy::{
    EngineResponse, OriginResponse, ProxyRequest, StreamingResponse, Upstream,
};
use stride::core::timeseries::truncate;
use stride::server::ServerState;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub const RESULT_HEADER: &str = "x-stride-result";

/// Sets up quiet tracing once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new("warn"))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// How the mock origin misbehaves.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Status(StatusCode),
    Unreachable,
}

/// A canned response for one path.
#[derive(Debug, Clone)]
pub struct MockObject {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl MockObject {
    pub fn ok(body: &str) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::from(body.to_string()),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.append(
            HeaderName::from_static(name),
            HeaderValue::from_str(value).unwrap(),
        );
        self
    }

    fn respond(&self, req: &ProxyRequest) -> OriginResponse {
        let etag = self.headers.get(ETAG);
        if etag.is_some() && etag == req.headers.get(IF_NONE_MATCH) {
            return OriginResponse {
                status: StatusCode::NOT_MODIFIED,
                headers: self.headers.clone(),
                body: Bytes::new(),
            };
        }
        OriginResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// A body the mock origin sends in pieces, pausing before each one.
#[derive(Debug, Clone)]
pub struct MockStream {
    pub chunks: Vec<Bytes>,
    pub interval: Duration,
    /// Replaces the last chunk with a transport error.
    pub broken: bool,
}

/// A Prometheus-like origin. Range queries get one `up` series with a sample
/// at every step of the requested window; other paths answer from `objects`.
#[derive(Default)]
pub struct MockOrigin {
    requests: Mutex<Vec<ProxyRequest>>,
    objects: Mutex<HashMap<String, MockObject>>,
    streams: Mutex<HashMap<String, MockStream>>,
    failure: Mutex<Option<Failure>>,
    delay: Mutex<Duration>,
}

impl MockOrigin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_object(&self, path: &str, object: MockObject) {
        self.objects.lock().insert(path.to_string(), object);
    }

    pub fn set_stream(&self, path: &str, stream: MockStream) {
        self.streams.lock().insert(path.to_string(), stream);
    }

    pub fn fail_with(&self, failure: Option<Failure>) {
        *self.failure.lock() = failure;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn requests(&self) -> Vec<ProxyRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// The `(start, end)` windows of every range query received, in seconds.
    pub fn range_windows(&self) -> Vec<(i64, i64)> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.path().ends_with("/query_range"))
            .filter_map(|r| {
                let start = parse_time(&r.query_param("start")?).ok()?;
                let end = parse_time(&r.query_param("end")?).ok()?;
                Some((start.timestamp(), end.timestamp()))
            })
            .collect()
    }
}

fn json_response(body: serde_json::Value) -> OriginResponse {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    OriginResponse {
        status: StatusCode::OK,
        headers,
        body: Bytes::from(body.to_string()),
    }
}

fn range_response(req: &ProxyRequest) -> OriginResponse {
    let parsed = (|| {
        let start = parse_time(&req.query_param("start")?).ok()?;
        let end = parse_time(&req.query_param("end")?).ok()?;
        let step = parse_step(&req.query_param("step")?).ok()?;
        Some((start, end, step))
    })();
    let Some((start, end, step)) = parsed else {
        return OriginResponse {
            status: StatusCode::BAD_REQUEST,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"bad range"),
        };
    };

    let mut values = Vec::new();
    let mut t = start;
    while t <= end {
        values.push(json!([t.timestamp(), "1"]));
        t += step;
    }
    json_response(json!({
        "status": "success",
        "data": {
            "resultType": "matrix",
            "result": [{"metric": {"__name__": "up", "job": "mock"}, "values": values}],
        },
    }))
}

fn instant_response() -> OriginResponse {
    json_response(json!({
        "status": "success",
        "data": {
            "resultType": "vector",
            "result": [{"metric": {"__name__": "up", "job": "mock"}, "value": [Utc::now().timestamp(), "1"]}],
        },
    }))
}

#[async_trait]
impl Upstream for MockOrigin {
    async fn fetch(&self, req: &ProxyRequest) -> Result<OriginResponse, StrideError> {
        self.requests.lock().push(req.clone());
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = *self.failure.lock();
        match failure {
            Some(Failure::Unreachable) => return Err(StrideError::OriginTimeout),
            Some(Failure::Status(status)) => {
                return Ok(OriginResponse {
                    status,
                    headers: HeaderMap::new(),
                    body: Bytes::from_static(b"origin failure"),
                });
            }
            None => {}
        }

        let path = req.url.path();
        let object = self.objects.lock().get(path).cloned();
        if let Some(object) = object {
            return Ok(object.respond(req));
        }
        if path.ends_with("/query_range") {
            return Ok(range_response(req));
        }
        if path.ends_with("/query") {
            return Ok(instant_response());
        }
        Ok(OriginResponse {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"not found"),
        })
    }

    async fn fetch_streaming(&self, req: &ProxyRequest) -> Result<StreamingResponse, StrideError> {
        let stream = self.streams.lock().get(req.url.path()).cloned();
        let Some(stream) = stream else {
            return self.fetch(req).await.map(StreamingResponse::from);
        };
        self.requests.lock().push(req.clone());

        let declared = stream.chunks.iter().map(Bytes::len).sum();
        let mut items: Vec<Result<Bytes, StrideError>> =
            stream.chunks.into_iter().map(Ok).collect();
        if stream.broken {
            items.pop();
            items.push(Err(StrideError::OriginTimeout));
        }
        let interval = stream.interval;
        let body = futures::stream::iter(items)
            .then(move |item| async move {
                tokio::time::sleep(interval).await;
                item
            })
            .boxed();
        Ok(StreamingResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            content_length: Some(declared),
            body,
        })
    }
}

/// A fully wired proxy whose every origin is served by one `MockOrigin`.
pub struct TestProxy {
    pub state: Arc<ServerState>,
    pub origin: Arc<MockOrigin>,
    pub cache: Arc<MemoryCache>,
}

impl TestProxy {
    pub fn new(toml: &str) -> Self {
        init_tracing();
        let config = Config::from_toml_str(toml).expect("test config should parse");
        let cache = Arc::new(MemoryCache::new(config.cache.clone()));
        let origin = MockOrigin::new();
        let upstreams: HashMap<String, Arc<dyn Upstream>> = config
            .origins
            .iter()
            .map(|o| (o.name.clone(), origin.clone() as Arc<dyn Upstream>))
            .collect();
        let state = ServerState::with_upstreams(config, cache.clone() as Arc<dyn Cache>, upstreams)
            .expect("state should build");
        Self {
            state: Arc::new(state),
            origin,
            cache,
        }
    }

    pub async fn get(&self, target: &str) -> EngineResponse {
        self.request(Method::GET, target, HeaderMap::new()).await
    }

    /// Routes `target` (path plus optional query) the way the front end does and serves it.
    pub async fn request(&self, method: Method, target: &str, headers: HeaderMap) -> EngineResponse {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        let (origin, origin_path) = self.state.route(path).expect("no origin for path");
        let url = origin.upstream_url(&origin_path, query);
        let req = ProxyRequest::new(method, url).with_headers(headers);
        origin.serve(req, &origin_path).await
    }

    /// The cache key a GET of `target` is stored under.
    pub fn cache_key(&self, target: &str) -> String {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (target, None),
        };
        let (origin, origin_path) = self.state.route(path).expect("no origin for path");
        let path_config = origin
            .config
            .find_path(&origin_path)
            .expect("no path config for target");
        let req = ProxyRequest::new(Method::GET, origin.upstream_url(&origin_path, query));
        format!(
            "{}.{}",
            origin.config.cache_key_prefix,
            derive_cache_key(&req, Some(path_config), None, "")
        )
    }
}

/// The single Prometheus origin used by the delta cache tests.
pub const PROMETHEUS_CONFIG: &str = r#"
[[origins]]
name = "prom"
origin_url = "http://prom.test:9090"
fast_forward_disable = true
"#;

pub const STEP_SECS: i64 = 60;

/// `now` aligned to the test step.
pub fn aligned_now() -> DateTime<Utc> {
    truncate(Utc::now(), TimeDelta::seconds(STEP_SECS))
}

/// A range query target for the `up` metric.
pub fn range_target(start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    format!(
        "/api/v1/query_range?query=up&start={}&end={}&step={STEP_SECS}",
        format_time(start),
        format_time(end)
    )
}

pub fn result_header(response: &EngineResponse) -> String {
    response
        .headers
        .get(RESULT_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

pub fn decode_matrix(response: &EngineResponse) -> MatrixEnvelope {
    PrometheusClient::new()
        .unmarshal_timeseries(&response.body)
        .expect("response should be a matrix")
}

/// Sample timestamps (seconds) of the first series in a response.
pub fn sample_times(response: &EngineResponse) -> Vec<i64> {
    decode_matrix(response)
        .data
        .result
        .first()
        .map(|s| s.values.iter().map(|v| v.timestamp.timestamp()).collect())
        .unwrap_or_default()
}
