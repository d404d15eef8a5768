// src/core/origins/prometheus/mod.rs

//! The Prometheus HTTP API adapter.

pub mod model;

pub use model::{MatrixEnvelope, SamplePair, SampleStream, VectorEnvelope};

use super::TimeseriesClient;
use crate::core::errors::StrideError;
use crate::core::proxy::request::ProxyRequest;
use crate::core::timeseries::{Extent, TimeRangeQuery};
use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use humantime_serde::re::humantime;
use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};

pub const API_PATH: &str = "/api/v1/";
pub const QUERY_RANGE_PATH: &str = "query_range";
pub const QUERY_PATH: &str = "query";

const FORM_MEDIA_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusClient;

impl PrometheusClient {
    pub fn new() -> Self {
        Self
    }
}

fn is_form_post(req: &ProxyRequest) -> bool {
    req.method == Method::POST && req.media_type().as_deref() == Some(FORM_MEDIA_TYPE)
}

/// The request parameters, taken from a form body for form POSTs and from
/// the query string otherwise.
fn request_params(req: &ProxyRequest) -> Vec<(String, String)> {
    if is_form_post(req) {
        url::form_urlencoded::parse(&req.body).into_owned().collect()
    } else {
        req.url.query_pairs().into_owned().collect()
    }
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Parses a Prometheus timestamp: unix seconds (fractions allowed) or RFC 3339.
pub fn parse_time(raw: &str) -> Result<DateTime<Utc>, StrideError> {
    if let Ok(secs) = raw.parse::<f64>() {
        return DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
            .ok_or_else(|| StrideError::InvalidRequest(format!("timestamp out of range: {raw}")));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StrideError::InvalidRequest(format!("unparseable timestamp: {raw}")))
}

/// Parses a step: float seconds or a duration such as `15s` or `1m30s`.
pub fn parse_step(raw: &str) -> Result<TimeDelta, StrideError> {
    if let Ok(secs) = raw.parse::<f64>() {
        return Ok(TimeDelta::milliseconds((secs * 1000.0).round() as i64));
    }
    let d = humantime::parse_duration(raw)
        .map_err(|_| StrideError::InvalidRequest(format!("unparseable step: {raw}")))?;
    TimeDelta::from_std(d).map_err(|_| StrideError::InvalidRequest(format!("step too large: {raw}")))
}

/// Formats a timestamp the way the Prometheus API accepts it.
pub fn format_time(t: DateTime<Utc>) -> String {
    let ms = t.timestamp_millis();
    if ms % 1000 == 0 {
        (ms / 1000).to_string()
    } else {
        format!("{:.3}", ms as f64 / 1000.0)
    }
}

impl TimeseriesClient for PrometheusClient {
    type Series = MatrixEnvelope;

    fn name(&self) -> &'static str {
        "prometheus"
    }

    fn parse_time_range_query(&self, req: &ProxyRequest) -> Result<TimeRangeQuery, StrideError> {
        if !req.url.path().ends_with(QUERY_RANGE_PATH) {
            return Err(StrideError::NotTimeRangeQuery(req.url.path().to_string()));
        }
        let params = request_params(req);
        let required = |name: &str| {
            param(&params, name)
                .ok_or_else(|| StrideError::NotTimeRangeQuery(format!("missing '{name}' parameter")))
        };

        let statement = required("query")?.to_string();
        let start = parse_time(required("start")?)?;
        let end = parse_time(required("end")?)?;
        let step = parse_step(required("step")?)?;

        if step <= TimeDelta::zero() {
            return Err(StrideError::InvalidRequest(
                "step must be a positive duration".to_string(),
            ));
        }
        if start > end {
            return Err(StrideError::InvalidRequest(
                "end timestamp must not be before start time".to_string(),
            ));
        }

        let is_offset = statement.to_ascii_lowercase().contains(" offset ");
        Ok(TimeRangeQuery {
            statement,
            extent: Extent::new(start, end),
            step,
            is_offset,
            fast_forward_disable: false,
            template_url: None,
        })
    }

    fn set_extent(&self, req: &mut ProxyRequest, _trq: &TimeRangeQuery, extent: &Extent) {
        let start = format_time(extent.start);
        let end = format_time(extent.end);

        if is_form_post(req) {
            let kept: Vec<(String, String)> = request_params(req)
                .into_iter()
                .filter(|(k, _)| k != "start" && k != "end")
                .collect();
            let body = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(kept)
                .append_pair("start", &start)
                .append_pair("end", &end)
                .finish();
            req.headers.remove(CONTENT_LENGTH);
            req.body = Bytes::from(body);
            return;
        }

        let kept: Vec<(String, String)> = req
            .url
            .query_pairs()
            .into_owned()
            .filter(|(k, _)| k != "start" && k != "end")
            .collect();
        req.url
            .query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair("start", &start)
            .append_pair("end", &end);
    }

    fn fast_forward_request(
        &self,
        req: &ProxyRequest,
        trq: &TimeRangeQuery,
    ) -> Result<ProxyRequest, StrideError> {
        let path = req.url.path();
        let Some(prefix) = path.strip_suffix(QUERY_RANGE_PATH) else {
            return Err(StrideError::NotTimeRangeQuery(path.to_string()));
        };

        let mut url = req.url.clone();
        url.set_path(&format!("{prefix}{QUERY_PATH}"));
        url.query_pairs_mut()
            .clear()
            .append_pair("query", &trq.statement);

        let mut headers = req.headers.clone();
        headers.remove(CONTENT_TYPE);
        headers.remove(CONTENT_LENGTH);
        let mut ff = ProxyRequest::new(Method::GET, url).with_headers(headers);
        ff.client_addr = req.client_addr;
        Ok(ff)
    }

    fn unmarshal_timeseries(&self, body: &[u8]) -> Result<MatrixEnvelope, StrideError> {
        let envelope: MatrixEnvelope = serde_json::from_slice(body)?;
        if envelope.status != "success" {
            return Err(StrideError::Unmarshal(format!(
                "origin reported status '{}'",
                envelope.status
            )));
        }
        if envelope.data.result_type != "matrix" {
            return Err(StrideError::Unmarshal(format!(
                "expected a matrix, got '{}'",
                envelope.data.result_type
            )));
        }
        Ok(envelope)
    }

    fn unmarshal_instantaneous(&self, body: &[u8]) -> Result<MatrixEnvelope, StrideError> {
        let envelope: VectorEnvelope = serde_json::from_slice(body)?;
        if envelope.status != "success" || envelope.data.result_type != "vector" {
            return Err(StrideError::Unmarshal(format!(
                "expected a successful vector, got status '{}' type '{}'",
                envelope.status, envelope.data.result_type
            )));
        }
        Ok(envelope.into())
    }

    fn marshal_timeseries(&self, series: &MatrixEnvelope) -> Result<Bytes, StrideError> {
        Ok(Bytes::from(serde_json::to_vec(series)?))
    }
}
