// src/core/origins/mod.rs

//! Origin adapters: the format-specific knowledge the delta cache needs.

pub mod prometheus;

use crate::core::errors::StrideError;
use crate::core::proxy::request::ProxyRequest;
use crate::core::timeseries::{Extent, TimeRangeQuery, Timeseries};
use bytes::Bytes;

/// Translates between HTTP requests/responses of one origin format and
/// typed timeseries values.
pub trait TimeseriesClient: Send + Sync + 'static {
    type Series: Timeseries;

    fn name(&self) -> &'static str;

    /// Parses a ranged query. Requests that are not range queries yield
    /// `StrideError::NotTimeRangeQuery`.
    fn parse_time_range_query(&self, req: &ProxyRequest) -> Result<TimeRangeQuery, StrideError>;

    /// Rewrites `req` so that it asks for `extent` only.
    fn set_extent(&self, req: &mut ProxyRequest, trq: &TimeRangeQuery, extent: &Extent);

    /// Builds the request for the latest instantaneous value of the query.
    fn fast_forward_request(
        &self,
        req: &ProxyRequest,
        trq: &TimeRangeQuery,
    ) -> Result<ProxyRequest, StrideError>;

    fn unmarshal_timeseries(&self, body: &[u8]) -> Result<Self::Series, StrideError>;

    fn unmarshal_instantaneous(&self, body: &[u8]) -> Result<Self::Series, StrideError>;

    fn marshal_timeseries(&self, series: &Self::Series) -> Result<Bytes, StrideError>;
}
