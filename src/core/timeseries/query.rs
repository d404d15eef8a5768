// src/core/timeseries/query.rs

use super::extent::{Extent, ExtentList, truncate};
use chrono::{DateTime, TimeDelta, Utc};
use url::Url;

/// A parsed time range query: the origin statement plus the window and
/// resolution it asks for.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeRangeQuery {
    /// The origin query string, e.g. a PromQL expression.
    pub statement: String,
    pub extent: Extent,
    pub step: TimeDelta,
    /// True when the statement shifts its own window (PromQL `offset`).
    pub is_offset: bool,
    pub fast_forward_disable: bool,
    /// A URL whose query parameters stand in for the request's when deriving cache keys.
    pub template_url: Option<Url>,
}

impl TimeRangeQuery {
    /// Clamps the end to `now` (unless the query is offset) and aligns both
    /// ends of the extent to step boundaries.
    pub fn normalize_extent(&mut self, now: DateTime<Utc>) {
        if self.step <= TimeDelta::zero() {
            return;
        }
        if !self.is_offset && self.extent.end > now {
            self.extent.end = now;
        }
        self.extent.start = truncate(self.extent.start, self.step);
        self.extent.end = truncate(self.extent.end, self.step);
    }

    /// Returns the parts of this query's extent missing from `cached`.
    pub fn calculate_deltas(&self, cached: &ExtentList) -> ExtentList {
        cached.calculate_deltas(&self.extent, self.step)
    }
}
