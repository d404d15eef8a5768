// src/core/timeseries/mod.rs

//! Time-series reconciliation: extents, gap calculus and the capability set
//! every origin-specific series representation implements.

pub mod extent;
pub mod query;

pub use extent::{Extent, ExtentList, truncate};
pub use query::TimeRangeQuery;

use chrono::{DateTime, TimeDelta, Utc};

/// The operations the delta cache needs from a decoded origin response.
///
/// Implementations hold one or more series, each a list of timestamped
/// samples identified by its label set.
pub trait Timeseries: Clone + Send + Sync + 'static {
    /// Appends the samples of `others` to matching series, adding series that
    /// are not yet present, and unions the extents. When `sort` is set the
    /// result is sorted and de-duplicated.
    fn merge(&mut self, sort: bool, others: Vec<Self>);

    /// Keeps only samples inside `extent`. Works on unsorted input.
    fn crop(&mut self, extent: &Extent);

    /// Orders every series by timestamp and drops duplicate timestamps,
    /// keeping the last sample written for each.
    fn sort(&mut self);

    /// Known extents. When none were set they are derived from the samples.
    fn extents(&self) -> ExtentList;

    fn set_extents(&mut self, extents: ExtentList);

    fn step(&self) -> TimeDelta;

    fn set_step(&mut self, step: TimeDelta);

    fn series_count(&self) -> usize;

    fn value_count(&self) -> usize;

    /// Number of distinct sample timestamps across all series.
    fn timestamp_count(&self) -> usize;

    /// Drops samples newer than `newest`, marks `used` as requested at `now`,
    /// then evicts the timestamps of the least recently used extents until
    /// at most `size` remain.
    fn crop_to_size(
        &mut self,
        size: usize,
        newest: DateTime<Utc>,
        used: &Extent,
        now: DateTime<Utc>,
    );
}
