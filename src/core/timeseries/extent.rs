// src/core/timeseries/extent.rs

//! Time extents and the gap calculus used to reconcile cached series with
//! a requested range.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Truncates `t` down to a multiple of `step`, measured from the Unix epoch.
/// A non-positive step leaves the timestamp untouched.
pub fn truncate(t: DateTime<Utc>, step: TimeDelta) -> DateTime<Utc> {
    let step_ms = step.num_milliseconds();
    if step_ms <= 0 {
        return t;
    }
    let ms = t.timestamp_millis();
    DateTime::from_timestamp_millis(ms - ms.rem_euclid(step_ms)).unwrap_or(t)
}

/// A closed time interval `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extent {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// When a client last asked for this range. Only set under LRU eviction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl Extent {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start,
            end,
            last_used: None,
        }
    }

    /// Returns true if `t` falls within the extent, inclusive of both ends.
    pub fn includes(&self, t: DateTime<Utc>) -> bool {
        t >= self.start && t <= self.end
    }

    /// Returns the overlapping portion of two extents, if any.
    pub fn intersect(&self, other: &Extent) -> Option<Extent> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(Extent { start, end, ..*self })
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start.timestamp(), self.end.timestamp())
    }
}

/// An ordered list of extents describing which parts of a series are known.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtentList(pub Vec<Extent>);

impl ExtentList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Sorts the list and merges extents that overlap or sit exactly one step
    /// apart. Extents last used at different times are kept apart.
    pub fn compress(&self, step: TimeDelta) -> ExtentList {
        let mut sorted = self.0.clone();
        sorted.sort_by_key(|e| e.start);

        let mut out: Vec<Extent> = Vec::with_capacity(sorted.len());
        for e in sorted {
            if let Some(last) = out.last_mut() {
                if e.last_used == last.last_used && e.start <= last.end + step {
                    if e.end > last.end {
                        last.end = e.end;
                    }
                    continue;
                }
            }
            out.push(e);
        }
        ExtentList(out)
    }

    /// Intersects every extent with `bounds`, dropping those that fall outside it.
    pub fn crop(&self, bounds: &Extent) -> ExtentList {
        ExtentList(self.0.iter().filter_map(|e| e.intersect(bounds)).collect())
    }

    /// Returns the extent spanning from the earliest start to the latest end.
    pub fn outer_extent(&self) -> Option<Extent> {
        let start = self.0.iter().map(|e| e.start).min()?;
        let end = self.0.iter().map(|e| e.end).max()?;
        Some(Extent::new(start, end))
    }

    /// Computes the ranges of `want` that are not covered by this list.
    ///
    /// The step points of `want`, both ends included, are checked against
    /// the known extents; consecutive missing points are grouped into one
    /// extent. Work is proportional to the number of known extents, not to
    /// the number of points.
    pub fn calculate_deltas(&self, want: &Extent, step: TimeDelta) -> ExtentList {
        if self.0.is_empty() {
            return ExtentList(vec![*want]);
        }
        if step <= TimeDelta::zero() {
            let covered = self.0.iter().any(|e| e.includes(want.start) && e.includes(want.end));
            return if covered { ExtentList::new() } else { ExtentList(vec![*want]) };
        }
        if want.end < want.start {
            return ExtentList::new();
        }

        let origin = to_nanos(want.start);
        let step_ns = delta_nanos(step);
        let last = (to_nanos(want.end) - origin).div_euclid(step_ns);

        // Indices of the step points each known extent covers.
        let mut covered: Vec<(i128, i128)> = self
            .0
            .iter()
            .filter_map(|e| {
                let lo = ceil_div(to_nanos(e.start) - origin, step_ns).max(0);
                let hi = (to_nanos(e.end) - origin).div_euclid(step_ns).min(last);
                (lo <= hi).then_some((lo, hi))
            })
            .collect();
        covered.sort_unstable();

        let point = |k: i128| from_nanos(origin + k * step_ns);
        let mut misses: Vec<Extent> = Vec::new();
        let mut next = 0i128;
        for (lo, hi) in covered {
            if lo > next
                && let (Some(start), Some(end)) = (point(next), point(lo - 1))
            {
                misses.push(Extent::new(start, end));
            }
            next = next.max(hi + 1);
        }
        if next <= last
            && let (Some(start), Some(end)) = (point(next), point(last))
        {
            misses.push(Extent::new(start, end));
        }
        ExtentList(misses)
    }

    /// Stamps the parts of every extent that overlap `used` as used at `now`,
    /// splitting extents on the boundaries of `used`.
    pub fn mark_used(&self, used: &Extent, step: TimeDelta, now: DateTime<Utc>) -> ExtentList {
        let mut out: Vec<Extent> = Vec::with_capacity(self.0.len() + 2);
        for x in &self.0 {
            let Some(mid) = x.intersect(used) else {
                out.push(*x);
                continue;
            };
            if let Some(end) = mid.start.checked_sub_signed(step)
                && x.start < mid.start
                && x.start <= end
            {
                out.push(Extent { end, ..*x });
            }
            out.push(Extent {
                last_used: Some(now),
                ..mid
            });
            if let Some(start) = mid.end.checked_add_signed(step)
                && x.end > mid.end
                && start <= x.end
            {
                out.push(Extent { start, ..*x });
            }
        }
        ExtentList(out).compress(step)
    }
}

const NANOS_PER_SEC: i128 = 1_000_000_000;

fn to_nanos(t: DateTime<Utc>) -> i128 {
    i128::from(t.timestamp()) * NANOS_PER_SEC + i128::from(t.timestamp_subsec_nanos())
}

fn delta_nanos(d: TimeDelta) -> i128 {
    i128::from(d.num_seconds()) * NANOS_PER_SEC + i128::from(d.subsec_nanos())
}

fn from_nanos(ns: i128) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(ns.div_euclid(NANOS_PER_SEC)).ok()?;
    let nanos = u32::try_from(ns.rem_euclid(NANOS_PER_SEC)).ok()?;
    DateTime::from_timestamp(secs, nanos)
}

fn ceil_div(n: i128, d: i128) -> i128 {
    -(-n).div_euclid(d)
}

impl Deref for ExtentList {
    type Target = Vec<Extent>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for ExtentList {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Vec<Extent>> for ExtentList {
    fn from(v: Vec<Extent>) -> Self {
        ExtentList(v)
    }
}

impl fmt::Display for ExtentList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}
