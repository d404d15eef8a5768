// src/core/origins/prometheus/model.rs

//! The Prometheus HTTP API response envelopes and their timeseries behavior.

use crate::core::timeseries::{Extent, ExtentList, Timeseries};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One `[<unix seconds>, "<value>"]` sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "(f64, String)", into = "(f64, String)")]
pub struct SamplePair {
    pub timestamp: DateTime<Utc>,
    pub value: String,
}

impl TryFrom<(f64, String)> for SamplePair {
    type Error = String;

    fn try_from((secs, value): (f64, String)) -> Result<Self, Self::Error> {
        let timestamp = DateTime::from_timestamp_millis((secs * 1000.0).round() as i64)
            .ok_or_else(|| format!("sample timestamp {secs} out of range"))?;
        Ok(Self { timestamp, value })
    }
}

impl From<SamplePair> for (f64, String) {
    fn from(p: SamplePair) -> Self {
        (p.timestamp.timestamp_millis() as f64 / 1000.0, p.value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleStream {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    #[serde(default)]
    pub values: Vec<SamplePair>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<SampleStream>,
}

fn extents_empty(e: &ExtentList) -> bool {
    e.is_empty()
}

/// A `resultType: matrix` response.
///
/// `extents` and `step` only travel with cached copies; they are cleared
/// before a series is marshaled for a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatrixEnvelope {
    pub status: String,
    #[serde(default)]
    pub data: MatrixData,
    #[serde(rename = "errorType", default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "extents_empty")]
    pub extents: ExtentList,
    /// Step in milliseconds.
    #[serde(rename = "step", default, skip_serializing_if = "Option::is_none")]
    pub step_ms: Option<i64>,
}

/// One `resultType: vector` sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSample {
    #[serde(default)]
    pub metric: BTreeMap<String, String>,
    pub value: SamplePair,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorData {
    #[serde(rename = "resultType")]
    pub result_type: String,
    #[serde(default)]
    pub result: Vec<VectorSample>,
}

/// A `resultType: vector` response, as returned by instant queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VectorEnvelope {
    pub status: String,
    #[serde(default)]
    pub data: VectorData,
}

impl From<VectorEnvelope> for MatrixEnvelope {
    fn from(v: VectorEnvelope) -> Self {
        let result = v
            .data
            .result
            .into_iter()
            .map(|s| SampleStream {
                metric: s.metric,
                values: vec![s.value],
            })
            .collect();
        MatrixEnvelope {
            status: v.status,
            data: MatrixData {
                result_type: "matrix".to_string(),
                result,
            },
            ..Default::default()
        }
    }
}

impl MatrixEnvelope {
    /// The earliest and latest sample timestamps.
    fn extremes(&self) -> Option<Extent> {
        let mut stamps = self
            .data
            .result
            .iter()
            .flat_map(|s| s.values.iter().map(|p| p.timestamp));
        let first = stamps.next()?;
        let (start, end) = stamps.fold((first, first), |(lo, hi), t| (lo.min(t), hi.max(t)));
        Some(Extent::new(start, end))
    }

    fn timestamps(&self) -> BTreeSet<DateTime<Utc>> {
        self.data
            .result
            .iter()
            .flat_map(|s| s.values.iter().map(|p| p.timestamp))
            .collect()
    }
}

/// Splits `e` around evicted timestamps, keeping the runs that still hold data.
fn surviving_runs(
    e: &Extent,
    stamps: &BTreeSet<DateTime<Utc>>,
    removed: &BTreeSet<DateTime<Utc>>,
) -> Vec<Extent> {
    let mut runs = Vec::new();
    let mut start = Some(e.start);
    let mut end = None;
    for t in stamps.range(e.start..=e.end) {
        if removed.contains(t) {
            if let (Some(start), Some(end)) = (start, end) {
                runs.push(Extent { start, end, ..*e });
            }
            start = None;
            end = None;
        } else {
            start.get_or_insert(*t);
            end = Some(*t);
        }
    }
    if let Some(start) = start {
        runs.push(Extent { start, ..*e });
    }
    runs
}

impl Timeseries for MatrixEnvelope {
    fn merge(&mut self, sort: bool, others: Vec<Self>) {
        let mut extents = self.extents();
        for other in others {
            if self.step_ms.is_none() {
                self.step_ms = other.step_ms;
            }
            extents.extend(other.extents().iter().copied());
            for stream in other.data.result {
                match self
                    .data
                    .result
                    .iter_mut()
                    .find(|s| s.metric == stream.metric)
                {
                    Some(existing) => existing.values.extend(stream.values),
                    None => self.data.result.push(stream),
                }
            }
        }
        self.extents = extents.compress(self.step());
        if sort {
            self.sort();
        }
    }

    fn crop(&mut self, extent: &Extent) {
        let known = self.extents();
        for stream in &mut self.data.result {
            stream.values.retain(|p| extent.includes(p.timestamp));
        }
        self.data.result.retain(|s| !s.values.is_empty());
        self.extents = known.crop(extent);
    }

    fn sort(&mut self) {
        for stream in &mut self.data.result {
            let mut by_time: BTreeMap<DateTime<Utc>, SamplePair> = BTreeMap::new();
            for pair in stream.values.drain(..) {
                by_time.insert(pair.timestamp, pair);
            }
            stream.values = by_time.into_values().collect();
        }
    }

    fn extents(&self) -> ExtentList {
        if !self.extents.is_empty() {
            return self.extents.clone();
        }
        self.extremes()
            .map(|e| ExtentList(vec![e]))
            .unwrap_or_default()
    }

    fn set_extents(&mut self, extents: ExtentList) {
        self.extents = extents;
    }

    fn step(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.step_ms.unwrap_or(0))
    }

    fn set_step(&mut self, step: TimeDelta) {
        let ms = step.num_milliseconds();
        self.step_ms = (ms > 0).then_some(ms);
    }

    fn series_count(&self) -> usize {
        self.data.result.len()
    }

    fn value_count(&self) -> usize {
        self.data.result.iter().map(|s| s.values.len()).sum()
    }

    fn timestamp_count(&self) -> usize {
        self.timestamps().len()
    }

    fn crop_to_size(
        &mut self,
        size: usize,
        newest: DateTime<Utc>,
        used: &Extent,
        now: DateTime<Utc>,
    ) {
        let Some(outer) = self.extents().outer_extent() else {
            return;
        };
        if outer.end > newest {
            self.crop(&Extent::new(outer.start, newest));
        }

        let step = self.step();
        let extents = self.extents().mark_used(used, step, now);
        let stamps = self.timestamps();
        if stamps.len() <= size {
            self.extents = extents;
            return;
        }

        let mut by_recency: Vec<&Extent> = extents.iter().filter(|e| e.start <= e.end).collect();
        by_recency.sort_by_key(|e| (e.last_used, e.start));
        let excess = stamps.len() - size;
        let mut removed: BTreeSet<DateTime<Utc>> = BTreeSet::new();
        let candidates = by_recency
            .iter()
            .flat_map(|e| stamps.range(e.start..=e.end))
            .chain(stamps.iter());
        for t in candidates {
            if removed.len() >= excess {
                break;
            }
            removed.insert(*t);
        }

        for stream in &mut self.data.result {
            stream.values.retain(|p| !removed.contains(&p.timestamp));
        }
        self.data.result.retain(|s| !s.values.is_empty());

        let kept: Vec<Extent> = extents
            .iter()
            .filter(|e| e.start <= e.end)
            .flat_map(|e| surviving_runs(e, &stamps, &removed))
            .collect();
        self.extents = ExtentList(kept).compress(step);
    }
}
