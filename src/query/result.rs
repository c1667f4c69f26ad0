//! Uniform result model
//!
//! Every backend parser lifts its payload into these types. Series inside
//! one result may have different lengths; nothing aligns their timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Free-form result metadata (backend, compiled query, step, ...)
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A single timestamped value; `None` for gaps (null, NaN)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
}

impl Point {
    pub fn new(timestamp: DateTime<Utc>, value: Option<f64>) -> Self {
        Self { timestamp, value }
    }
}

/// A named, labeled sequence of points
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Series {
    pub metric: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub points: Vec<Point>,
}

impl Series {
    pub fn new(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            labels: BTreeMap::new(),
            points: Vec::new(),
        }
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    pub fn push(&mut self, timestamp: DateTime<Utc>, value: Option<f64>) {
        self.points.push(Point::new(timestamp, value));
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Non-null values in order
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().filter_map(|p| p.value).collect()
    }
}

/// Result of a data query
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimeSeriesResult {
    pub series: Vec<Series>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TimeSeriesResult {
    pub fn new(series: Vec<Series>) -> Self {
        Self {
            series,
            metadata: Metadata::new(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Find a series by metric name
    pub fn get(&self, metric: &str) -> Option<&Series> {
        self.series.iter().find(|s| s.metric == metric)
    }

    /// Total number of points across all series
    pub fn point_count(&self) -> usize {
        self.series.iter().map(Series::len).sum()
    }
}

/// Result of a schema-discovery query
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelResult {
    pub values: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl LabelResult {
    pub fn new(values: Vec<String>) -> Self {
        Self {
            values,
            metadata: Metadata::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// What an executor hands back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryResult {
    TimeSeries(TimeSeriesResult),
    Labels(LabelResult),
}

impl QueryResult {
    pub fn as_time_series(&self) -> Option<&TimeSeriesResult> {
        match self {
            Self::TimeSeries(r) => Some(r),
            Self::Labels(_) => None,
        }
    }

    pub fn into_time_series(self) -> Option<TimeSeriesResult> {
        match self {
            Self::TimeSeries(r) => Some(r),
            Self::Labels(_) => None,
        }
    }

    pub fn into_labels(self) -> Option<LabelResult> {
        match self {
            Self::Labels(r) => Some(r),
            Self::TimeSeries(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::TimeSeries(r) => r.is_empty(),
            Self::Labels(r) => r.is_empty(),
        }
    }
}

impl From<TimeSeriesResult> for QueryResult {
    fn from(r: TimeSeriesResult) -> Self {
        Self::TimeSeries(r)
    }
}

impl From<LabelResult> for QueryResult {
    fn from(r: LabelResult) -> Self {
        Self::Labels(r)
    }
}
