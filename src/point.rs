//! Write-side data types
//!
//! - `DataPoint`: one measurement at one instant, with numeric fields and tags
//! - `Sample`: a Prometheus-style metric sample, converted into a `DataPoint`
//!   before it reaches a driver

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Numeric field value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Integer(i64),
    Float(f64),
}

impl FieldValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            Self::Integer(i) => *i as f64,
            Self::Float(f) => *f,
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Self::Integer(_))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl std::str::FromStr for FieldValue {
    type Err = String;

    /// `42` and `42i` parse as integers, anything else numeric as a float
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(i) = s.strip_suffix('i').unwrap_or(s).parse::<i64>() {
            return Ok(Self::Integer(i));
        }
        s.parse::<f64>()
            .map(Self::Float)
            .map_err(|_| format!("'{}' is not a number", s))
    }
}

/// A single point to write
///
/// Fields and tags are ordered maps so every serialisation of the same point
/// is byte-identical.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub measurement: String,
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    /// Create an empty point stamped with the current time
    pub fn new(measurement: impl Into<String>) -> Self {
        Self::with_timestamp(measurement, Utc::now())
    }

    pub fn with_timestamp(measurement: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.into(),
            fields: BTreeMap::new(),
            tags: BTreeMap::new(),
            timestamp,
        }
    }

    /// Builder method: add a tag
    pub fn add_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder method: add a field
    pub fn add_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Builder method: set timestamp
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A metric sample in the namespace/name/labels shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub value: FieldValue,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<FieldValue>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            labels: BTreeMap::new(),
            value: value.into(),
            timestamp,
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// `namespace_name`, or just `name` without a namespace
    pub fn measurement(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}_{}", self.namespace, self.name)
        }
    }
}

impl From<Sample> for DataPoint {
    fn from(sample: Sample) -> Self {
        let measurement = sample.measurement();
        Self {
            measurement,
            fields: BTreeMap::from([("value".to_string(), sample.value)]),
            tags: sample.labels,
            timestamp: sample.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_builder_mutation() {
        let ts = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let point = DataPoint::with_timestamp("cpu", ts)
            .add_tag("host", "a")
            .add_field("usage", 42.5)
            .add_field("cores", 8i64);

        assert_eq!(point.tags["host"], "a");
        assert_eq!(point.fields["usage"], FieldValue::Float(42.5));
        assert!(point.fields["cores"].is_integer());
    }

    #[test]
    fn test_sample_conversion() {
        let ts = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let point: DataPoint = Sample::new("app", "cpu_usage", 42.5, ts)
            .label("host", "server01")
            .into();

        assert_eq!(point.measurement, "app_cpu_usage");
        assert_eq!(point.fields.keys().collect::<Vec<_>>(), vec!["value"]);
        assert_eq!(point.tags["host"], "server01");
    }

    #[test]
    fn test_field_value_from_str() {
        assert_eq!("42".parse::<FieldValue>().unwrap(), FieldValue::Integer(42));
        assert_eq!("42i".parse::<FieldValue>().unwrap(), FieldValue::Integer(42));
        assert_eq!("4.5".parse::<FieldValue>().unwrap(), FieldValue::Float(4.5));
        assert!("abc".parse::<FieldValue>().is_err());
    }
}
