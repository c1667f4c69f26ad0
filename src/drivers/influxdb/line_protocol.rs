//! InfluxDB line protocol serialisation
//!
//! ```text
//! measurement,tag=value,tag=value field=1.000000,count=3i 1698408000
//! ```
//!
//! Escaping is not idempotent: `a\ b` escapes to `a\\ b`. Pass raw names,
//! never already-escaped ones.

use crate::error::{TimeseriesError, TimeseriesResult};
use crate::point::{DataPoint, FieldValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp precision of written lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Precision {
    #[default]
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "ms")]
    Milliseconds,
    #[serde(rename = "us")]
    Microseconds,
    #[serde(rename = "ns")]
    Nanoseconds,
}

impl Precision {
    /// Value of the `precision` query parameter
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seconds => "s",
            Self::Milliseconds => "ms",
            Self::Microseconds => "us",
            Self::Nanoseconds => "ns",
        }
    }

    /// Timestamp in this precision; `None` when nanoseconds overflow i64
    pub fn timestamp(&self, ts: &DateTime<Utc>) -> Option<i64> {
        match self {
            Self::Seconds => Some(ts.timestamp()),
            Self::Milliseconds => Some(ts.timestamp_millis()),
            Self::Microseconds => Some(ts.timestamp_micros()),
            Self::Nanoseconds => ts.timestamp_nanos_opt(),
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s" => Ok(Self::Seconds),
            "ms" => Ok(Self::Milliseconds),
            "us" => Ok(Self::Microseconds),
            "ns" => Ok(Self::Nanoseconds),
            other => Err(format!("unknown precision '{}'", other)),
        }
    }
}

/// Measurement names escape commas and spaces
pub fn escape_measurement(name: &str) -> String {
    escape(name, &[',', ' '])
}

/// Tag keys, tag values and field keys escape commas, equals signs and spaces
pub fn escape_key(name: &str) -> String {
    escape(name, &[',', '=', ' '])
}

fn escape(input: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn field_value(key: &str, value: &FieldValue) -> TimeseriesResult<String> {
    match value {
        FieldValue::Integer(i) => Ok(format!("{}i", i)),
        FieldValue::Float(f) if f.is_finite() => Ok(format!("{:.6}", f)),
        FieldValue::Float(f) => Err(TimeseriesError::Write(format!(
            "field '{}' has non-finite value {}",
            key, f
        ))),
    }
}

/// Serialise one point
pub fn to_line(point: &DataPoint, precision: Precision) -> TimeseriesResult<String> {
    if point.measurement.is_empty() {
        return Err(TimeseriesError::Write("measurement is required".to_string()));
    }
    if point.fields.is_empty() {
        return Err(TimeseriesError::Write(format!(
            "point for '{}' has no fields",
            point.measurement
        )));
    }

    let mut line = escape_measurement(&point.measurement);
    for (key, value) in &point.tags {
        // empty tag values are not representable
        if value.is_empty() {
            continue;
        }
        line.push(',');
        line.push_str(&escape_key(key));
        line.push('=');
        line.push_str(&escape_key(value));
    }

    let fields = point
        .fields
        .iter()
        .map(|(key, value)| Ok(format!("{}={}", escape_key(key), field_value(key, value)?)))
        .collect::<TimeseriesResult<Vec<_>>>()?;
    line.push(' ');
    line.push_str(&fields.join(","));

    let timestamp = precision.timestamp(&point.timestamp).ok_or_else(|| {
        TimeseriesError::Write(format!("timestamp {} out of range", point.timestamp))
    })?;
    line.push(' ');
    line.push_str(&timestamp.to_string());

    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Sample;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_sample_line() {
        let point: DataPoint = Sample::new("app", "cpu_usage", 42.5, noon())
            .label("host", "server01")
            .label("region", "us-west")
            .into();

        assert_eq!(
            to_line(&point, Precision::Seconds).unwrap(),
            "app_cpu_usage,host=server01,region=us-west value=42.500000 1698408000"
        );
    }

    #[test]
    fn test_escaping() {
        let point: DataPoint = Sample::new("my namespace", "my,metric", 100i64, noon())
            .label("label=name", "label value")
            .into();

        assert_eq!(
            to_line(&point, Precision::Seconds).unwrap(),
            "my\\ namespace_my\\,metric,label\\=name=label\\ value value=100i 1698408000"
        );
    }

    #[test]
    fn test_escaping_is_not_idempotent() {
        let once = escape_key("a b");
        assert_eq!(once, "a\\ b");
        assert_eq!(escape_key(&once), "a\\\\ b");
    }

    #[test]
    fn test_precision() {
        let point = DataPoint::with_timestamp("m", noon()).add_field("v", 1i64);
        assert!(to_line(&point, Precision::Milliseconds).unwrap().ends_with(" 1698408000000"));
        assert!(to_line(&point, Precision::Nanoseconds).unwrap().ends_with(" 1698408000000000000"));
        assert_eq!(Precision::Microseconds.as_str(), "us");
    }

    #[test]
    fn test_invalid_points() {
        let empty = DataPoint::with_timestamp("m", noon());
        assert!(matches!(to_line(&empty, Precision::Seconds), Err(TimeseriesError::Write(_))));

        let nan = DataPoint::with_timestamp("m", noon()).add_field("v", f64::NAN);
        assert!(to_line(&nan, Precision::Seconds).is_err());
    }
}
