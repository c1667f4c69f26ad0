//! Prometheus HTTP API responses
//!
//! Every endpoint answers `{"status": "success"|"error", "data": ...}`.
//! Sample values are strings (`"1.5"`, `"NaN"`, `"+Inf"`); anything that is
//! not a finite number becomes a gap.

use crate::error::{TimeseriesError, TimeseriesResult};
use crate::query::{LabelResult, Series, TimeSeriesResult};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;

const DRIVER: &str = "prometheus";
const NAME_LABEL: &str = "__name__";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    status: String,
    data: Option<T>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "resultType", content = "result", rename_all = "lowercase")]
enum QueryData {
    Matrix(Vec<RangeSeries>),
    Vector(Vec<InstantSample>),
    Scalar((f64, String)),
    String((f64, String)),
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

#[derive(Debug, Deserialize)]
struct InstantSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

fn decode<T: DeserializeOwned>(body: &str) -> TimeseriesResult<T> {
    let envelope: Envelope<T> = serde_json::from_str(body)
        .map_err(|e| TimeseriesError::response(DRIVER, format!("invalid JSON: {}", e)))?;

    if envelope.status != "success" {
        return Err(TimeseriesError::response(
            DRIVER,
            format!(
                "{}: {}",
                envelope.error_type.as_deref().unwrap_or("error"),
                envelope.error.as_deref().unwrap_or("unknown error")
            ),
        ));
    }
    envelope
        .data
        .ok_or_else(|| TimeseriesError::response(DRIVER, "response has no data"))
}

/// `errorType: error` from an error body, if it is one
pub fn api_error(body: &str) -> Option<String> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_str(body).ok()?;
    let error = envelope.error?;
    Some(match envelope.error_type {
        Some(kind) => format!("{}: {}", kind, error),
        None => error,
    })
}

fn timestamp(seconds: f64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_millis((seconds * 1000.0).round() as i64)
}

fn sample_value(raw: &str) -> Option<f64> {
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

fn series_for(mut metric: BTreeMap<String, String>, fallback: &str) -> Series {
    let name = metric.remove(NAME_LABEL).unwrap_or_else(|| fallback.to_string());
    Series::new(name).with_labels(metric)
}

/// Parse a `query_range` (or instant `query`) body. Series without a
/// `__name__` label, as aggregations produce, are named `fallback`.
pub fn parse_query_range(body: &str, fallback: &str) -> TimeseriesResult<TimeSeriesResult> {
    let series = match decode::<QueryData>(body)? {
        QueryData::Matrix(matrix) => matrix
            .into_iter()
            .map(|range| {
                let mut series = series_for(range.metric, fallback);
                for (ts, raw) in &range.values {
                    if let Some(ts) = timestamp(*ts) {
                        series.push(ts, sample_value(raw));
                    }
                }
                series
            })
            .collect(),
        QueryData::Vector(vector) => vector
            .into_iter()
            .map(|sample| {
                let mut series = series_for(sample.metric, fallback);
                if let Some(ts) = timestamp(sample.value.0) {
                    series.push(ts, sample_value(&sample.value.1));
                }
                series
            })
            .collect(),
        QueryData::Scalar((ts, raw)) => {
            let mut series = Series::new(fallback);
            if let Some(ts) = timestamp(ts) {
                series.push(ts, sample_value(&raw));
            }
            vec![series]
        }
        QueryData::String(_) => {
            return Err(TimeseriesError::response(DRIVER, "string results are not time series"))
        }
    };
    Ok(TimeSeriesResult::new(series))
}

/// Parse `/api/v1/labels` and `/api/v1/label/<name>/values`
pub fn parse_label_values(body: &str) -> TimeseriesResult<LabelResult> {
    let values: Vec<String> = decode(body)?;
    Ok(LabelResult::new(values))
}
