//! Graphite render and find responses
//!
//! Render output is a JSON array of `{target, datapoints: [[value, ts]]}`.
//! Misconfigured Graphite servers answer with an HTML page instead; that
//! is logged and read as an empty result.

use crate::error::{TimeseriesError, TimeseriesResult};
use crate::query::{LabelResult, Series, TimeSeriesResult};
use chrono::DateTime;
use serde::Deserialize;
use std::collections::BTreeMap;

const DRIVER: &str = "graphite";

#[derive(Debug, Deserialize)]
struct RenderedSeries {
    target: String,
    datapoints: Vec<(Option<f64>, Option<i64>)>,
    #[serde(default)]
    tags: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FindNode {
    text: String,
}

/// Parse a `/render?format=json` body; unreadable bodies give no series
pub fn parse_render(body: &str) -> TimeSeriesResult {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        tracing::warn!(driver = DRIVER, "Empty render response");
        return TimeSeriesResult::empty();
    }

    let rendered: Vec<RenderedSeries> = match serde_json::from_str(trimmed) {
        Ok(rendered) => rendered,
        Err(e) => {
            tracing::warn!(
                driver = DRIVER,
                error = %e,
                body = %snippet(trimmed),
                "Render response is not JSON, treating as empty"
            );
            return TimeSeriesResult::empty();
        }
    };

    let series = rendered
        .into_iter()
        .map(|rendered| {
            let labels = rendered
                .tags
                .into_iter()
                .filter(|(key, _)| key != "name")
                .map(|(key, value)| {
                    let value = match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    };
                    (key, value)
                })
                .collect();

            let mut series = Series::new(rendered.target).with_labels(labels);
            for (value, ts) in rendered.datapoints {
                let Some(timestamp) = ts.and_then(|ts| DateTime::from_timestamp(ts, 0)) else {
                    continue;
                };
                series.push(timestamp, value.filter(|v| v.is_finite()));
            }
            series
        })
        .collect();

    TimeSeriesResult::new(series)
}

/// Node names from `/metrics/find`
pub fn parse_find(body: &str) -> TimeseriesResult<LabelResult> {
    let nodes: Vec<FindNode> = serde_json::from_str(body.trim())
        .map_err(|e| TimeseriesError::response(DRIVER, format!("metrics/find: {}", e)))?;
    Ok(LabelResult::new(nodes.into_iter().map(|n| n.text).collect()))
}

/// Plain string array from the tag autocomplete endpoints
pub fn parse_tag_list(body: &str) -> TimeseriesResult<LabelResult> {
    let values: Vec<String> = serde_json::from_str(body.trim())
        .map_err(|e| TimeseriesError::response(DRIVER, format!("tags: {}", e)))?;
    Ok(LabelResult::new(values))
}

fn snippet(body: &str) -> String {
    body.chars().take(120).collect()
}
