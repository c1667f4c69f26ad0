//! rrdtool output parsers
//!
//! - `xport --json`: `{meta: {start, step, legend}, data: [[v, ...], ...]}`
//! - `fetch`: a header of DS names, then `<ts>: <v> <v>` rows
//! - `info`: `key = value` lines, data sources as `ds[<name>].<attr>`

use super::layout::Tags;
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::query::{Series, TimeSeriesResult};
use chrono::DateTime;
use nom::{
    bytes::complete::{tag, take_till1, take_until},
    character::complete::{char, digit1, space0, space1},
    combinator::{map_res, rest},
    multi::many0,
    sequence::{pair, preceded, terminated, tuple},
    IResult,
};
use serde::Deserialize;

const DRIVER: &str = "rrdtool";

#[derive(Debug, Deserialize)]
struct XportMeta {
    start: i64,
    step: i64,
    #[serde(default)]
    legend: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct XportBody {
    meta: XportMeta,
    #[serde(default)]
    data: Vec<Vec<serde_json::Value>>,
}

/// Series name: the measurement for the `value` placeholder, else
/// `measurement.field`
pub fn series_name(measurement: &str, field: &str) -> String {
    if field == "value" {
        measurement.to_string()
    } else {
        format!("{}.{}", measurement, field)
    }
}

fn cell(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        serde_json::Value::String(s) => s.parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

/// Legend columns matching `requested`, or every column when none match
fn selected_columns(legend: &[String], requested: &[String]) -> Vec<usize> {
    let matching: Vec<usize> = legend
        .iter()
        .enumerate()
        .filter(|(_, name)| requested.contains(*name))
        .map(|(i, _)| i)
        .collect();

    if matching.is_empty() {
        tracing::debug!(
            driver = DRIVER,
            legend = ?legend,
            requested = ?requested,
            "No requested field in legend, using all columns"
        );
        (0..legend.len()).collect()
    } else {
        matching
    }
}

/// Parse `xport --json` output
pub fn parse_xport(
    body: &str,
    measurement: &str,
    requested: &[String],
    labels: &Tags,
) -> TimeseriesResult<TimeSeriesResult> {
    let body: XportBody = serde_json::from_str(body.trim())
        .map_err(|e| TimeseriesError::response(DRIVER, format!("xport: {}", e)))?;

    let columns = selected_columns(&body.meta.legend, requested);
    let mut series: Vec<Series> = columns
        .iter()
        .map(|&i| Series::new(series_name(measurement, &body.meta.legend[i])).with_labels(labels.clone()))
        .collect();

    for (row_index, row) in body.data.iter().enumerate() {
        let ts = body.meta.start + row_index as i64 * body.meta.step;
        let Some(timestamp) = DateTime::from_timestamp(ts, 0) else {
            continue;
        };
        for (series, &column) in series.iter_mut().zip(&columns) {
            series.push(timestamp, row.get(column).and_then(cell));
        }
    }

    Ok(TimeSeriesResult::new(series).with_metadata("step", body.meta.step))
}

/// Parsed `fetch` output
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutput {
    pub names: Vec<String>,
    pub rows: Vec<(i64, Vec<Option<f64>>)>,
}

impl FetchOutput {
    pub fn into_result(self, measurement: &str, requested: &[String], labels: &Tags) -> TimeSeriesResult {
        let columns = selected_columns(&self.names, requested);
        let mut series: Vec<Series> = columns
            .iter()
            .map(|&i| Series::new(series_name(measurement, &self.names[i])).with_labels(labels.clone()))
            .collect();

        for (ts, values) in &self.rows {
            let Some(timestamp) = DateTime::from_timestamp(*ts, 0) else {
                continue;
            };
            for (series, &column) in series.iter_mut().zip(&columns) {
                series.push(timestamp, values.get(column).copied().flatten());
            }
        }
        TimeSeriesResult::new(series)
    }
}

fn fetch_value(input: &str) -> IResult<&str, Option<f64>> {
    map_res(take_till1(char::is_whitespace), |token: &str| {
        token.parse::<f64>().map(|v| Some(v).filter(|v| v.is_finite()))
    })(input)
}

fn fetch_row(input: &str) -> IResult<&str, (i64, Vec<Option<f64>>)> {
    tuple((
        preceded(space0, map_res(terminated(digit1, char(':')), str::parse::<i64>)),
        many0(preceded(space1, fetch_value)),
    ))(input)
}

/// Parse `fetch` output
pub fn parse_fetch(output: &str) -> TimeseriesResult<FetchOutput> {
    let mut lines = output.lines().filter(|l| !l.trim().is_empty());
    let names: Vec<String> = lines
        .next()
        .map(|header| header.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();

    let mut rows = Vec::new();
    for line in lines {
        match fetch_row(line.trim_end()) {
            Ok((remaining, row)) if remaining.trim().is_empty() => rows.push(row),
            _ => {
                return Err(TimeseriesError::response(
                    DRIVER,
                    format!("unreadable fetch row '{}'", line.trim()),
                ))
            }
        }
    }
    Ok(FetchOutput { names, rows })
}

/// Fields of `info` output the drivers use
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RrdInfo {
    pub step: Option<u64>,
    pub last_update: Option<i64>,
    /// In declaration order
    pub data_sources: Vec<String>,
}

fn ds_key(input: &str) -> IResult<&str, &str> {
    preceded(tag("ds["), terminated(take_until("]"), char(']')))(input)
}

fn info_line(input: &str) -> IResult<&str, (&str, &str)> {
    pair(
        terminated(take_till1(|c: char| c == ' ' || c == '='), space0),
        preceded(pair(char('='), space0), rest),
    )(input)
}

/// Parse `info` output; unknown keys are skipped
pub fn parse_info(output: &str) -> RrdInfo {
    let mut info = RrdInfo::default();
    for line in output.lines() {
        let Ok((_, (key, value))) = info_line(line.trim()) else {
            continue;
        };
        if let Ok((_, name)) = ds_key(key) {
            if !info.data_sources.iter().any(|n| n == name) {
                info.data_sources.push(name.to_string());
            }
            continue;
        }
        match key {
            "step" => info.step = value.trim().parse().ok(),
            "last_update" => info.last_update = value.trim().parse().ok(),
            _ => {}
        }
    }
    info
}

/// Parse `last` output (a single epoch)
pub fn parse_last(output: &str) -> TimeseriesResult<i64> {
    output
        .trim()
        .parse()
        .map_err(|_| TimeseriesError::response(DRIVER, format!("unreadable last '{}'", output.trim())))
}
