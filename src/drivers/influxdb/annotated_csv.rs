//! Annotated CSV parsing
//!
//! InfluxDB answers Flux queries with annotated CSV: `#datatype`, `#group`
//! and `#default` annotation rows, then a header row starting with
//! `,result,table,...`, then data rows. Several tables may follow each other,
//! each with its own header.
//!
//! Rows are grouped by `(result, table)`; every group becomes one series per
//! value column.

use super::flux::ValueColumn;
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::query::{LabelResult, Series, TimeSeriesResult};
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, StringRecord};
use std::collections::{BTreeMap, HashMap};

const DRIVER: &str = "influxdb";

/// Columns that never become labels
const RESERVED_COLUMNS: &[&str] = &[
    "",
    "result",
    "table",
    "_start",
    "_stop",
    "_time",
    "_value",
    "_field",
    "_measurement",
];

/// Header of the table currently being read
struct Header {
    columns: Vec<String>,
    index: HashMap<String, usize>,
}

impl Header {
    fn from_record(record: &StringRecord) -> Self {
        let columns: Vec<String> = record.iter().map(|c| c.trim().to_string()).collect();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self { columns, index }
    }

    fn get<'r>(&self, record: &'r StringRecord, column: &str) -> Option<&'r str> {
        self.index
            .get(column)
            .and_then(|i| record.get(*i))
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

/// `,result,table,...` or the `,error,reference` header of a failure table
fn is_header(record: &StringRecord) -> bool {
    let has = |name: &str| record.iter().any(|f| f.trim() == name);
    (has("result") && has("table")) || (has("error") && has("reference"))
}

fn reader(body: &str) -> csv::Reader<&[u8]> {
    ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes())
}

fn csv_error(e: csv::Error) -> TimeseriesError {
    TimeseriesError::response(DRIVER, format!("malformed CSV: {}", e))
}

/// Parse a data query response
pub fn parse_time_series(body: &str, value_columns: &[ValueColumn]) -> TimeseriesResult<TimeSeriesResult> {
    let mut header: Option<Header> = None;
    let mut series: Vec<Series> = Vec::new();
    let mut positions: HashMap<(String, String, String), usize> = HashMap::new();

    for (line, record) in reader(body).records().enumerate() {
        let record = record.map_err(csv_error)?;

        if is_header(&record) {
            header = Some(Header::from_record(&record));
            continue;
        }
        let Some(current) = header.as_ref() else {
            return Err(TimeseriesError::response(
                DRIVER,
                format!("data row {} before any header", line + 1),
            ));
        };
        // InfluxDB reports query failures in-band as an `error` table
        if let Some(message) = current.get(&record, "error") {
            return Err(TimeseriesError::response(DRIVER, message));
        }

        let Some(timestamp) = row_timestamp(current, &record) else {
            tracing::warn!(driver = DRIVER, row = line + 1, "Skipping row without a timestamp");
            continue;
        };

        let result = current.get(&record, "result").unwrap_or("_result").to_string();
        let table = current.get(&record, "table").unwrap_or("0").to_string();

        for value_column in value_columns {
            if !current.index.contains_key(&value_column.column) {
                continue;
            }
            let key = (result.clone(), table.clone(), value_column.column.clone());
            let position = *positions.entry(key).or_insert_with(|| {
                let name = value_column
                    .name
                    .clone()
                    .unwrap_or_else(|| series_name(current, &record));
                series.push(Series::new(name).with_labels(labels(current, &record, value_columns)));
                series.len() - 1
            });

            let value = current
                .get(&record, &value_column.column)
                .and_then(|v| v.parse::<f64>().ok())
                .filter(|v| !v.is_nan());
            series[position].push(timestamp, value);
        }
    }

    Ok(TimeSeriesResult::new(series))
}

/// Parse a schema function response: the `_value` column, in row order
pub fn parse_labels(body: &str) -> TimeseriesResult<LabelResult> {
    let mut header: Option<Header> = None;
    let mut values = Vec::new();

    for record in reader(body).records() {
        let record = record.map_err(csv_error)?;
        if is_header(&record) {
            header = Some(Header::from_record(&record));
            continue;
        }
        if let Some(value) = header.as_ref().and_then(|h| h.get(&record, "_value")) {
            values.push(value.to_string());
        }
    }

    Ok(LabelResult::new(values))
}

/// `_time`, or the window bounds when a reducer dropped it
fn row_timestamp(header: &Header, record: &StringRecord) -> Option<DateTime<Utc>> {
    ["_time", "_stop", "_start"]
        .iter()
        .find_map(|column| header.get(record, column))
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|ts| ts.with_timezone(&Utc))
}

/// `cpu`, or `cpu.usage` when the field is something other than `value`
fn series_name(header: &Header, record: &StringRecord) -> String {
    let measurement = header.get(record, "_measurement");
    let field = header.get(record, "_field");
    match (measurement, field) {
        (Some(m), Some(f)) if f != "value" => format!("{}.{}", m, f),
        (Some(m), _) => m.to_string(),
        (None, Some(f)) => f.to_string(),
        (None, None) => "value".to_string(),
    }
}

fn labels(header: &Header, record: &StringRecord, value_columns: &[ValueColumn]) -> BTreeMap<String, String> {
    header
        .columns
        .iter()
        .filter(|c| !RESERVED_COLUMNS.contains(&c.as_str()))
        .filter(|c| !value_columns.iter().any(|v| &v.column == *c))
        .filter_map(|c| header.get(record, c).map(|v| (c.clone(), v.to_string())))
        .collect()
}
