//! Carbon plaintext protocol
//!
//! One line per field:
//!
//! ```text
//! app.cpu.usage;host=server01 42.5 1698408000
//! ```
//!
//! Tags go to the tag database, not into the dotted path. Render targets
//! narrow hierarchical paths (`cpu.*` with `host = web01` reads
//! `cpu.web01`), so tagged writes are not reachable through tag-equality
//! reads. They show up through the `/tags` metadata lookups instead.

use crate::error::{TimeseriesError, TimeseriesResult};
use crate::point::{DataPoint, FieldValue};

/// Path components cannot contain the separator or whitespace
pub fn sanitize_component(component: &str) -> String {
    component
        .chars()
        .map(|c| if c == '.' || c.is_whitespace() { '_' } else { c })
        .collect()
}

fn sanitize_tag(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            ';' | '=' | '!' | '^' | '~' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

fn format_value(field: &str, value: &FieldValue) -> TimeseriesResult<String> {
    match value {
        FieldValue::Integer(i) => Ok(i.to_string()),
        FieldValue::Float(f) if f.is_finite() => Ok(f.to_string()),
        FieldValue::Float(f) => Err(TimeseriesError::Write(format!(
            "field '{}' has non-finite value {}",
            field, f
        ))),
    }
}

/// Serialise a point to plaintext lines, without trailing newlines
pub fn to_lines(point: &DataPoint, prefix: Option<&str>) -> TimeseriesResult<Vec<String>> {
    if point.measurement.is_empty() {
        return Err(TimeseriesError::Write("measurement is required".to_string()));
    }
    if point.fields.is_empty() {
        return Err(TimeseriesError::Write(format!(
            "point for '{}' has no fields",
            point.measurement
        )));
    }

    let mut base = String::new();
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        base.push_str(prefix);
        base.push('.');
    }
    base.push_str(&sanitize_component(&point.measurement));

    let tags: String = point
        .tags
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!(";{}={}", sanitize_tag(key), sanitize_tag(value)))
        .collect();

    let timestamp = point.timestamp.timestamp();
    point
        .fields
        .iter()
        .map(|(field, value)| {
            Ok(format!(
                "{}.{}{} {} {}",
                base,
                sanitize_component(field),
                tags,
                format_value(field, value)?,
                timestamp
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::point::Sample;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_sample_lines() {
        let ts = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let point: DataPoint = Sample::new("app", "cpu_usage", 42.5, ts)
            .label("host", "server01")
            .label("region", "us-west")
            .into();

        assert_eq!(
            to_lines(&point, None).unwrap(),
            vec!["app_cpu_usage.value;host=server01;region=us-west 42.5 1698408000"]
        );
        assert_eq!(
            to_lines(&point, Some("stats")).unwrap()[0],
            "stats.app_cpu_usage.value;host=server01;region=us-west 42.5 1698408000"
        );
    }

    #[test]
    fn test_sanitising() {
        let ts = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let point = DataPoint::with_timestamp("disk io", ts)
            .add_tag("mount", "/var lib")
            .add_tag("empty", "")
            .add_field("read.bytes", 7i64)
            .add_field("util", 0.25);

        assert_eq!(
            to_lines(&point, None).unwrap(),
            vec![
                "disk_io.read_bytes;mount=/var_lib 7 1698408000",
                "disk_io.util;mount=/var_lib 0.25 1698408000",
            ]
        );
    }

    #[test]
    fn test_invalid_points() {
        assert!(to_lines(&DataPoint::new("m"), None).is_err());
        let nan = DataPoint::new("m").add_field("v", f64::INFINITY);
        assert!(matches!(to_lines(&nan, None), Err(TimeseriesError::Write(_))));
    }
}
