//! Flux compiler
//!
//! Lowers a [`Query`] into a Flux pipe chain:
//!
//! ```text
//! from(bucket: "telemetry")
//!   |> range(start: -1h)
//!   |> filter(fn: (r) => r._measurement == "cpu")
//!   |> filter(fn: (r) => r.host == "server01")
//!   |> filter(fn: (r) => r._field == "usage")
//!   |> window(every: 5m)
//!   |> mean()
//! ```
//!
//! Regex patterns and math expressions are inserted verbatim. Both are
//! caller-supplied Flux and are not sanitised.

use crate::query::{
    condition_groups, AggregateFunction, Compiler, CompileResult, CompiledQuery, Condition,
    ConditionValue, FillPolicy, MetadataQuery, Operator, Query, QueryError, Scalar,
    SortDirection, TimeSpec,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeSet;

const BACKEND: &str = "influxdb";

/// What the response parser should read from each row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueColumn {
    /// CSV column holding the value
    pub column: String,
    /// Series name override (aggregation alias or generated name)
    pub name: Option<String>,
}

impl ValueColumn {
    fn plain() -> Self {
        Self {
            column: "_value".to_string(),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxQueryKind {
    /// Rows of timestamped values
    Data,
    /// Schema function output, read from `_value`
    Labels,
}

/// A compiled Flux script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FluxQuery {
    pub text: String,
    pub kind: FluxQueryKind,
    pub value_columns: Vec<ValueColumn>,
}

impl std::fmt::Display for FluxQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.text)
    }
}

impl CompiledQuery for FluxQuery {
    fn backend(&self) -> &'static str {
        BACKEND
    }
}

/// Compiles queries against one bucket
#[derive(Debug, Clone)]
pub struct FluxCompiler {
    bucket: String,
}

impl FluxCompiler {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Schema discovery through the `influxdata/influxdb/schema` package
    pub fn compile_metadata(&self, request: &MetadataQuery) -> FluxQuery {
        let bucket = string_literal(&self.bucket);
        let call = match request {
            MetadataQuery::Measurements => format!("schema.measurements(bucket: {})", bucket),
            MetadataQuery::TagKeys { measurement } => format!(
                "schema.measurementTagKeys(bucket: {}, measurement: {})",
                bucket,
                string_literal(measurement)
            ),
            MetadataQuery::TagValues { measurement, tag } => format!(
                "schema.measurementTagValues(bucket: {}, measurement: {}, tag: {})",
                bucket,
                string_literal(measurement),
                string_literal(tag)
            ),
            MetadataQuery::FieldKeys { measurement } => format!(
                "schema.measurementFieldKeys(bucket: {}, measurement: {})",
                bucket,
                string_literal(measurement)
            ),
        };

        FluxQuery {
            text: format!("import \"influxdata/influxdb/schema\"\n\n{}", call),
            kind: FluxQueryKind::Labels,
            value_columns: vec![ValueColumn::plain()],
        }
    }
}

impl Compiler for FluxCompiler {
    type Output = FluxQuery;

    fn compile(&self, query: &Query) -> CompileResult<FluxQuery> {
        query.check_compilable()?;

        let mut script = Script::default();
        script.stages.push(range_stage(query));

        if let Some(tz) = query.timezone_name() {
            match fixed_offset_duration(tz) {
                Some(shift) => script.stages.push(format!("timeShift(duration: {})", shift)),
                None => {
                    script.imports.insert("timezone");
                    script
                        .options
                        .push(format!("option location = timezone.location(name: {})", string_literal(tz)));
                }
            }
        }

        script.stages.push(format!(
            "filter(fn: (r) => r._measurement == {})",
            string_literal(query.measurement())
        ));

        for group in condition_groups(query.conditions()) {
            let exprs = group
                .iter()
                .map(|c| condition_expr(c))
                .collect::<CompileResult<Vec<_>>>()?;
            let predicate = if exprs.len() == 1 {
                exprs.into_iter().next().unwrap_or_default()
            } else {
                exprs
                    .iter()
                    .map(|e| format!("({})", e))
                    .collect::<Vec<_>>()
                    .join(" or ")
            };
            script.stages.push(format!("filter(fn: (r) => {})", predicate));
        }

        let fields = filtered_fields(query);
        if !fields.is_empty() {
            let clauses: Vec<String> = fields
                .iter()
                .map(|f| format!("r._field == {}", string_literal(f)))
                .collect();
            script
                .stages
                .push(format!("filter(fn: (r) => {})", clauses.join(" or ")));
        }

        if query.is_distinct() {
            script.stages.push("distinct()".to_string());
        }

        if !query.group_by_tags().is_empty() {
            let columns: Vec<String> = query.group_by_tags().iter().map(|t| string_literal(t)).collect();
            script
                .stages
                .push(format!("group(columns: [{}])", columns.join(", ")));
        }

        let interval = query.parsed_interval()?;
        if let Some(every) = interval {
            script.stages.push(format!("window(every: {})", every.to_flux()));
        }

        let value_columns = aggregation_stages(query, &mut script.stages);

        for having in query.having_clauses() {
            let column = having_column(query, &value_columns, &having.field);
            if !having.operator.is_comparison() {
                return Err(raw_error(
                    query,
                    format!("having supports comparisons only, got {}", having.operator),
                ));
            }
            script.stages.push(format!(
                "filter(fn: (r) => {} {} {})",
                record_ref(&column),
                flux_operator(having.operator),
                literal(&having.field, &having.value, false)?
            ));
        }

        match query.fill_policy() {
            Some(FillPolicy::Null) => script.stages.push("fill(value: null)".to_string()),
            Some(FillPolicy::Previous) => script.stages.push("fill(usePrevious: true)".to_string()),
            Some(FillPolicy::Linear) => {
                script.imports.insert("interpolate");
                let stage = match interval {
                    Some(every) => format!("interpolate.linear(every: {})", every.to_flux()),
                    None => "interpolate.linear()".to_string(),
                };
                script.stages.push(stage);
            }
            Some(FillPolicy::Value(v)) => {
                script.stages.push(format!("fill(value: {})", float_literal("fill", v)?));
            }
            Some(FillPolicy::None) | None => {}
        }

        for math in query.math_expressions() {
            script.stages.push(format!(
                "map(fn: (r) => ({{ r with {}: {} }}))",
                math.alias, math.expression
            ));
        }

        sort_stages(query.ordering(), &mut script.stages);

        if let Some(offset) = query.offset_value() {
            script.stages.push(format!("tail(offset: {})", offset));
        }
        if let Some(n) = query.limit_value() {
            script.stages.push(format!("limit(n: {})", n));
        }

        let text = script.render(&self.bucket);
        tracing::debug!(
            driver = BACKEND,
            measurement = %query.measurement(),
            flux = %text,
            "Compiled Flux query"
        );

        Ok(FluxQuery {
            text,
            kind: FluxQueryKind::Data,
            value_columns,
        })
    }
}

/// Imports, options and pipeline stages of one script
#[derive(Default)]
struct Script {
    imports: BTreeSet<&'static str>,
    options: Vec<String>,
    stages: Vec<String>,
}

impl Script {
    fn render(&self, bucket: &str) -> String {
        let mut out = String::new();
        for import in &self.imports {
            out.push_str(&format!("import \"{}\"\n", import));
        }
        for option in &self.options {
            out.push_str(option);
            out.push('\n');
        }
        if !out.is_empty() {
            out.push('\n');
        }

        out.push_str(&format!("from(bucket: {})", string_literal(bucket)));
        for stage in &self.stages {
            out.push_str("\n  |> ");
            out.push_str(stage);
        }
        out
    }
}

fn range_stage(query: &Query) -> String {
    match query.time() {
        TimeSpec::Absolute { start, end } => {
            format!("range(start: {}, stop: {})", time_literal(&start), time_literal(&end))
        }
        TimeSpec::Relative(d) => format!("range(start: -{})", d.to_flux()),
        TimeSpec::Unset => "range(start: -1h)".to_string(),
    }
}

/// `+02:00` -> `2h`, `-05:30` -> `-5h30m`; named zones return `None`
fn fixed_offset_duration(tz: &str) -> Option<String> {
    let (sign, rest) = match tz.trim().strip_prefix("UTC").unwrap_or(tz.trim()) {
        s if s.starts_with('+') => ("", &s[1..]),
        s if s.starts_with('-') => ("-", &s[1..]),
        _ => return None,
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: u32 = hours.parse().ok()?;
    let minutes: u32 = minutes.parse().ok()?;

    let mut out = sign.to_string();
    if hours > 0 || minutes == 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    Some(out)
}

/// Explicit fields plus aggregated fields, in first-seen order
fn filtered_fields(query: &Query) -> Vec<String> {
    let mut fields: Vec<String> = Vec::new();
    let explicit = query.explicit_fields();
    let aggregated = query.aggregations().iter().map(|a| a.field.as_str());

    for field in explicit.into_iter().chain(aggregated) {
        if field != crate::query::WILDCARD && !fields.iter().any(|f| f == field) {
            fields.push(field.to_string());
        }
    }
    fields
}

/// Emit reducer stages; returns the columns the parser reads.
///
/// Flux reduces one column per stage, so for N aggregations the value
/// column is duplicated N-1 times and every reducer gets its own column.
fn aggregation_stages(query: &Query, stages: &mut Vec<String>) -> Vec<ValueColumn> {
    let aggregations = query.aggregations();
    match aggregations {
        [] => vec![ValueColumn::plain()],
        [single] => {
            stages.push(reducer_call(single.function, None));
            vec![ValueColumn {
                column: "_value".to_string(),
                name: single.alias.clone(),
            }]
        }
        many => {
            let mut columns: Vec<ValueColumn> = Vec::with_capacity(many.len());
            for (i, aggregation) in many.iter().enumerate() {
                let column = if i == 0 {
                    "_value".to_string()
                } else {
                    let base = format!("_value_{}", aggregation.output_name());
                    unique_column(base, &columns)
                };
                columns.push(ValueColumn {
                    column,
                    name: Some(aggregation.output_name()),
                });
            }

            for column in columns.iter().skip(1) {
                stages.push(format!(
                    "duplicate(column: \"_value\", as: {})",
                    string_literal(&column.column)
                ));
            }
            for (aggregation, column) in many.iter().zip(&columns) {
                stages.push(reducer_call(aggregation.function, Some(&column.column)));
            }
            columns
        }
    }
}

fn unique_column(base: String, taken: &[ValueColumn]) -> String {
    if !taken.iter().any(|c| c.column == base) {
        return base;
    }
    (2..)
        .map(|i| format!("{}_{}", base, i))
        .find(|candidate| !taken.iter().any(|c| &c.column == candidate))
        .unwrap_or(base)
}

/// Reducer call, reading `_value` unless a column is given
fn reducer_call(function: AggregateFunction, column: Option<&str>) -> String {
    let name = match function {
        AggregateFunction::Mean => "mean",
        AggregateFunction::Sum => "sum",
        AggregateFunction::Min => "min",
        AggregateFunction::Max => "max",
        AggregateFunction::Count => "count",
        AggregateFunction::First => "first",
        AggregateFunction::Last => "last",
        AggregateFunction::Median => "median",
        AggregateFunction::Stddev => "stddev",
        AggregateFunction::Spread => "spread",
        AggregateFunction::Percentile(p) => {
            let q = p as f64 / 100.0;
            return match column {
                Some(c) => format!("quantile(q: {}, column: {})", q, string_literal(c)),
                None => format!("quantile(q: {})", q),
            };
        }
    };
    match column {
        Some(c) => format!("{}(column: {})", name, string_literal(c)),
        None => format!("{}()", name),
    }
}

fn having_column(query: &Query, columns: &[ValueColumn], field: &str) -> String {
    query
        .aggregations()
        .iter()
        .zip(columns)
        .find(|(a, _)| a.output_name() == field || a.alias.as_deref() == Some(field))
        .or_else(|| query.aggregations().iter().zip(columns).find(|(a, _)| a.field == field))
        .map(|(_, c)| c.column.clone())
        .unwrap_or_else(|| "_value".to_string())
}

fn sort_stages(ordering: &[(String, SortDirection)], stages: &mut Vec<String>) {
    if ordering.is_empty() {
        return;
    }

    let column = |field: &str| match field {
        "time" => "\"_time\"".to_string(),
        "value" => "\"_value\"".to_string(),
        other => string_literal(other),
    };

    let first = ordering[0].1;
    if ordering.iter().all(|(_, dir)| *dir == first) {
        let columns: Vec<String> = ordering.iter().map(|(f, _)| column(f)).collect();
        stages.push(format!(
            "sort(columns: [{}], desc: {})",
            columns.join(", "),
            first == SortDirection::Desc
        ));
    } else {
        for (field, dir) in ordering {
            stages.push(format!(
                "sort(columns: [{}], desc: {})",
                column(field),
                *dir == SortDirection::Desc
            ));
        }
    }
}

/// Flux predicate for one condition
fn condition_expr(condition: &Condition) -> CompileResult<String> {
    let is_time = condition.is_time();
    let column = if is_time { "_time" } else { condition.field() };
    let target = record_ref(column);
    let field = condition.field();

    match (condition.operator(), condition.value()) {
        (Operator::Eq, ConditionValue::Scalar(Scalar::Null)) => Ok(format!("not exists {}", target)),
        (Operator::Neq, ConditionValue::Scalar(Scalar::Null)) => Ok(format!("exists {}", target)),
        (Operator::Regex, ConditionValue::Scalar(s)) => Ok(format!("{} =~ /{}/", target, s.to_plain_string())),
        (Operator::NotRegex, ConditionValue::Scalar(s)) => Ok(format!("{} !~ /{}/", target, s.to_plain_string())),
        (op, ConditionValue::Scalar(value)) => Ok(format!(
            "{} {} {}",
            target,
            flux_operator(op),
            literal(field, value, is_time)?
        )),
        (Operator::In, ConditionValue::List(items)) => {
            let set = items
                .iter()
                .map(|v| literal(field, v, is_time))
                .collect::<CompileResult<Vec<_>>>()?;
            Ok(format!("contains(value: {}, set: [{}])", target, set.join(", ")))
        }
        // Flux has no negated contains(); NOT IN is a conjunction of !=
        (Operator::NotIn, ConditionValue::List(items)) => {
            if items.is_empty() {
                return Ok("true".to_string());
            }
            let clauses = items
                .iter()
                .map(|v| Ok(format!("{} != {}", target, literal(field, v, is_time)?)))
                .collect::<CompileResult<Vec<_>>>()?;
            Ok(clauses.join(" and "))
        }
        (Operator::Between, ConditionValue::List(bounds)) => Ok(format!(
            "{} >= {} and {} <= {}",
            target,
            literal(field, &bounds[0], is_time)?,
            target,
            literal(field, &bounds[1], is_time)?
        )),
        (op, ConditionValue::List(_)) => Err(QueryError::UnsupportedValue {
            field: field.to_string(),
            reason: format!("{} needs a scalar value", op),
        }),
    }
}

fn flux_operator(op: Operator) -> &'static str {
    match op {
        Operator::Eq => "==",
        Operator::Neq => "!=",
        Operator::Gt => ">",
        Operator::Gte => ">=",
        Operator::Lt => "<",
        Operator::Lte => "<=",
        Operator::Regex => "=~",
        Operator::NotRegex => "!~",
        // list operators are expanded by the caller
        Operator::In | Operator::NotIn | Operator::Between => "==",
    }
}

/// `r.host`, or `r["my field"]` when the name is not an identifier
fn record_ref(column: &str) -> String {
    let is_identifier = column
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && column.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if is_identifier {
        format!("r.{}", column)
    } else {
        format!("r[{}]", string_literal(column))
    }
}

/// Render a scalar as a Flux literal. Values compared against `_time`
/// become `time(v: ...)`.
fn literal(field: &str, value: &Scalar, is_time: bool) -> CompileResult<String> {
    if is_time {
        return match value {
            Scalar::Timestamp(ts) => Ok(format!("time(v: \"{}\")", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
            Scalar::String(s) => Ok(format!("time(v: {})", string_literal(s))),
            Scalar::Integer(secs) => DateTime::<Utc>::from_timestamp(*secs, 0)
                .map(|ts| format!("time(v: \"{}\")", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)))
                .ok_or_else(|| unsupported(field, format!("{} is not a valid epoch", secs))),
            other => Err(unsupported(field, format!("{:?} is not a time", other))),
        };
    }

    match value {
        Scalar::Null => Err(unsupported(field, "null only compares with = or !=".to_string())),
        Scalar::Bool(b) => Ok(b.to_string()),
        Scalar::Integer(i) => Ok(i.to_string()),
        Scalar::Float(f) => float_literal(field, *f),
        Scalar::Timestamp(ts) => Ok(format!("time(v: \"{}\")", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))),
        Scalar::String(s) => Ok(string_literal(s)),
    }
}

fn float_literal(field: &str, f: f64) -> CompileResult<String> {
    if !f.is_finite() {
        return Err(unsupported(field, format!("{} has no Flux literal", f)));
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        Ok(format!("{:.1}", f))
    } else {
        Ok(f.to_string())
    }
}

fn time_literal(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Double-quoted Flux string
pub(crate) fn string_literal(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn unsupported(field: &str, message: String) -> QueryError {
    QueryError::RawQuery {
        backend: BACKEND,
        query: field.to_string(),
        message,
    }
}

fn raw_error(query: &Query, message: String) -> QueryError {
    QueryError::RawQuery {
        backend: BACKEND,
        query: query.measurement().to_string(),
        message,
    }
}
