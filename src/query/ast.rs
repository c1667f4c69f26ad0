//! Query Abstract Syntax Tree
//!
//! Backend-agnostic representation of a logical time-series query. A
//! [`Query`] is built with chained calls, handed to one backend compiler,
//! and then dropped.
//!
//! # Example
//!
//! ```rust
//! use tsbridge::query::{AggregateFunction, Query};
//!
//! let query = Query::new("cpu")
//!     .select(["usage_user"])
//!     .and_where("host", "=", "server01")
//!     .latest("1h")?
//!     .interval("5m")
//!     .aggregate(AggregateFunction::Mean, "usage_user");
//!
//! assert!(query.validate().is_empty());
//! # Ok::<(), tsbridge::query::QueryError>(())
//! ```

use crate::query::condition::{
    Condition, ConditionValue, IntoOperator, LogicalType, Operator, Scalar,
};
use crate::query::duration::RelativeDuration;
use crate::query::error::{CompileResult, QueryError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The wildcard field selection
pub const WILDCARD: &str = "*";

/// Time window of a query.
///
/// Absolute and relative windows are mutually exclusive; setting one
/// replaces the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TimeSpec {
    /// Backends apply their default (the last hour)
    #[default]
    Unset,
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Relative(RelativeDuration),
}

/// Aggregation functions available in queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Mean,
    Sum,
    Min,
    Max,
    Count,
    First,
    Last,
    Median,
    Stddev,
    Spread,
    /// Percentile in 0..=100
    Percentile(u8),
}

impl AggregateFunction {
    /// Short lowercase name, used for generated column names
    pub fn name(&self) -> String {
        match self {
            Self::Mean => "mean".to_string(),
            Self::Sum => "sum".to_string(),
            Self::Min => "min".to_string(),
            Self::Max => "max".to_string(),
            Self::Count => "count".to_string(),
            Self::First => "first".to_string(),
            Self::Last => "last".to_string(),
            Self::Median => "median".to_string(),
            Self::Stddev => "stddev".to_string(),
            Self::Spread => "spread".to_string(),
            Self::Percentile(p) => format!("p{}", p),
        }
    }
}

impl std::str::FromStr for AggregateFunction {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let func = match lower.as_str() {
            "avg" | "mean" | "average" => Self::Mean,
            "sum" => Self::Sum,
            "min" => Self::Min,
            "max" => Self::Max,
            "count" => Self::Count,
            "first" => Self::First,
            "last" => Self::Last,
            "median" => Self::Median,
            "stddev" | "stdev" => Self::Stddev,
            "spread" => Self::Spread,
            other => {
                let pct = other
                    .strip_prefix("percentile_")
                    .or_else(|| other.strip_prefix('p'))
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| *n <= 100);
                match pct {
                    Some(p) => Self::Percentile(p),
                    None => {
                        return Err(QueryError::Parse(format!(
                            "unknown aggregate function '{}'",
                            s
                        )))
                    }
                }
            }
        };
        Ok(func)
    }
}

impl std::fmt::Display for AggregateFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name())
    }
}

/// One aggregation in the SELECT clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    pub field: String,
    pub alias: Option<String>,
}

impl Aggregation {
    /// Alias, or `<function>_<field>`
    pub fn output_name(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_{}", self.function.name(), self.field))
    }
}

/// How empty buckets are filled
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", content = "value", rename_all = "lowercase")]
pub enum FillPolicy {
    Null,
    None,
    Previous,
    Linear,
    Value(f64),
}

impl std::str::FromStr for FillPolicy {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "null" => Ok(Self::Null),
            "none" => Ok(Self::None),
            "previous" => Ok(Self::Previous),
            "linear" => Ok(Self::Linear),
            other => other
                .parse::<f64>()
                .map(Self::Value)
                .map_err(|_| QueryError::Parse(format!("unknown fill policy '{}'", s))),
        }
    }
}

/// A backend-native expression evaluated per row, exposed under `alias`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MathExpression {
    pub expression: String,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Post-aggregation filter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Having {
    pub field: String,
    pub operator: Operator,
    pub value: Scalar,
}

/// Schema-discovery requests, answered with a flat list of strings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataQuery {
    Measurements,
    TagKeys { measurement: String },
    TagValues { measurement: String, tag: String },
    FieldKeys { measurement: String },
}

/// A logical time-series query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    measurement: String,
    fields: Vec<String>,
    conditions: Vec<Condition>,
    time: TimeSpec,
    group_by: Vec<String>,
    interval: Option<String>,
    aggregations: Vec<Aggregation>,
    fill: Option<FillPolicy>,
    math: Vec<MathExpression>,
    order_by: Vec<(String, SortDirection)>,
    limit: Option<usize>,
    offset: Option<usize>,
    distinct: bool,
    timezone: Option<String>,
    having: Vec<Having>,
    /// Problems recorded while building (bad operator tokens)
    #[serde(skip)]
    build_errors: Vec<String>,
}

impl Query {
    /// Start a query against a measurement, selecting all fields
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            fields: vec![WILDCARD.to_string()],
            conditions: Vec::new(),
            time: TimeSpec::Unset,
            group_by: Vec::new(),
            interval: None,
            aggregations: Vec::new(),
            fill: None,
            math: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            distinct: false,
            timezone: None,
            having: Vec::new(),
            build_errors: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Builder
    // ------------------------------------------------------------------

    /// Replace the field selection
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        if self.fields.is_empty() {
            self.fields.push(WILDCARD.to_string());
        }
        self
    }

    /// Add a condition as-is
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// AND-tagged condition; `op` is an [`Operator`] or its token
    pub fn and_where(
        self,
        field: impl Into<String>,
        op: impl IntoOperator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        self.push_condition(field.into(), op.into_operator(), value.into(), LogicalType::And)
    }

    /// OR-tagged condition
    pub fn or_where(
        self,
        field: impl Into<String>,
        op: impl IntoOperator,
        value: impl Into<ConditionValue>,
    ) -> Self {
        self.push_condition(field.into(), op.into_operator(), value.into(), LogicalType::Or)
    }

    pub fn where_in<T: Into<Scalar>>(self, field: impl Into<String>, values: Vec<T>) -> Self {
        self.condition(Condition::and(field, Operator::In, values))
    }

    pub fn where_not_in<T: Into<Scalar>>(self, field: impl Into<String>, values: Vec<T>) -> Self {
        self.condition(Condition::and(field, Operator::NotIn, values))
    }

    pub fn where_between(
        self,
        field: impl Into<String>,
        low: impl Into<Scalar>,
        high: impl Into<Scalar>,
    ) -> Self {
        let bounds = ConditionValue::List(vec![low.into(), high.into()]);
        self.condition(Condition::and(field, Operator::Between, bounds))
    }

    pub fn where_regex(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.condition(Condition::and(field, Operator::Regex, pattern.into()))
    }

    pub fn where_not_regex(self, field: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.condition(Condition::and(field, Operator::NotRegex, pattern.into()))
    }

    fn push_condition(
        mut self,
        field: String,
        op: CompileResult<Operator>,
        value: ConditionValue,
        logical: LogicalType,
    ) -> Self {
        match op {
            Ok(op) => self.conditions.push(Condition::new(field, op, value, logical)),
            Err(e) => self.build_errors.push(e.to_string()),
        }
        self
    }

    /// Absolute window; clears any relative window
    pub fn time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time = TimeSpec::Absolute { start, end };
        self
    }

    /// Relative window ending now, e.g. `latest("15m")`; clears any
    /// absolute window
    pub fn latest(self, duration: &str) -> CompileResult<Self> {
        let duration = RelativeDuration::parse(duration)?;
        Ok(self.latest_duration(duration))
    }

    pub fn latest_duration(mut self, duration: RelativeDuration) -> Self {
        self.time = TimeSpec::Relative(duration);
        self
    }

    /// Group by a tag; duplicates are ignored
    pub fn group_by(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !self.group_by.contains(&tag) {
            self.group_by.push(tag);
        }
        self
    }

    /// Time bucket width in the compact duration grammar
    pub fn interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    pub fn aggregate(self, function: AggregateFunction, field: impl Into<String>) -> Self {
        self.push_aggregation(function, field.into(), None)
    }

    pub fn aggregate_as(
        self,
        function: AggregateFunction,
        field: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.push_aggregation(function, field.into(), Some(alias.into()))
    }

    fn push_aggregation(mut self, function: AggregateFunction, field: String, alias: Option<String>) -> Self {
        self.aggregations.push(Aggregation {
            function,
            field,
            alias,
        });
        self
    }

    pub fn fill(mut self, policy: FillPolicy) -> Self {
        self.fill = Some(policy);
        self
    }

    /// Backend-native expression, inserted verbatim
    pub fn math(mut self, expression: impl Into<String>, alias: impl Into<String>) -> Self {
        self.math.push(MathExpression {
            expression: expression.into(),
            alias: alias.into(),
        });
        self
    }

    /// Order by a field; a repeated field keeps its position and takes the
    /// new direction
    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        let field = field.into();
        match self.order_by.iter_mut().find(|(f, _)| *f == field) {
            Some(entry) => entry.1 = direction,
            None => self.order_by.push((field, direction)),
        }
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: usize) -> Self {
        self.offset = Some(n);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn timezone(mut self, tz: impl Into<String>) -> Self {
        self.timezone = Some(tz.into());
        self
    }

    pub fn having(
        mut self,
        field: impl Into<String>,
        op: impl IntoOperator,
        value: impl Into<Scalar>,
    ) -> Self {
        match op.into_operator() {
            Ok(operator) => self.having.push(Having {
                field: field.into(),
                operator,
                value: value.into(),
            }),
            Err(e) => self.build_errors.push(e.to_string()),
        }
        self
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Whether the selection includes the wildcard
    pub fn selects_all_fields(&self) -> bool {
        self.fields.iter().any(|f| f == WILDCARD)
    }

    /// Named fields, wildcard excluded
    pub fn explicit_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.as_str() != WILDCARD)
            .map(String::as_str)
            .collect()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn time(&self) -> TimeSpec {
        self.time
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        match self.time {
            TimeSpec::Absolute { start, .. } => Some(start),
            _ => None,
        }
    }

    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        match self.time {
            TimeSpec::Absolute { end, .. } => Some(end),
            _ => None,
        }
    }

    pub fn relative_time(&self) -> Option<RelativeDuration> {
        match self.time {
            TimeSpec::Relative(d) => Some(d),
            _ => None,
        }
    }

    pub fn group_by_tags(&self) -> &[String] {
        &self.group_by
    }

    pub fn interval_str(&self) -> Option<&str> {
        self.interval.as_deref()
    }

    /// Parsed bucket interval
    pub fn parsed_interval(&self) -> CompileResult<Option<RelativeDuration>> {
        self.interval.as_deref().map(RelativeDuration::parse).transpose()
    }

    pub fn aggregations(&self) -> &[Aggregation] {
        &self.aggregations
    }

    pub fn fill_policy(&self) -> Option<FillPolicy> {
        self.fill
    }

    pub fn math_expressions(&self) -> &[MathExpression] {
        &self.math
    }

    pub fn ordering(&self) -> &[(String, SortDirection)] {
        &self.order_by
    }

    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    pub fn offset_value(&self) -> Option<usize> {
        self.offset
    }

    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    pub fn timezone_name(&self) -> Option<&str> {
        self.timezone.as_deref()
    }

    pub fn having_clauses(&self) -> &[Having] {
        &self.having
    }

    // ------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------

    /// Human-readable problems with this query; empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = self.build_errors.clone();

        if self.measurement.trim().is_empty() {
            errors.push("measurement is required".to_string());
        }
        if !self.aggregations.is_empty() && self.group_by.is_empty() && self.interval.is_none() {
            errors.push("aggregations require group_by or interval".to_string());
        }
        if !self.having.is_empty() && self.aggregations.is_empty() {
            errors.push("having requires at least one aggregation".to_string());
        }

        errors
    }

    /// Hard failures every compiler refuses: a missing measurement, bad
    /// operator tokens and malformed condition values
    pub fn check_compilable(&self) -> CompileResult<()> {
        let mut errors = self.build_errors.clone();
        if self.measurement.trim().is_empty() {
            errors.push("measurement is required".to_string());
        }
        if !errors.is_empty() {
            return Err(QueryError::Validation(errors));
        }

        for condition in &self.conditions {
            condition.check_shape()?;
        }
        self.parsed_interval()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_defaults() {
        let query = Query::new("cpu");
        assert_eq!(query.measurement(), "cpu");
        assert_eq!(query.fields(), &["*".to_string()]);
        assert!(query.selects_all_fields());
        assert_eq!(query.time(), TimeSpec::Unset);
        assert!(query.validate().is_empty());
    }

    #[test]
    fn test_latest_clears_absolute_range() {
        let start = Utc.with_ymd_and_hms(2023, 10, 27, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();

        let query = Query::new("cpu").time_range(start, end).latest("5m").unwrap();

        assert_eq!(query.start_time(), None);
        assert_eq!(query.end_time(), None);
        assert_eq!(query.relative_time().map(|d| d.to_string()), Some("5m".to_string()));
    }

    #[test]
    fn test_time_range_clears_latest() {
        let start = Utc.with_ymd_and_hms(2023, 10, 27, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();

        let query = Query::new("cpu").latest("1d").unwrap().time_range(start, end);

        assert_eq!(query.relative_time(), None);
        assert_eq!(query.start_time(), Some(start));
        assert_eq!(query.end_time(), Some(end));
    }

    #[test]
    fn test_latest_rejects_bad_duration() {
        let result = Query::new("cpu").latest("soon");
        assert!(matches!(result, Err(QueryError::InvalidDuration(_))));
    }

    #[test]
    fn test_string_and_enum_operators() {
        let query = Query::new("cpu")
            .and_where("host", "=", "a")
            .or_where("host", Operator::Eq, "b")
            .and_where("region", "REGEX", "^us-");

        let ops: Vec<Operator> = query.conditions().iter().map(|c| c.operator()).collect();
        assert_eq!(ops, vec![Operator::Eq, Operator::Eq, Operator::Regex]);
        assert_eq!(query.conditions()[1].logical(), LogicalType::Or);
    }

    #[test]
    fn test_bad_operator_is_reported_not_panicked() {
        let query = Query::new("cpu").and_where("host", "LIKE", "a%");
        assert!(query.conditions().is_empty());
        let errors = query.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("LIKE"));
        assert!(query.check_compilable().is_err());
    }

    #[test]
    fn test_validate_rules() {
        let query = Query::new("").aggregate(AggregateFunction::Mean, "v").having("v", ">", 1);
        assert_eq!(query.validate(), vec!["measurement is required", "aggregations require group_by or interval"]);

        let query = Query::new("cpu").having("v", ">", 1);
        assert_eq!(query.validate(), vec!["having requires at least one aggregation"]);

        let query = Query::new("cpu")
            .group_by("host")
            .aggregate(AggregateFunction::Max, "v");
        assert!(query.validate().is_empty());
    }

    #[test]
    fn test_group_by_dedups_and_order_by_replaces() {
        let query = Query::new("cpu")
            .group_by("host")
            .group_by("region")
            .group_by("host")
            .order_by("time", SortDirection::Asc)
            .order_by("value", SortDirection::Desc)
            .order_by("time", SortDirection::Desc);

        assert_eq!(query.group_by_tags(), &["host".to_string(), "region".to_string()]);
        assert_eq!(
            query.ordering(),
            &[
                ("time".to_string(), SortDirection::Desc),
                ("value".to_string(), SortDirection::Desc)
            ]
        );
    }

    #[test]
    fn test_aggregate_function_from_str() {
        assert_eq!("avg".parse::<AggregateFunction>().unwrap(), AggregateFunction::Mean);
        assert_eq!("STDEV".parse::<AggregateFunction>().unwrap(), AggregateFunction::Stddev);
        assert_eq!("p95".parse::<AggregateFunction>().unwrap(), AggregateFunction::Percentile(95));
        assert_eq!(
            "percentile_99".parse::<AggregateFunction>().unwrap(),
            AggregateFunction::Percentile(99)
        );
        assert!("p101".parse::<AggregateFunction>().is_err());
        assert!("mode".parse::<AggregateFunction>().is_err());
    }

    #[test]
    fn test_fill_policy_from_str() {
        assert_eq!("previous".parse::<FillPolicy>().unwrap(), FillPolicy::Previous);
        assert_eq!("0".parse::<FillPolicy>().unwrap(), FillPolicy::Value(0.0));
        assert!("sideways".parse::<FillPolicy>().is_err());
    }

    #[test]
    fn test_check_compilable_catches_shape_and_interval() {
        let query = Query::new("cpu").and_where("host", "IN", "a");
        assert!(matches!(
            query.check_compilable(),
            Err(QueryError::UnsupportedValue { .. })
        ));

        let query = Query::new("cpu").interval("5 minutes");
        assert!(matches!(
            query.check_compilable(),
            Err(QueryError::InvalidDuration(_))
        ));
    }
}
