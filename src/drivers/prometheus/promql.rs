//! PromQL compiler
//!
//! Prometheus series carry a single value, so field `f` of measurement `m`
//! is the metric `m_f` and the `value` field is `m` itself. Each
//! aggregation (or each selected field, without aggregations) becomes its
//! own expression, executed as a separate range query.
//!
//! ```text
//! sum by (host) (avg_over_time(cpu_usage{dc="eu"}[5m])) > 10
//! ```

use crate::query::{
    AggregateFunction, Aggregation, CompileResult, CompiledQuery, Compiler, Condition,
    ConditionValue, FillPolicy, LogicalType, Operator, Query, QueryError, Scalar, SortDirection,
    TimeSpec, WILDCARD,
};
use chrono::{DateTime, Duration, Utc};

const BACKEND: &str = "prometheus";

/// Field name that maps onto the bare measurement metric
pub const VALUE_FIELD: &str = "value";

/// One expression and the series name used when results drop `__name__`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromExpression {
    pub name: String,
    pub expr: String,
}

/// Compiled range query
#[derive(Debug, Clone, PartialEq)]
pub struct PromQuery {
    pub expressions: Vec<PromExpression>,
    pub time: TimeSpec,
    pub step: String,
}

impl PromQuery {
    /// Absolute bounds; relative windows end at `now`
    pub fn bounds(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        match self.time {
            TimeSpec::Unset => (now - Duration::hours(1), now),
            TimeSpec::Relative(d) => (d.before(now), now),
            TimeSpec::Absolute { start, end } => (start, end),
        }
    }

    /// `/api/v1/query_range` parameters for one expression
    pub fn params(&self, expression: &PromExpression, now: DateTime<Utc>) -> Vec<(&'static str, String)> {
        let (start, end) = self.bounds(now);
        vec![
            ("query", expression.expr.clone()),
            ("start", start.timestamp().to_string()),
            ("end", end.timestamp().to_string()),
            ("step", self.step.clone()),
        ]
    }
}

impl std::fmt::Display for PromQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, expression) in self.expressions.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            f.write_str(&expression.expr)?;
        }
        Ok(())
    }
}

impl CompiledQuery for PromQuery {
    fn backend(&self) -> &'static str {
        BACKEND
    }
}

/// Double-quoted PromQL string literal
pub fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Metric holding `field` of `measurement`
pub fn metric_name(measurement: &str, field: &str) -> String {
    if field.is_empty() || field == VALUE_FIELD || field == WILDCARD {
        measurement.to_string()
    } else {
        format!("{}_{}", measurement, field)
    }
}

fn alternation(items: &[Scalar]) -> String {
    let members: Vec<String> = items
        .iter()
        .map(|s| regex::escape(&s.to_plain_string()))
        .collect();
    format!("^(?:{})$", members.join("|"))
}

fn matcher(condition: &Condition) -> Option<String> {
    let label = condition.field();
    match (condition.operator(), condition.value()) {
        (Operator::Eq, ConditionValue::Scalar(v)) => Some(format!("{}={}", label, quote(&v.to_plain_string()))),
        (Operator::Neq, ConditionValue::Scalar(v)) => Some(format!("{}!={}", label, quote(&v.to_plain_string()))),
        (Operator::Regex, ConditionValue::Scalar(v)) => Some(format!("{}=~{}", label, quote(&v.to_plain_string()))),
        (Operator::NotRegex, ConditionValue::Scalar(v)) => {
            Some(format!("{}!~{}", label, quote(&v.to_plain_string())))
        }
        (Operator::In, ConditionValue::List(items)) => Some(format!("{}=~{}", label, quote(&alternation(items)))),
        (Operator::NotIn, ConditionValue::List(items)) => {
            Some(format!("{}!~{}", label, quote(&alternation(items))))
        }
        _ => None,
    }
}

fn matchers(conditions: &[Condition]) -> Vec<String> {
    let mut out = Vec::new();
    for condition in conditions {
        if condition.is_time() {
            continue;
        }
        if condition.logical() == LogicalType::Or {
            tracing::warn!(
                driver = BACKEND,
                field = %condition.field(),
                "Label matchers are conjunctive, OR treated as AND"
            );
        }
        match matcher(condition) {
            Some(m) => out.push(m),
            None => tracing::warn!(
                driver = BACKEND,
                field = %condition.field(),
                operator = %condition.operator(),
                "Operator has no label matcher, condition ignored"
            ),
        }
    }
    out
}

fn selector(metric: &str, matchers: &[String]) -> String {
    if matchers.is_empty() {
        metric.to_string()
    } else {
        format!("{}{{{}}}", metric, matchers.join(","))
    }
}

fn quantile(p: u8) -> String {
    (f64::from(p) / 100.0).to_string()
}

fn raw_error(query: &Query, message: String) -> QueryError {
    QueryError::RawQuery {
        backend: BACKEND,
        query: query.measurement().to_string(),
        message,
    }
}

fn over_time(query: &Query, function: AggregateFunction, selector: &str, interval: &str) -> CompileResult<String> {
    let range = format!("{}[{}]", selector, interval);
    let expr = match function {
        AggregateFunction::Mean => format!("avg_over_time({})", range),
        AggregateFunction::Sum => format!("sum_over_time({})", range),
        AggregateFunction::Min => format!("min_over_time({})", range),
        AggregateFunction::Max => format!("max_over_time({})", range),
        AggregateFunction::Count => format!("count_over_time({})", range),
        AggregateFunction::Last => format!("last_over_time({})", range),
        AggregateFunction::Stddev => format!("stddev_over_time({})", range),
        AggregateFunction::Median => format!("quantile_over_time(0.5, {})", range),
        AggregateFunction::Percentile(p) => format!("quantile_over_time({}, {})", quantile(p), range),
        AggregateFunction::Spread => format!("(max_over_time({r}) - min_over_time({r}))", r = range),
        AggregateFunction::First => {
            return Err(raw_error(query, "first has no range-vector function".to_string()))
        }
    };
    Ok(expr)
}

/// Aggregate across series, optionally grouped by labels. `bucketed`
/// inputs are already per-window counts, so counting sums them.
fn across(
    query: &Query,
    function: AggregateFunction,
    inner: &str,
    group_by: &[String],
    bucketed: bool,
) -> CompileResult<String> {
    let by = if group_by.is_empty() {
        String::new()
    } else {
        format!(" by ({}) ", group_by.join(", "))
    };

    let op = match function {
        AggregateFunction::Mean => "avg",
        AggregateFunction::Sum => "sum",
        AggregateFunction::Min => "min",
        AggregateFunction::Max => "max",
        AggregateFunction::Stddev => "stddev",
        AggregateFunction::Count if bucketed => "sum",
        AggregateFunction::Count => "count",
        AggregateFunction::Median => return Ok(format!("quantile{}(0.5, {})", by, inner)),
        AggregateFunction::Percentile(p) => {
            return Ok(format!("quantile{}({}, {})", by, quantile(p), inner))
        }
        AggregateFunction::First | AggregateFunction::Last | AggregateFunction::Spread => {
            return Err(raw_error(
                query,
                format!("{} has no cross-series aggregation operator", function),
            ))
        }
    };
    Ok(format!("{}{}({})", op, by, inner))
}

fn comparison(operator: Operator) -> Option<&'static str> {
    match operator {
        Operator::Eq => Some("=="),
        Operator::Neq => Some("!="),
        Operator::Gt => Some(">"),
        Operator::Gte => Some(">="),
        Operator::Lt => Some("<"),
        Operator::Lte => Some("<="),
        _ => None,
    }
}

fn number(field: &str, value: &Scalar) -> CompileResult<String> {
    match value {
        Scalar::Integer(i) => Ok(i.to_string()),
        Scalar::Float(f) if f.is_finite() => Ok(f.to_string()),
        other => Err(QueryError::UnsupportedValue {
            field: field.to_string(),
            reason: format!("comparison needs a number, got {:?}", other),
        }),
    }
}

#[derive(Debug, Clone)]
pub struct PromQlCompiler {
    default_step: String,
}

impl Default for PromQlCompiler {
    fn default() -> Self {
        Self::new("1m")
    }
}

impl PromQlCompiler {
    /// `default_step` is used when the query has no interval
    pub fn new(default_step: impl Into<String>) -> Self {
        Self {
            default_step: default_step.into(),
        }
    }

    fn aggregation(
        &self,
        query: &Query,
        agg: &Aggregation,
        matchers: &[String],
        interval: Option<&str>,
    ) -> CompileResult<String> {
        let sel = selector(&metric_name(query.measurement(), &agg.field), matchers);
        let group_by = query.group_by_tags();

        let mut expr = match interval {
            Some(interval) => {
                let inner = over_time(query, agg.function, &sel, interval)?;
                if group_by.is_empty() {
                    inner
                } else {
                    across(query, agg.function, &inner, group_by, true)?
                }
            }
            None => across(query, agg.function, &sel, group_by, false)?,
        };

        for having in query.having_clauses() {
            if having.field != agg.output_name() && having.field != agg.field {
                continue;
            }
            match comparison(having.operator) {
                Some(op) => {
                    expr = format!("{} {} {}", expr, op, number(&having.field, &having.value)?);
                }
                None => tracing::warn!(
                    driver = BACKEND,
                    field = %having.field,
                    operator = %having.operator,
                    "Having operator is not a comparison, ignored"
                ),
            }
        }
        Ok(expr)
    }

    fn limited(&self, query: &Query, expr: String) -> String {
        match query.limit_value() {
            None => expr,
            Some(n) => {
                let k = match query.ordering().first() {
                    Some((_, SortDirection::Asc)) => "bottomk",
                    _ => "topk",
                };
                format!("{}({}, {})", k, n, expr)
            }
        }
    }
}

impl Compiler for PromQlCompiler {
    type Output = PromQuery;

    fn compile(&self, query: &Query) -> CompileResult<PromQuery> {
        query.check_compilable()?;

        let matchers = matchers(query.conditions());
        let interval = query.parsed_interval()?.map(|d| d.to_promql());
        let mut expressions = Vec::new();

        if query.aggregations().is_empty() {
            let mut fields = query.explicit_fields();
            if fields.is_empty() {
                fields.push(VALUE_FIELD);
            }
            for field in fields {
                let metric = metric_name(query.measurement(), field);
                expressions.push(PromExpression {
                    expr: self.limited(query, selector(&metric, &matchers)),
                    name: metric,
                });
            }
            if !query.group_by_tags().is_empty() {
                tracing::warn!(driver = BACKEND, "GROUP BY without aggregation ignored");
            }
        } else {
            for agg in query.aggregations() {
                let expr = self.aggregation(query, agg, &matchers, interval.as_deref())?;
                expressions.push(PromExpression {
                    name: agg.output_name(),
                    expr: self.limited(query, expr),
                });
            }
            let unmatched = query.having_clauses().iter().filter(|h| {
                !query
                    .aggregations()
                    .iter()
                    .any(|a| h.field == a.output_name() || h.field == a.field)
            });
            for having in unmatched {
                tracing::warn!(driver = BACKEND, field = %having.field, "Having matches no aggregation, ignored");
            }
        }

        for math in query.math_expressions() {
            expressions.push(PromExpression {
                name: math.alias.clone(),
                expr: math.expression.clone(),
            });
        }

        if let Some(policy) = query.fill_policy() {
            if !matches!(policy, FillPolicy::Null | FillPolicy::None) {
                tracing::debug!(driver = BACKEND, fill = ?policy, "Range queries have no fill, ignored");
            }
        }
        if query.offset_value().is_some() {
            tracing::warn!(driver = BACKEND, "OFFSET is not supported, ignored");
        }

        let compiled = PromQuery {
            expressions,
            time: query.time(),
            step: interval.unwrap_or_else(|| self.default_step.clone()),
        };

        tracing::debug!(
            driver = BACKEND,
            measurement = %query.measurement(),
            query = %compiled,
            "Compiled PromQL query"
        );
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn compile(query: &Query) -> PromQuery {
        PromQlCompiler::default().compile(query).unwrap()
    }

    #[test]
    fn test_plain_selector() {
        let compiled = compile(&Query::new("node_load1"));
        assert_eq!(compiled.to_string(), "node_load1");
        assert_eq!(compiled.step, "1m");
        assert_eq!(compiled.expressions[0].name, "node_load1");
    }

    #[test]
    fn test_fields_become_metrics() {
        let compiled = compile(&Query::new("cpu").select(["usage", "idle"]));
        assert_eq!(compiled.to_string(), "cpu_usage\ncpu_idle");
    }

    #[test]
    fn test_label_matchers() {
        let query = Query::new("http_requests_total")
            .and_where("job", "=", "api")
            .and_where("code", "!=", "500")
            .where_regex("path", "/api/.*")
            .where_not_regex("method", "OPTIONS|HEAD")
            .where_in("instance", vec!["a.example:9100", "b.example:9100"])
            .where_not_in("env", vec!["dev"]);

        assert_eq!(
            compile(&query).to_string(),
            r#"http_requests_total{job="api",code!="500",path=~"/api/.*",method!~"OPTIONS|HEAD",instance=~"^(?:a\\.example:9100|b\\.example:9100)$",env!~"^(?:dev)$"}"#
        );
    }

    #[test]
    fn test_unsupported_operators_are_ignored() {
        let query = Query::new("cpu")
            .and_where("host", "=", "web01")
            .and_where("usage", ">", 50)
            .where_between("usage", 1, 2);
        assert_eq!(compile(&query).to_string(), r#"cpu{host="web01"}"#);
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn test_bucketed_aggregation() {
        let query = Query::new("cpu")
            .and_where("dc", "=", "eu")
            .latest("6h")
            .unwrap()
            .interval("5m")
            .aggregate(AggregateFunction::Mean, "usage");
        let compiled = compile(&query);

        assert_eq!(compiled.to_string(), r#"avg_over_time(cpu_usage{dc="eu"}[5m])"#);
        assert_eq!(compiled.step, "5m");
        assert_eq!(compiled.expressions[0].name, "mean_usage");

        let now = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let (start, end) = compiled.bounds(now);
        assert_eq!(end, now);
        assert_eq!(start, Utc.with_ymd_and_hms(2023, 10, 27, 6, 0, 0).unwrap());
    }

    #[test]
    fn test_huge_relative_window() {
        let compiled = compile(&Query::new("up").latest("1000000000d").unwrap());
        let now = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let (start, end) = compiled.bounds(now);
        assert_eq!(start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(end, now);

        let params = compiled.params(&compiled.expressions[0], now);
        assert_eq!(params[1], ("start", start.timestamp().to_string()));
    }

    #[test]
    fn test_grouped_aggregations() {
        let query = Query::new("cpu")
            .interval("1m")
            .group_by("host")
            .group_by("dc")
            .aggregate(AggregateFunction::Count, "usage")
            .aggregate(AggregateFunction::Percentile(95), "usage");
        let compiled = compile(&query);

        assert_eq!(compiled.expressions.len(), 2);
        assert_eq!(
            compiled.expressions[0].expr,
            "sum by (host, dc) (count_over_time(cpu_usage[1m]))"
        );
        assert_eq!(
            compiled.expressions[1].expr,
            "quantile by (host, dc) (0.95, quantile_over_time(0.95, cpu_usage[1m]))"
        );
    }

    #[test]
    fn test_aggregation_without_interval() {
        let query = Query::new("cpu")
            .group_by("host")
            .aggregate(AggregateFunction::Max, "value");
        assert_eq!(compile(&query).to_string(), "max by (host) (cpu)");

        let query = Query::new("cpu").aggregate(AggregateFunction::Sum, "usage");
        assert_eq!(compile(&query).to_string(), "sum(cpu_usage)");
    }

    #[test]
    fn test_having_and_limit() {
        let query = Query::new("cpu")
            .interval("5m")
            .group_by("host")
            .aggregate_as(AggregateFunction::Mean, "usage", "avg_usage")
            .having("avg_usage", ">", 80)
            .order_by("avg_usage", SortDirection::Asc)
            .limit(3);
        assert_eq!(
            compile(&query).to_string(),
            "bottomk(3, avg by (host) (avg_over_time(cpu_usage[5m])) > 80)"
        );

        let query = Query::new("cpu").select(["usage"]).limit(5);
        assert_eq!(compile(&query).to_string(), "topk(5, cpu_usage)");
    }

    #[test]
    fn test_spread_and_first() {
        let query = Query::new("cpu")
            .interval("5m")
            .aggregate(AggregateFunction::Spread, "usage");
        assert_eq!(
            compile(&query).to_string(),
            "(max_over_time(cpu_usage[5m]) - min_over_time(cpu_usage[5m]))"
        );

        let query = Query::new("cpu")
            .interval("5m")
            .aggregate(AggregateFunction::First, "usage");
        assert!(matches!(
            PromQlCompiler::default().compile(&query),
            Err(QueryError::RawQuery { .. })
        ));
    }

    #[test]
    fn test_math_expressions_are_passed_through() {
        let query = Query::new("cpu")
            .select(["usage"])
            .math("rate(cpu_usage[5m]) * 100", "usage_rate");
        let compiled = compile(&query);
        assert_eq!(compiled.expressions[1].name, "usage_rate");
        assert_eq!(compiled.expressions[1].expr, "rate(cpu_usage[5m]) * 100");
    }

    #[test]
    fn test_absolute_range_params() {
        let start = Utc.with_ymd_and_hms(2023, 10, 27, 11, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let compiled = compile(&Query::new("up").time_range(start, end));
        let params = compiled.params(&compiled.expressions[0], Utc::now());
        assert_eq!(
            params,
            vec![
                ("query", "up".to_string()),
                ("start", "1698404400".to_string()),
                ("end", "1698408000".to_string()),
                ("step", "1m".to_string()),
            ]
        );
    }
}
