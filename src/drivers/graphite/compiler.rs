//! Graphite target compiler
//!
//! Graphite filters by path, not by predicate. A query is lowered into one
//! render target built from nested series functions:
//!
//! ```text
//! summarize(servers.web01.cpu,"5minute","avg")
//! group(alias(averageSeries(cpu.user),"mean_user"),alias(maxSeries(cpu.user),"max_user"))
//! ```
//!
//! Only `=`, `!=` and regex conditions have a Graphite form. Every other
//! operator is skipped with a warning and does not narrow the result.

use crate::query::{
    AggregateFunction, Aggregation, Compiler, CompileResult, CompiledQuery, Condition,
    FillPolicy, MetadataQuery, Operator, Query, QueryError, Scalar, TimeSpec,
};

const BACKEND: &str = "graphite";

/// A compiled render request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphiteQuery {
    pub target: String,
    pub from: String,
    pub until: String,
    pub timezone: Option<String>,
}

impl GraphiteQuery {
    /// Render API parameters, `format=json` included
    pub fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("target", self.target.clone()),
            ("from", self.from.clone()),
            ("until", self.until.clone()),
            ("format", "json".to_string()),
        ];
        if let Some(tz) = &self.timezone {
            params.push(("tz", tz.clone()));
        }
        params
    }
}

impl std::fmt::Display for GraphiteQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pairs: Vec<String> = self
            .params()
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, urlencoding::encode(&value)))
            .collect();
        f.write_str(&pairs.join("&"))
    }
}

impl CompiledQuery for GraphiteQuery {
    fn backend(&self) -> &'static str {
        BACKEND
    }
}

/// Schema lookups: the metrics tree or the tag database
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphiteLookup {
    /// `/metrics/find?query=<pattern>`
    Find(String),
    /// `/tags/autoComplete/tags?expr=<expr>`
    TagKeys { expr: String },
    /// `/tags/autoComplete/values?tag=<tag>&expr=<expr>`
    TagValues { tag: String, expr: String },
}

#[derive(Debug, Clone, Default)]
pub struct GraphiteCompiler {
    prefix: Option<String>,
}

impl GraphiteCompiler {
    /// `prefix` is prepended to every measurement path
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
        }
    }

    fn base_path(&self, measurement: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}.{}", prefix, measurement),
            None => measurement.to_string(),
        }
    }

    pub fn compile_metadata(&self, request: &MetadataQuery) -> GraphiteLookup {
        match request {
            MetadataQuery::Measurements => GraphiteLookup::Find(match &self.prefix {
                Some(prefix) => format!("{}.*", prefix),
                None => "*".to_string(),
            }),
            MetadataQuery::FieldKeys { measurement } => {
                GraphiteLookup::Find(format!("{}.*", self.base_path(measurement)))
            }
            MetadataQuery::TagKeys { measurement } => GraphiteLookup::TagKeys {
                expr: self.name_expr(measurement),
            },
            MetadataQuery::TagValues { measurement, tag } => GraphiteLookup::TagValues {
                tag: tag.clone(),
                expr: self.name_expr(measurement),
            },
        }
    }

    /// Tag expression matching every series below a measurement
    fn name_expr(&self, measurement: &str) -> String {
        format!("name=~^{}\\.", regex::escape(&self.base_path(measurement)))
    }

    /// Plain path of one field, wildcards narrowed by equality conditions
    fn path(&self, query: &Query, field: &str, narrowing: &[String]) -> String {
        let mut path = format!("{}.{}", self.base_path(query.measurement()), field);
        for value in narrowing {
            if path.contains('*') {
                path = path.replacen('*', value, 1);
            } else {
                tracing::debug!(
                    driver = BACKEND,
                    path = %path,
                    value = %value,
                    "No wildcard left to narrow, equality ignored"
                );
            }
        }
        path
    }

    /// The selected series, before aggregation
    fn selection(&self, query: &Query, plan: &FilterPlan) -> String {
        let explicit = query.explicit_fields();
        let paths: Vec<String> = if explicit.is_empty() {
            vec![self.path(query, "*", &plan.narrowing)]
        } else {
            explicit
                .iter()
                .map(|field| self.path(query, field, &plan.narrowing))
                .collect()
        };

        let target = if paths.len() == 1 {
            paths.into_iter().next().unwrap_or_default()
        } else {
            format!("group({})", paths.join(","))
        };
        plan.apply(target)
    }

    /// Source series of one aggregation
    fn aggregation_source(&self, query: &Query, agg: &Aggregation, plan: &FilterPlan) -> String {
        if agg.field.is_empty() || agg.field == crate::query::WILDCARD {
            self.selection(query, plan)
        } else {
            plan.apply(self.path(query, &agg.field, &plan.narrowing))
        }
    }
}

impl Compiler for GraphiteCompiler {
    type Output = GraphiteQuery;

    fn compile(&self, query: &Query) -> CompileResult<GraphiteQuery> {
        query.check_compilable()?;

        let plan = FilterPlan::from_conditions(query.conditions());
        let interval = query.parsed_interval()?.map(|d| d.to_graphite());

        let aggregations = query.aggregations();
        let mut target = match aggregations.len() {
            0 => self.selection(query, &plan),
            1 => {
                let agg = &aggregations[0];
                let wrapped = aggregate(
                    self.aggregation_source(query, agg, &plan),
                    agg.function,
                    interval.as_deref(),
                )?;
                match &agg.alias {
                    Some(alias) => format!("alias({},{})", wrapped, quote(alias)),
                    None => wrapped,
                }
            }
            _ => {
                let targets = aggregations
                    .iter()
                    .map(|agg| {
                        let wrapped = aggregate(
                            self.aggregation_source(query, agg, &plan),
                            agg.function,
                            interval.as_deref(),
                        )?;
                        Ok(format!("alias({},{})", wrapped, quote(&agg.output_name())))
                    })
                    .collect::<CompileResult<Vec<_>>>()?;
                format!("group({})", targets.join(","))
            }
        };

        if aggregations.is_empty() {
            if let Some(interval) = &interval {
                target = format!("summarize({},{},\"avg\")", target, quote(interval));
            }
        }

        match query.fill_policy() {
            Some(FillPolicy::Value(v)) => target = format!("transformNull({},{})", target, number(v)),
            Some(FillPolicy::Previous) => target = format!("keepLastValue({})", target),
            Some(FillPolicy::Linear) => target = format!("interpolate({})", target),
            Some(FillPolicy::Null) | Some(FillPolicy::None) | None => {}
        }

        for having in query.having_clauses() {
            let threshold = match &having.value {
                Scalar::Integer(i) => *i as f64,
                Scalar::Float(f) => *f,
                other => {
                    return Err(raw_error(
                        query,
                        format!("having threshold {:?} is not numeric", other),
                    ))
                }
            };
            target = match having.operator {
                Operator::Gt | Operator::Gte => {
                    format!("removeBelowValue({},{})", target, number(threshold))
                }
                Operator::Lt | Operator::Lte => {
                    format!("removeAboveValue({},{})", target, number(threshold))
                }
                other => {
                    tracing::warn!(
                        driver = BACKEND,
                        operator = %other,
                        "Having operator has no Graphite form, ignored"
                    );
                    target
                }
            };
        }

        if !query.math_expressions().is_empty() {
            tracing::warn!(
                driver = BACKEND,
                measurement = %query.measurement(),
                "Math expressions are not supported by Graphite, ignored"
            );
        }
        if !query.group_by_tags().is_empty() {
            tracing::debug!(
                driver = BACKEND,
                tags = ?query.group_by_tags(),
                "Graphite paths have no tags to group by"
            );
        }

        if let Some(n) = query.limit_value() {
            target = format!("limit({},{})", target, n);
        }

        let (from, until) = time_window(query.time());
        let compiled = GraphiteQuery {
            target,
            from,
            until,
            timezone: query.timezone_name().map(str::to_string),
        };

        tracing::debug!(
            driver = BACKEND,
            measurement = %query.measurement(),
            target = %compiled.target,
            "Compiled Graphite target"
        );
        Ok(compiled)
    }
}

/// Conditions split into path narrowing and wrapping filters
#[derive(Debug, Default)]
struct FilterPlan {
    narrowing: Vec<String>,
    filters: Vec<String>,
}

impl FilterPlan {
    fn from_conditions(conditions: &[Condition]) -> Self {
        let mut plan = Self::default();
        for condition in conditions {
            if condition.is_time() {
                tracing::debug!(
                    driver = BACKEND,
                    "Time conditions are expressed through from/until, ignored"
                );
                continue;
            }

            let value = match condition.value().as_scalar() {
                Some(value) => value.to_plain_string(),
                None => {
                    ignored(condition);
                    continue;
                }
            };

            match condition.operator() {
                Operator::Eq => plan.narrowing.push(value),
                Operator::Neq => plan.filters.push(format!("exclude({{}},{})", quote(&value))),
                Operator::Regex => plan.filters.push(format!("grep({{}},{})", quote(&value))),
                _ => ignored(condition),
            }
        }
        plan
    }

    fn apply(&self, target: String) -> String {
        self.filters
            .iter()
            .fold(target, |inner, filter| filter.replacen("{}", &inner, 1))
    }
}

fn ignored(condition: &Condition) {
    tracing::warn!(
        driver = BACKEND,
        field = %condition.field(),
        operator = %condition.operator(),
        "Condition has no Graphite form, ignored"
    );
}

/// Wrap a target in the series function, or `summarize` when bucketing
fn aggregate(
    target: String,
    function: AggregateFunction,
    interval: Option<&str>,
) -> CompileResult<String> {
    if let Some(interval) = interval {
        let name = match function {
            AggregateFunction::Mean => "avg",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
            AggregateFunction::Count => "count",
            AggregateFunction::First => "first",
            AggregateFunction::Last => "last",
            AggregateFunction::Median => "median",
            AggregateFunction::Stddev => "stddev",
            AggregateFunction::Spread => "range",
            AggregateFunction::Percentile(p) => {
                return Err(QueryError::RawQuery {
                    backend: BACKEND,
                    query: target,
                    message: format!("summarize has no p{} function", p),
                })
            }
        };
        return Ok(format!("summarize({},{},{})", target, quote(interval), quote(name)));
    }

    Ok(match function {
        AggregateFunction::Mean => format!("averageSeries({})", target),
        AggregateFunction::Sum => format!("sumSeries({})", target),
        AggregateFunction::Min => format!("minSeries({})", target),
        AggregateFunction::Max => format!("maxSeries({})", target),
        AggregateFunction::Count => format!("countSeries({})", target),
        AggregateFunction::Stddev => format!("stddevSeries({})", target),
        AggregateFunction::Spread => format!("rangeOfSeries({})", target),
        AggregateFunction::Percentile(p) => format!("percentileOfSeries({},{})", target, p),
        AggregateFunction::Median => format!("aggregate({},\"median\")", target),
        AggregateFunction::First => format!("aggregate({},\"first\")", target),
        AggregateFunction::Last => format!("aggregate({},\"last\")", target),
    })
}

/// `from`/`until` parameters; unset windows cover the last hour
fn time_window(time: TimeSpec) -> (String, String) {
    match time {
        TimeSpec::Unset => ("-1h".to_string(), "now".to_string()),
        TimeSpec::Relative(d) => (format!("-{}", d.to_graphite()), "now".to_string()),
        TimeSpec::Absolute { start, end } => (start.timestamp().to_string(), end.timestamp().to_string()),
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn number(v: f64) -> String {
    v.to_string()
}

fn raw_error(query: &Query, message: String) -> QueryError {
    QueryError::RawQuery {
        backend: BACKEND,
        query: query.measurement().to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn compile(query: &Query) -> GraphiteQuery {
        GraphiteCompiler::default().compile(query).unwrap()
    }

    #[test]
    fn test_wildcard_selection() {
        let compiled = compile(&Query::new("cpu"));
        assert_eq!(compiled.target, "cpu.*");
        assert_eq!(compiled.from, "-1h");
        assert_eq!(compiled.until, "now");
        assert_eq!(
            compiled.to_string(),
            "target=cpu.%2A&from=-1h&until=now&format=json"
        );
    }

    #[test]
    fn test_field_selection() {
        assert_eq!(compile(&Query::new("cpu").select(["user"])).target, "cpu.user");
        assert_eq!(
            compile(&Query::new("cpu").select(["user", "system"])).target,
            "group(cpu.user,cpu.system)"
        );
    }

    #[test]
    fn test_prefix() {
        let compiler = GraphiteCompiler::new(Some("stats".into()));
        assert_eq!(compiler.compile(&Query::new("cpu")).unwrap().target, "stats.cpu.*");
        assert_eq!(
            GraphiteCompiler::new(Some(String::new())).compile(&Query::new("cpu")).unwrap().target,
            "cpu.*"
        );
    }

    #[test]
    fn test_equality_replaces_wildcard() {
        let compiled = compile(&Query::new("servers").and_where("host", "=", "web01"));
        assert_eq!(compiled.target, "servers.web01");
        assert!(!compiled.target.contains("grep"));
        assert!(!compiled.target.contains("exclude"));
    }

    #[test]
    fn test_equality_without_wildcard_is_ignored() {
        let query = Query::new("cpu").select(["user"]).and_where("host", "=", "web01");
        assert_eq!(compile(&query).target, "cpu.user");
    }

    #[test]
    fn test_inequality_and_regex() {
        let query = Query::new("servers")
            .and_where("host", "!=", "web01")
            .where_regex("host", "^db");
        assert_eq!(compile(&query).target, "grep(exclude(servers.*,\"web01\"),\"^db\")");
    }

    #[test]
    fn test_unsupported_operators_are_ignored() {
        let query = Query::new("cpu")
            .and_where("usage", ">", 90)
            .where_between("usage", 1, 2)
            .where_in("host", vec!["a", "b"])
            .where_not_regex("host", "x");
        assert_eq!(compile(&query).target, "cpu.*");
    }

    #[test]
    fn test_single_aggregation() {
        let query = Query::new("cpu").aggregate(AggregateFunction::Mean, "user");
        assert_eq!(compile(&query).target, "averageSeries(cpu.user)");

        let query = Query::new("cpu").aggregate(AggregateFunction::Percentile(95), "user");
        assert_eq!(compile(&query).target, "percentileOfSeries(cpu.user,95)");

        let query = Query::new("cpu").aggregate_as(AggregateFunction::Stddev, "user", "jitter");
        assert_eq!(compile(&query).target, "alias(stddevSeries(cpu.user),\"jitter\")");
    }

    #[test]
    fn test_summarize_with_interval() {
        let query = Query::new("cpu")
            .interval("5m")
            .aggregate(AggregateFunction::Max, "user");
        assert_eq!(compile(&query).target, "summarize(cpu.user,\"5minute\",\"max\")");

        let query = Query::new("cpu").select(["user"]).interval("1h");
        assert_eq!(compile(&query).target, "summarize(cpu.user,\"1hour\",\"avg\")");
    }

    #[test]
    fn test_percentile_cannot_be_summarized() {
        let query = Query::new("cpu")
            .interval("5m")
            .aggregate(AggregateFunction::Percentile(99), "user");
        assert!(matches!(
            GraphiteCompiler::default().compile(&query),
            Err(QueryError::RawQuery { .. })
        ));
    }

    #[test]
    fn test_multiple_aggregations_are_grouped() {
        let query = Query::new("cpu")
            .aggregate(AggregateFunction::Mean, "user")
            .aggregate(AggregateFunction::Max, "user");
        assert_eq!(
            compile(&query).target,
            "group(alias(averageSeries(cpu.user),\"mean_user\"),alias(maxSeries(cpu.user),\"max_user\"))"
        );
    }

    #[test]
    fn test_fill_having_limit() {
        let query = Query::new("cpu")
            .select(["user"])
            .fill(FillPolicy::Value(0.0))
            .limit(5);
        assert_eq!(compile(&query).target, "limit(transformNull(cpu.user,0),5)");

        let query = Query::new("cpu").select(["user"]).fill(FillPolicy::Previous);
        assert_eq!(compile(&query).target, "keepLastValue(cpu.user)");

        let query = Query::new("cpu")
            .aggregate(AggregateFunction::Sum, "user")
            .having("sum_user", ">", 10.5);
        assert_eq!(compile(&query).target, "removeBelowValue(sumSeries(cpu.user),10.5)");
    }

    #[test]
    fn test_time_windows() {
        let compiled = compile(&Query::new("cpu").latest("15m").unwrap());
        assert_eq!(compiled.from, "-15minute");

        let start = Utc.with_ymd_and_hms(2023, 10, 27, 11, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let compiled = compile(&Query::new("cpu").time_range(start, end).timezone("Europe/Paris"));
        assert_eq!(compiled.from, "1698404400");
        assert_eq!(compiled.until, "1698408000");
        assert!(compiled.params().contains(&("tz", "Europe/Paris".to_string())));
    }

    #[test]
    fn test_metadata_lookups() {
        let compiler = GraphiteCompiler::new(Some("app".into()));
        assert_eq!(
            compiler.compile_metadata(&MetadataQuery::Measurements),
            GraphiteLookup::Find("app.*".into())
        );
        assert_eq!(
            compiler.compile_metadata(&MetadataQuery::FieldKeys {
                measurement: "cpu".into()
            }),
            GraphiteLookup::Find("app.cpu.*".into())
        );
        assert_eq!(
            compiler.compile_metadata(&MetadataQuery::TagValues {
                measurement: "cpu".into(),
                tag: "host".into()
            }),
            GraphiteLookup::TagValues {
                tag: "host".into(),
                expr: "name=~^app\\.cpu\\.".into()
            }
        );
    }
}
