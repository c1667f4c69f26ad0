//! RRDtool query compiler
//!
//! A query becomes an [`RrdQuery`]: the file resolved through the tag
//! strategy plus everything needed to build the `xport` (or `fetch`)
//! command. Data source names are not known at compile time; when no
//! fields are named the command refers to a `value` placeholder, and the
//! executor swaps in the real names from `rrdtool info`.

use super::command::{def_statement, ds_name, ConsolidationFunction, RrdCommand};
use super::layout::{TagStrategy, Tags};
use crate::query::{
    Compiler, CompileResult, CompiledQuery, MathExpression, Operator, Query, TimeSpec, WILDCARD,
};
use std::path::PathBuf;
use std::sync::Arc;

const BACKEND: &str = "rrdtool";

/// Field placeholder used until the file's data sources are known
pub const PLACEHOLDER_FIELD: &str = "value";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RrdQueryMode {
    #[default]
    Xport,
    Fetch,
}

/// AT-style window plus optional resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrdWindow {
    pub start: String,
    pub end: String,
    pub step: Option<u64>,
    pub max_rows: Option<usize>,
}

/// A compiled RRDtool read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RrdQuery {
    pub measurement: String,
    pub path: PathBuf,
    /// Tags encoded in the path, reported as series labels
    pub labels: Tags,
    /// Data source names
    pub fields: Vec<String>,
    /// Whether `fields` came from the query or is the placeholder
    pub explicit_fields: bool,
    pub cf: ConsolidationFunction,
    pub window: RrdWindow,
    pub math: Vec<MathExpression>,
    pub mode: RrdQueryMode,
}

impl RrdQuery {
    /// The command for the current field list
    pub fn command(&self) -> RrdCommand {
        match self.mode {
            RrdQueryMode::Fetch => RrdCommand::Fetch {
                path: self.path.clone(),
                cf: self.cf,
                start: self.window.start.clone(),
                end: self.window.end.clone(),
                resolution: self.window.step,
            },
            RrdQueryMode::Xport => {
                let mut statements = Vec::new();
                for field in &self.fields {
                    statements.push(def_statement(field, &self.path, field, self.cf));
                }
                for (i, math) in self.math.iter().enumerate() {
                    statements.push(format!("CDEF:cdef{}={}", i, math.expression));
                }
                for field in &self.fields {
                    statements.push(format!("XPORT:{}:{}", field, field));
                }
                for (i, math) in self.math.iter().enumerate() {
                    statements.push(format!("XPORT:cdef{}:{}", i, math.alias));
                }
                RrdCommand::Xport {
                    start: self.window.start.clone(),
                    end: self.window.end.clone(),
                    step: self.window.step,
                    max_rows: self.window.max_rows,
                    statements,
                }
            }
        }
    }

    /// Requested names the parser should keep, math aliases included
    pub fn output_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .cloned()
            .chain(self.math.iter().map(|m| m.alias.clone()))
            .collect()
    }

    /// Re-target the query at the data sources a file actually declares.
    ///
    /// The placeholder is replaced by every data source; explicit fields
    /// are kept where they exist, falling back to every data source when
    /// none do.
    pub fn resolve(&self, data_sources: &[String]) -> Self {
        let mut resolved = self.clone();
        if data_sources.is_empty() {
            return resolved;
        }

        let existing: Vec<String> = self
            .fields
            .iter()
            .filter(|f| data_sources.contains(*f))
            .cloned()
            .collect();

        resolved.fields = if self.explicit_fields && !existing.is_empty() {
            existing
        } else {
            data_sources.to_vec()
        };
        resolved
    }
}

impl std::fmt::Display for RrdQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.command())
    }
}

impl CompiledQuery for RrdQuery {
    fn backend(&self) -> &'static str {
        BACKEND
    }
}

#[derive(Debug, Clone)]
pub struct RrdCompiler {
    data_dir: PathBuf,
    strategy: Arc<dyn TagStrategy>,
}

impl RrdCompiler {
    pub fn new(data_dir: impl Into<PathBuf>, strategy: Arc<dyn TagStrategy>) -> Self {
        Self {
            data_dir: data_dir.into(),
            strategy,
        }
    }

    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    pub fn strategy(&self) -> &Arc<dyn TagStrategy> {
        &self.strategy
    }

    /// Same selection as [`Compiler::compile`], read with `fetch`
    pub fn compile_fetch(&self, query: &Query) -> CompileResult<RrdQuery> {
        let mut compiled = self.compile(query)?;
        compiled.mode = RrdQueryMode::Fetch;
        Ok(compiled)
    }
}

impl Compiler for RrdCompiler {
    type Output = RrdQuery;

    fn compile(&self, query: &Query) -> CompileResult<RrdQuery> {
        query.check_compilable()?;

        let mut labels = Tags::new();
        for condition in query.conditions() {
            match (condition.operator(), condition.value().as_scalar()) {
                (Operator::Eq, Some(value)) if !condition.is_time() => {
                    labels.insert(condition.field().to_string(), value.to_plain_string());
                }
                _ => tracing::warn!(
                    driver = BACKEND,
                    field = %condition.field(),
                    operator = %condition.operator(),
                    "Only tag equality selects RRD files, condition ignored"
                ),
            }
        }
        let path = self.strategy.path(&self.data_dir, query.measurement(), &labels);

        let cf = match query.aggregations().first() {
            None => ConsolidationFunction::Average,
            Some(agg) => ConsolidationFunction::for_aggregation(agg.function).unwrap_or_else(|| {
                tracing::warn!(
                    driver = BACKEND,
                    function = %agg.function,
                    "No matching consolidation function, using AVERAGE"
                );
                ConsolidationFunction::Average
            }),
        };

        let mut fields: Vec<String> = query.explicit_fields().into_iter().map(ds_name).collect();
        if fields.is_empty() {
            fields = query
                .aggregations()
                .iter()
                .filter(|agg| !agg.field.is_empty() && agg.field != WILDCARD)
                .map(|agg| ds_name(&agg.field))
                .collect();
        }
        fields.dedup();
        let explicit_fields = !fields.is_empty();
        if !explicit_fields {
            fields.push(PLACEHOLDER_FIELD.to_string());
        }

        let (start, end) = match query.time() {
            TimeSpec::Unset => ("end-1h".to_string(), "now".to_string()),
            TimeSpec::Relative(d) => (format!("end-{}", d.to_rrd()), "now".to_string()),
            TimeSpec::Absolute { start, end } => (start.timestamp().to_string(), end.timestamp().to_string()),
        };
        let step = query
            .parsed_interval()?
            .map(|d| d.as_seconds().max(1) as u64);

        let compiled = RrdQuery {
            measurement: query.measurement().to_string(),
            path,
            labels,
            fields,
            explicit_fields,
            cf,
            window: RrdWindow {
                start,
                end,
                step,
                max_rows: query.limit_value(),
            },
            math: query.math_expressions().to_vec(),
            mode: RrdQueryMode::Xport,
        };

        tracing::debug!(
            driver = BACKEND,
            measurement = %query.measurement(),
            command = %compiled,
            "Compiled RRDtool query"
        );
        Ok(compiled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::rrdtool::layout::{FlatStrategy, FolderStrategy};
    use crate::query::AggregateFunction;
    use chrono::{TimeZone, Utc};

    fn compiler() -> RrdCompiler {
        RrdCompiler::new("/data", Arc::new(FlatStrategy))
    }

    #[test]
    fn test_placeholder_query() {
        let compiled = compiler().compile(&Query::new("cpu")).unwrap();
        assert_eq!(compiled.path, PathBuf::from("/data/cpu.rrd"));
        assert!(!compiled.explicit_fields);
        assert_eq!(
            compiled.to_string(),
            "xport --json --start end-1h --end now DEF:value=/data/cpu.rrd:value:AVERAGE XPORT:value:value"
        );
    }

    #[test]
    fn test_fields_tags_and_cf() {
        let query = Query::new("cpu")
            .select(["usage", "idle"])
            .and_where("host", "=", "web01")
            .and_where("usage", ">", 50)
            .latest("6h")
            .unwrap()
            .interval("5m")
            .aggregate(AggregateFunction::Max, "usage")
            .limit(100);
        let compiled = RrdCompiler::new("/data", Arc::new(FolderStrategy)).compile(&query).unwrap();

        assert_eq!(compiled.path, PathBuf::from("/data/cpu/host=web01/cpu.rrd"));
        assert_eq!(compiled.labels.get("host").map(String::as_str), Some("web01"));
        assert_eq!(compiled.cf, ConsolidationFunction::Max);
        assert_eq!(
            compiled.command().to_args(None),
            vec![
                "xport",
                "--json",
                "--start",
                "end-6h",
                "--end",
                "now",
                "--step",
                "300",
                "--maxrows",
                "100",
                "DEF:usage=/data/cpu/host=web01/cpu.rrd:usage:MAX",
                "DEF:idle=/data/cpu/host=web01/cpu.rrd:idle:MAX",
                "XPORT:usage:usage",
                "XPORT:idle:idle",
            ]
        );
    }

    #[test]
    fn test_unmapped_aggregation_defaults_to_average() {
        let query = Query::new("cpu").aggregate(AggregateFunction::Sum, "usage");
        let compiled = compiler().compile(&query).unwrap();
        assert_eq!(compiled.cf, ConsolidationFunction::Average);
        assert_eq!(compiled.fields, vec!["usage"]);
        assert!(compiled.explicit_fields);
    }

    #[test]
    fn test_math_and_absolute_range() {
        let start = Utc.with_ymd_and_hms(2023, 10, 27, 11, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, 10, 27, 12, 0, 0).unwrap();
        let query = Query::new("cpu")
            .select(["usage"])
            .time_range(start, end)
            .math("usage,100,/", "ratio");
        let compiled = compiler().compile(&query).unwrap();

        let line = compiled.to_string();
        assert!(line.contains("--start 1698404400 --end 1698408000"));
        assert!(line.contains("CDEF:cdef0=usage,100,/"));
        assert!(line.ends_with("XPORT:usage:usage XPORT:cdef0:ratio"));
        assert_eq!(compiled.output_names(), vec!["usage", "ratio"]);
    }

    #[test]
    fn test_fetch_mode() {
        let compiled = compiler().compile_fetch(&Query::new("cpu").interval("1m")).unwrap();
        assert_eq!(
            compiled.command().to_args(None),
            vec!["fetch", "/data/cpu.rrd", "AVERAGE", "--start", "end-1h", "--end", "now", "--resolution", "60"]
        );
    }

    #[test]
    fn test_resolve_data_sources() {
        let ds = vec!["usage".to_string(), "idle".to_string()];

        let placeholder = compiler().compile(&Query::new("cpu")).unwrap();
        assert_eq!(placeholder.resolve(&ds).fields, ds);

        let explicit = compiler()
            .compile(&Query::new("cpu").select(["idle", "steal"]))
            .unwrap();
        assert_eq!(explicit.resolve(&ds).fields, vec!["idle"]);

        let unknown = compiler().compile(&Query::new("cpu").select(["steal"])).unwrap();
        assert_eq!(unknown.resolve(&ds).fields, ds);
    }
}
