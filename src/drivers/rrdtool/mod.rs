//! RRDtool backend
//!
//! - `command`: structured rrdtool invocations
//! - `layout`: tag-to-path strategies
//! - `compiler`: `xport`/`fetch` compilation
//! - `process`: the persistent `rrdtool -` pipe
//! - `runner`: CLI or pipe execution
//! - `parser`: xport JSON, fetch and info output
//!
//! Files are created on first write. Reading a file nobody has written yet
//! yields an empty result, not an error.

mod command;
mod compiler;
mod error;
mod layout;
mod parser;
mod process;
mod runner;

pub use command::{
    def_statement, ds_name, escape_colons, Archive, ConsolidationFunction, DataSource, RrdCommand,
};
pub use compiler::{RrdCompiler, RrdQuery, RrdQueryMode, RrdWindow, PLACEHOLDER_FIELD};
pub use error::RrdError;
pub use layout::{
    strategy_for, FlatStrategy, FolderStrategy, NoTagsStrategy, RrdFile, TagStrategy, Tags,
};
pub use parser::{parse_fetch, parse_info, parse_last, parse_xport, FetchOutput, RrdInfo};
pub use process::{ProcessState, RrdProcess};
pub use runner::RrdRunner;

use super::{DriverRegistry, TimeSeriesDriver};
use crate::config::{Config, RrdToolConfig};
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::point::DataPoint;
use crate::query::{
    Compiler, CompileResult, Executor, LabelResult, MetadataQuery, Query, QueryResult,
    TimeSeriesResult,
};
use crate::schema::SchemaRegistry;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;

pub const NAME: &str = "rrdtool";

pub fn register(registry: &mut DriverRegistry) -> TimeseriesResult<()> {
    registry.register(NAME, create)
}

fn create(config: &Config) -> TimeseriesResult<Box<dyn TimeSeriesDriver>> {
    Ok(Box::new(RrdToolDriver::new(&config.rrdtool)?))
}

/// Runs compiled reads, resolving data sources through `info` first
pub struct RrdExecutor {
    runner: RrdRunner,
}

impl RrdExecutor {
    pub fn new(runner: RrdRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &RrdRunner {
        &self.runner
    }

    pub async fn info(&self, path: &Path) -> Result<RrdInfo, RrdError> {
        let output = self
            .runner
            .run(&RrdCommand::Info {
                path: path.to_path_buf(),
            })
            .await?;
        Ok(parse_info(&output))
    }

    async fn read(&self, query: &RrdQuery) -> TimeseriesResult<TimeSeriesResult> {
        let info = self.info(&query.path).await?;
        let resolved = query.resolve(&info.data_sources);
        let command = resolved.command();
        let output = self
            .runner
            .run(&command)
            .await
            .map_err(|e| TimeseriesError::execution(NAME, command.to_line(None), e))?;

        let requested = resolved.output_names();
        let result = match resolved.mode {
            RrdQueryMode::Xport => parse_xport(&output, &resolved.measurement, &requested, &resolved.labels)?,
            RrdQueryMode::Fetch => {
                parse_fetch(&output)?.into_result(&resolved.measurement, &requested, &resolved.labels)
            }
        };
        Ok(result.with_metadata("query", command.to_line(None)))
    }
}

#[async_trait]
impl Executor for RrdExecutor {
    type Query = RrdQuery;

    async fn execute(&self, query: &RrdQuery) -> TimeseriesResult<QueryResult> {
        match self.read(query).await {
            Ok(result) => Ok(result.with_metadata("backend", NAME).into()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(
                    driver = NAME,
                    path = %query.path.display(),
                    "RRD file does not exist yet, returning empty result"
                );
                Ok(TimeSeriesResult::empty().with_metadata("backend", NAME).into())
            }
            Err(e) => {
                tracing::error!(driver = NAME, query = %query, error = %e, "RRDtool query failed");
                Err(e)
            }
        }
    }
}

/// Local RRD files behind a tag strategy
pub struct RrdToolDriver {
    compiler: RrdCompiler,
    executor: RrdExecutor,
    config: RrdToolConfig,
    schema: SchemaRegistry,
}

impl RrdToolDriver {
    /// No process is started and no file is touched here
    pub fn new(config: &RrdToolConfig) -> TimeseriesResult<Self> {
        if config.data_dir.is_empty() {
            return Err(TimeseriesError::Configuration("rrdtool: missing data_dir".to_string()));
        }
        if config.binary.is_empty() {
            return Err(TimeseriesError::Configuration("rrdtool: missing binary".to_string()));
        }
        if config.step == 0 || config.rows == 0 || config.consolidation.is_empty() {
            return Err(TimeseriesError::Configuration(
                "rrdtool: step, rows and consolidation must be set".to_string(),
            ));
        }

        Ok(Self {
            compiler: RrdCompiler::new(&config.data_dir, strategy_for(config.tag_strategy)),
            executor: RrdExecutor::new(RrdRunner::new(config)),
            config: config.clone(),
            schema: SchemaRegistry::new(),
        })
    }

    /// Declare data sources from registered schemas when files are created
    pub fn with_schema(mut self, schema: SchemaRegistry) -> Self {
        self.schema = schema;
        self
    }

    /// Read through `fetch` instead of `xport`
    pub async fn fetch(&self, query: &Query) -> TimeseriesResult<QueryResult> {
        let compiled = self.compiler.compile_fetch(query)?;
        self.executor.execute(&compiled).await
    }

    fn create_command(&self, path: &Path, point: &DataPoint) -> RrdCommand {
        let names: Vec<String> = match self.schema.get(&point.measurement) {
            Some(schema) => schema.fields.keys().map(|f| ds_name(f)).collect(),
            None => point.fields.keys().map(|f| ds_name(f)).collect(),
        };

        RrdCommand::Create {
            path: path.to_path_buf(),
            step: self.config.step,
            start: point.timestamp.timestamp() - 1,
            data_sources: names
                .into_iter()
                .map(|name| DataSource::gauge(name, self.config.heartbeat))
                .collect(),
            archives: self
                .config
                .consolidation
                .iter()
                .map(|&cf| Archive {
                    cf,
                    steps: 1,
                    rows: self.config.rows,
                })
                .collect(),
        }
    }

    fn write_error(e: RrdError) -> TimeseriesError {
        match e {
            RrdError::PrematureUpdate { .. } => TimeseriesError::Rrd(e),
            other => TimeseriesError::Write(other.to_string()),
        }
    }

    fn files(&self, measurement: &str) -> TimeseriesResult<Vec<RrdFile>> {
        Ok(self.compiler.strategy().files(self.compiler.data_dir(), measurement)?)
    }
}

#[async_trait]
impl TimeSeriesDriver for RrdToolDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compile(&self, query: &Query) -> CompileResult<String> {
        Ok(self.compiler.compile(query)?.to_string())
    }

    async fn health_check(&self) -> TimeseriesResult<()> {
        tokio::fs::create_dir_all(&self.config.data_dir).await?;
        self.executor.runner().health_check().await?;
        Ok(())
    }

    async fn query(&self, query: &Query) -> TimeseriesResult<QueryResult> {
        let compiled = self.compiler.compile(query)?;
        self.executor.execute(&compiled).await
    }

    async fn metadata(&self, request: &MetadataQuery) -> TimeseriesResult<LabelResult> {
        let values = match request {
            MetadataQuery::Measurements => self
                .compiler
                .strategy()
                .measurements(self.compiler.data_dir())?,
            MetadataQuery::TagKeys { measurement } => {
                let keys: BTreeSet<String> = self
                    .files(measurement)?
                    .into_iter()
                    .flat_map(|f| f.tags.into_keys())
                    .collect();
                keys.into_iter().collect()
            }
            MetadataQuery::TagValues { measurement, tag } => {
                let values: BTreeSet<String> = self
                    .files(measurement)?
                    .into_iter()
                    .filter_map(|mut f| f.tags.remove(tag))
                    .collect();
                values.into_iter().collect()
            }
            MetadataQuery::FieldKeys { measurement } => {
                let mut names: Vec<String> = Vec::new();
                for file in self.files(measurement)? {
                    for ds in self.executor.info(&file.path).await?.data_sources {
                        if !names.contains(&ds) {
                            names.push(ds);
                        }
                    }
                }
                names
            }
        };
        Ok(LabelResult::new(values))
    }

    async fn write(&self, point: &DataPoint) -> TimeseriesResult<()> {
        if point.fields.is_empty() {
            return Err(TimeseriesError::Write(format!(
                "point for '{}' has no fields",
                point.measurement
            )));
        }
        if self.schema.contains(&point.measurement) {
            self.schema.validate(point)?;
        }

        let path = self
            .compiler
            .strategy()
            .path(self.compiler.data_dir(), &point.measurement, &point.tags);

        if !tokio::fs::try_exists(&path).await? {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let create = self.create_command(&path, point);
            self.executor.runner().run(&create).await.map_err(Self::write_error)?;
            tracing::info!(driver = NAME, path = %path.display(), "Created RRD file");
        }

        let mut template = Vec::with_capacity(point.fields.len());
        let mut row = point.timestamp.timestamp().to_string();
        for (field, value) in &point.fields {
            template.push(ds_name(field));
            row.push(':');
            row.push_str(&value.as_f64().to_string());
        }

        let update = RrdCommand::Update {
            path: path.clone(),
            template,
            rows: vec![row],
        };
        self.executor.runner().run(&update).await.map_err(Self::write_error)?;
        tracing::debug!(driver = NAME, measurement = %point.measurement, "Wrote point");
        Ok(())
    }

    async fn close(&self) -> TimeseriesResult<()> {
        self.executor.runner().close().await?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::TagStrategyKind;
    use crate::schema::{FieldKind, MeasurementSchema};
    use chrono::DateTime;

    fn driver(dir: &Path) -> RrdToolDriver {
        let binary = runner::tests::fake_cli_binary(dir);
        let config = RrdToolConfig {
            data_dir: dir.join("rrd").to_string_lossy().to_string(),
            binary: binary.to_string_lossy().to_string(),
            tag_strategy: TagStrategyKind::Folder,
            ..RrdToolConfig::default()
        };
        RrdToolDriver::new(&config).unwrap()
    }

    fn calls(dir: &Path) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_result() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());

        let result = driver.query(&Query::new("cpu")).await.unwrap();
        let series = result.as_time_series().unwrap();
        assert!(series.is_empty());
        assert_eq!(series.metadata.get("backend"), Some(&serde_json::json!("rrdtool")));
    }

    #[tokio::test]
    async fn test_write_creates_then_updates() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let ts = DateTime::from_timestamp(1698408000, 0).unwrap();
        let point = DataPoint::with_timestamp("cpu", ts)
            .add_tag("host", "web01")
            .add_field("usage", 1.5)
            .add_field("idle", 98i64);

        driver.write(&point).await.unwrap();
        let path = dir.path().join("rrd/cpu/host=web01/cpu.rrd");
        assert!(path.exists());

        let log = calls(dir.path());
        assert_eq!(log.len(), 2);
        assert!(log[0].starts_with(&format!("create {} --step 60 --start 1698407999", path.display())));
        assert!(log[0].contains("DS:idle:GAUGE:120:U:U DS:usage:GAUGE:120:U:U"));
        assert!(log[0].ends_with("RRA:LAST:0.5:1:1440"));
        assert_eq!(log[1], format!("update {} -t idle:usage 1698408000:98:1.5", path.display()));

        // second write goes straight to update
        driver.write(&point.clone().timestamp(ts + chrono::Duration::seconds(60))).await.unwrap();
        assert_eq!(calls(dir.path()).len(), 3);
    }

    #[tokio::test]
    async fn test_premature_update_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let ts = DateTime::from_timestamp(1000000000, 0).unwrap();
        let point = DataPoint::with_timestamp("cpu", ts).add_field("usage", 1.0);

        let err = driver.write(&point).await.unwrap_err();
        assert!(matches!(err, TimeseriesError::Rrd(RrdError::PrematureUpdate { .. })));
    }

    #[tokio::test]
    async fn test_query_resolves_data_sources() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let ts = DateTime::from_timestamp(1698408000, 0).unwrap();
        driver
            .write(&DataPoint::with_timestamp("cpu", ts).add_field("usage", 1.0))
            .await
            .unwrap();

        let result = driver.query(&Query::new("cpu")).await.unwrap();
        let series = result.as_time_series().unwrap();
        assert_eq!(series.series.len(), 2);
        assert_eq!(series.get("cpu.usage").unwrap().values(), vec![1.0, 2.0]);

        let xport = calls(dir.path()).into_iter().find(|c| c.starts_with("xport")).unwrap();
        assert!(xport.contains(":usage:AVERAGE"));
        assert!(xport.contains(":idle:AVERAGE"));
        assert!(!xport.contains(":value:"));

        let fetched = driver.fetch(&Query::new("cpu").select(["usage"])).await.unwrap();
        assert_eq!(fetched.as_time_series().unwrap().series.len(), 1);
    }

    #[tokio::test]
    async fn test_schema_declares_all_sources() {
        let dir = tempfile::tempdir().unwrap();
        let mut schema = SchemaRegistry::new();
        schema
            .register(
                "cpu",
                MeasurementSchema::new()
                    .field("usage", FieldKind::Float)
                    .field("steal", FieldKind::Float),
            )
            .unwrap();
        let driver = driver(dir.path()).with_schema(schema);

        let point = DataPoint::new("cpu").add_field("usage", 1.0);
        driver.write(&point).await.unwrap();
        assert!(calls(dir.path())[0].contains("DS:steal:GAUGE"));

        let bad = DataPoint::new("cpu").add_field("bogus", 1.0);
        assert!(matches!(driver.write(&bad).await, Err(TimeseriesError::Schema(_))));
    }

    #[tokio::test]
    async fn test_metadata_from_layout() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver(dir.path());
        let ts = DateTime::from_timestamp(1698408000, 0).unwrap();
        for host in ["web01", "web02"] {
            driver
                .write(&DataPoint::with_timestamp("cpu", ts).add_tag("host", host).add_field("usage", 1.0))
                .await
                .unwrap();
        }

        let measurements = driver.metadata(&MetadataQuery::Measurements).await.unwrap();
        assert_eq!(measurements.values, vec!["cpu"]);

        let keys = driver
            .metadata(&MetadataQuery::TagKeys {
                measurement: "cpu".into(),
            })
            .await
            .unwrap();
        assert_eq!(keys.values, vec!["host"]);

        let values = driver
            .metadata(&MetadataQuery::TagValues {
                measurement: "cpu".into(),
                tag: "host".into(),
            })
            .await
            .unwrap();
        assert_eq!(values.values, vec!["web01", "web02"]);

        let fields = driver
            .metadata(&MetadataQuery::FieldKeys {
                measurement: "cpu".into(),
            })
            .await
            .unwrap();
        assert_eq!(fields.values, vec!["usage", "idle"]);
    }

    #[test]
    fn test_rejects_incomplete_config() {
        let config = RrdToolConfig {
            data_dir: String::new(),
            ..RrdToolConfig::default()
        };
        assert!(matches!(
            RrdToolDriver::new(&config),
            Err(TimeseriesError::Configuration(_))
        ));
    }
}
