//! InfluxDB 2.x backend
//!
//! - `flux`: query compilation
//! - `annotated_csv`: query responses
//! - `line_protocol`: write serialisation
//! - `client`: HTTP transport and executor

mod client;
mod annotated_csv;
mod flux;
mod line_protocol;

pub use client::InfluxClient;
pub use annotated_csv::{parse_labels, parse_time_series};
pub use flux::{FluxCompiler, FluxQuery, FluxQueryKind, ValueColumn};
pub use line_protocol::{escape_key, escape_measurement, to_line, Precision};

use super::{failure_message, BatchFailure, BatchWriteReport, DriverRegistry, TimeSeriesDriver};
use crate::config::Config;
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::point::DataPoint;
use crate::query::{Compiler, CompileResult, Executor, LabelResult, MetadataQuery, Query, QueryResult};
use async_trait::async_trait;

pub const NAME: &str = "influxdb";

/// Add the InfluxDB factory to a registry
pub fn register(registry: &mut DriverRegistry) -> TimeseriesResult<()> {
    registry.register(NAME, create)
}

fn create(config: &Config) -> TimeseriesResult<Box<dyn TimeSeriesDriver>> {
    Ok(Box::new(InfluxDbDriver::new(config)?))
}

/// Flux compiler and HTTP client for one bucket
pub struct InfluxDbDriver {
    compiler: FluxCompiler,
    client: InfluxClient,
    precision: Precision,
}

impl InfluxDbDriver {
    pub fn new(config: &Config) -> TimeseriesResult<Self> {
        let client = InfluxClient::new(config.influxdb.clone())?;
        Ok(Self {
            compiler: FluxCompiler::new(config.influxdb.bucket.clone()),
            precision: config.influxdb.precision,
            client,
        })
    }
}

#[async_trait]
impl TimeSeriesDriver for InfluxDbDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compile(&self, query: &Query) -> CompileResult<String> {
        Ok(self.compiler.compile(query)?.text)
    }

    async fn health_check(&self) -> TimeseriesResult<()> {
        self.client.health_check().await
    }

    async fn query(&self, query: &Query) -> TimeseriesResult<QueryResult> {
        let flux = self.compiler.compile(query)?;
        self.client.execute(&flux).await
    }

    async fn metadata(&self, request: &MetadataQuery) -> TimeseriesResult<LabelResult> {
        let flux = self.compiler.compile_metadata(request);
        let result = self.client.execute(&flux).await?;
        result
            .into_labels()
            .ok_or_else(|| TimeseriesError::response(NAME, "schema query returned time series"))
    }

    async fn write(&self, point: &DataPoint) -> TimeseriesResult<()> {
        let line = to_line(point, self.precision)?;
        self.client.write_lines(&line, self.precision).await?;
        tracing::debug!(driver = NAME, measurement = %point.measurement, "Wrote point");
        Ok(())
    }

    /// One request for the whole batch; points that cannot be serialised
    /// are reported individually
    async fn write_batch(&self, points: &[DataPoint]) -> TimeseriesResult<BatchWriteReport> {
        let mut lines = Vec::with_capacity(points.len());
        let mut indices = Vec::with_capacity(points.len());
        let mut failures = Vec::new();

        for (index, point) in points.iter().enumerate() {
            match to_line(point, self.precision) {
                Ok(line) => {
                    lines.push(line);
                    indices.push(index);
                }
                Err(e) => failures.push(BatchFailure {
                    index,
                    message: failure_message(&e),
                }),
            }
        }

        if !lines.is_empty() {
            if let Err(e) = self.client.write_lines(&lines.join("\n"), self.precision).await {
                let message = failure_message(&e);
                failures.extend(indices.into_iter().map(|index| BatchFailure {
                    index,
                    message: message.clone(),
                }));
                failures.sort_by_key(|f| f.index);
            }
        }

        tracing::debug!(
            driver = NAME,
            points = points.len(),
            failed = failures.len(),
            "Wrote batch"
        );
        BatchWriteReport::from_failures(points.len(), failures)
    }
}
