//! Prometheus backend (read-only)
//!
//! - `promql`: query compilation
//! - `parser`: API envelopes, matrix/vector results, label lists
//! - `client`: HTTP API and range-query execution

mod client;
mod parser;
mod promql;

pub use client::PrometheusClient;
pub use parser::{api_error, parse_label_values, parse_query_range};
pub use promql::{metric_name, quote, PromExpression, PromQlCompiler, PromQuery, VALUE_FIELD};

use super::{DriverRegistry, TimeSeriesDriver};
use crate::config::Config;
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::point::DataPoint;
use crate::query::{
    Compiler, CompileResult, Executor, LabelResult, MetadataQuery, Query, QueryResult,
    RelativeDuration,
};
use async_trait::async_trait;

pub const NAME: &str = "prometheus";

const NAME_LABEL: &str = "__name__";

pub fn register(registry: &mut DriverRegistry) -> TimeseriesResult<()> {
    registry.register(NAME, create)
}

fn create(config: &Config) -> TimeseriesResult<Box<dyn TimeSeriesDriver>> {
    Ok(Box::new(PrometheusDriver::new(config)?))
}

pub struct PrometheusDriver {
    compiler: PromQlCompiler,
    client: PrometheusClient,
}

impl PrometheusDriver {
    pub fn new(config: &Config) -> TimeseriesResult<Self> {
        let step = &config.prometheus.default_step;
        RelativeDuration::parse(step).map_err(|e| {
            TimeseriesError::Configuration(format!("prometheus: default_step: {}", e))
        })?;

        Ok(Self {
            compiler: PromQlCompiler::new(step.clone()),
            client: PrometheusClient::new(config.prometheus.clone())?,
        })
    }

    /// Series selector matching `measurement` and its `measurement_<field>` metrics
    fn field_selector(measurement: &str) -> String {
        format!(
            "{{{}=~{}}}",
            NAME_LABEL,
            quote(&format!("{}(_.+)?", regex::escape(measurement)))
        )
    }
}

#[async_trait]
impl TimeSeriesDriver for PrometheusDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn compile(&self, query: &Query) -> CompileResult<String> {
        Ok(self.compiler.compile(query)?.to_string())
    }

    async fn health_check(&self) -> TimeseriesResult<()> {
        self.client.health_check().await
    }

    async fn query(&self, query: &Query) -> TimeseriesResult<QueryResult> {
        let compiled = self.compiler.compile(query)?;
        self.client.execute(&compiled).await
    }

    async fn metadata(&self, request: &MetadataQuery) -> TimeseriesResult<LabelResult> {
        match request {
            MetadataQuery::Measurements => self.client.label_values(NAME_LABEL, None).await,
            MetadataQuery::TagKeys { measurement } => {
                let mut result = self.client.label_names(measurement).await?;
                result.values.retain(|label| label != NAME_LABEL);
                Ok(result)
            }
            MetadataQuery::TagValues { measurement, tag } => {
                self.client.label_values(tag, Some(measurement)).await
            }
            MetadataQuery::FieldKeys { measurement } => {
                let selector = Self::field_selector(measurement);
                let metrics = self.client.label_values(NAME_LABEL, Some(&selector)).await?;
                let prefix = format!("{}_", measurement);
                let fields = metrics
                    .values
                    .iter()
                    .filter_map(|metric| {
                        if metric == measurement {
                            Some(VALUE_FIELD.to_string())
                        } else {
                            metric.strip_prefix(&prefix).map(str::to_string)
                        }
                    })
                    .collect();
                Ok(LabelResult::new(fields))
            }
        }
    }

    async fn write(&self, point: &DataPoint) -> TimeseriesResult<()> {
        Err(TimeseriesError::Write(format!(
            "prometheus is read-only, cannot write '{}'",
            point.measurement
        )))
    }
}
