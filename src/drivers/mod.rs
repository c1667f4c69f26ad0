//! Backend drivers
//!
//! Each backend module carries its compiler, executor, response parser and
//! write path, and exposes them through one [`TimeSeriesDriver`]:
//! - `influxdb`: Flux over the v2 HTTP API, line protocol writes
//! - `graphite`: render API targets, plaintext carbon writes
//! - `rrdtool`: `xport`/`fetch` commands against local RRD files
//! - `prometheus`: PromQL range queries (read-only)

pub mod graphite;
pub mod influxdb;
pub mod prometheus;
mod registry;
pub mod rrdtool;

pub use registry::{DriverFactory, DriverRegistry};

use crate::error::{TimeseriesError, TimeseriesResult};
use crate::point::DataPoint;
use crate::query::{CompileResult, LabelResult, MetadataQuery, Query, QueryResult};
use async_trait::async_trait;
use serde::Serialize;

/// Common trait for all backends
#[async_trait]
pub trait TimeSeriesDriver: Send + Sync {
    /// Registry name of this driver
    fn name(&self) -> &'static str;

    /// Compiled backend query text, without executing it
    fn compile(&self, query: &Query) -> CompileResult<String>;

    /// Check the backend is reachable
    async fn health_check(&self) -> TimeseriesResult<()>;

    /// Compile and execute a data query
    async fn query(&self, query: &Query) -> TimeseriesResult<QueryResult>;

    /// Schema discovery
    async fn metadata(&self, request: &MetadataQuery) -> TimeseriesResult<LabelResult>;

    async fn write(&self, point: &DataPoint) -> TimeseriesResult<()>;

    /// Write points one by one and collect per-item failures
    async fn write_batch(&self, points: &[DataPoint]) -> TimeseriesResult<BatchWriteReport> {
        let mut failures = Vec::new();
        for (index, point) in points.iter().enumerate() {
            if let Err(e) = self.write(point).await {
                failures.push(BatchFailure {
                    index,
                    message: failure_message(&e),
                });
            }
        }
        BatchWriteReport::from_failures(points.len(), failures)
    }

    /// Release connections and processes
    async fn close(&self) -> TimeseriesResult<()> {
        Ok(())
    }
}

/// Per-item message, without the `Write failed:` prefix so a shared
/// failure is not wrapped twice
pub(crate) fn failure_message(e: &TimeseriesError) -> String {
    match e {
        TimeseriesError::Write(message) => message.clone(),
        other => other.to_string(),
    }
}

/// One failed item of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchFailure {
    pub index: usize,
    pub message: String,
}

/// Outcome of a partially successful batch
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct BatchWriteReport {
    pub written: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchWriteReport {
    /// Build the report, or fail once when every item failed with the
    /// same message
    pub fn from_failures(total: usize, failures: Vec<BatchFailure>) -> TimeseriesResult<Self> {
        if total > 0 && failures.len() == total {
            let first = &failures[0].message;
            if failures.iter().all(|f| &f.message == first) {
                return Err(TimeseriesError::Write(first.clone()));
            }
        }

        Ok(Self {
            written: total - failures.len(),
            failures,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}
