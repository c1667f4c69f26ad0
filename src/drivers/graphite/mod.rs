//! Graphite backend
//!
//! - `compiler`: render targets and schema lookups
//! - `parser`: render/find JSON
//! - `plaintext`: carbon line serialisation
//! - `client`: graphite-web HTTP and carbon sockets

mod client;
mod compiler;
mod parser;
mod plaintext;

pub use client::GraphiteClient;
pub use compiler::{GraphiteCompiler, GraphiteLookup, GraphiteQuery};
pub use parser::{parse_find, parse_render, parse_tag_list};
pub use plaintext::{sanitize_component, to_lines};

use super::{failure_message, BatchFailure, BatchWriteReport, DriverRegistry, TimeSeriesDriver};
use crate::config::Config;
use crate::error::TimeseriesResult;
use crate::point::DataPoint;
use crate::query::{Compiler, CompileResult, Executor, LabelResult, MetadataQuery, Query, QueryResult};
use async_trait::async_trait;

pub const NAME: &str = "graphite";

pub fn register(registry: &mut DriverRegistry) -> TimeseriesResult<()> {
    registry.register(NAME, create)
}

fn create(config: &Config) -> TimeseriesResult<Box<dyn TimeSeriesDriver>> {
    Ok(Box::new(GraphiteDriver::new(config)?))
}

pub struct GraphiteDriver {
    compiler: GraphiteCompiler,
    client: GraphiteClient,
}

impl GraphiteDriver {
    pub fn new(config: &Config) -> TimeseriesResult<Self> {
        let prefix = Some(config.graphite.prefix.clone());
        Ok(Self {
            compiler: GraphiteCompiler::new(prefix),
            client: GraphiteClient::new(config.graphite.clone())?,
        })
    }

    fn prefix(&self) -> Option<&str> {
        Some(self.client.config().prefix.as_str()).filter(|p| !p.is_empty())
    }
}

#[async_trait]
impl TimeSeriesDriver for GraphiteDriver {
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
        let lookup = self.compiler.compile_metadata(request);
        self.client.lookup(&lookup).await
    }

    async fn write(&self, point: &DataPoint) -> TimeseriesResult<()> {
        let mut payload = to_lines(point, self.prefix())?.join("\n");
        payload.push('\n');
        self.client.send_plaintext(&payload).await?;
        tracing::debug!(driver = NAME, measurement = %point.measurement, "Wrote point");
        Ok(())
    }

    /// All serialisable points share one carbon connection
    async fn write_batch(&self, points: &[DataPoint]) -> TimeseriesResult<BatchWriteReport> {
        let mut payload = String::new();
        let mut sent = Vec::new();
        let mut failures = Vec::new();

        for (index, point) in points.iter().enumerate() {
            match to_lines(point, self.prefix()) {
                Ok(lines) => {
                    for line in lines {
                        payload.push_str(&line);
                        payload.push('\n');
                    }
                    sent.push(index);
                }
                Err(e) => failures.push(BatchFailure {
                    index,
                    message: failure_message(&e),
                }),
            }
        }

        if !payload.is_empty() {
            if let Err(e) = self.client.send_plaintext(&payload).await {
                let message = failure_message(&e);
                failures.extend(sent.into_iter().map(|index| BatchFailure {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimeseriesError;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_compile_through_driver() {
        let driver = GraphiteDriver::new(&Config::default()).unwrap();
        assert_eq!(
            driver.compile(&Query::new("cpu").select(["user"])).unwrap(),
            "target=cpu.user&from=-1h&until=now&format=json"
        );
    }

    #[tokio::test]
    async fn test_batch_reports_bad_points() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let mut config = Config::default();
        config.graphite.host = "127.0.0.1".into();
        config.graphite.port = port;
        config.graphite.prefix = "test".into();
        let driver = GraphiteDriver::new(&config).unwrap();

        let ts = chrono::DateTime::from_timestamp(1698408000, 0).unwrap();
        let points = vec![
            DataPoint::with_timestamp("cpu", ts).add_field("user", 1.5),
            DataPoint::with_timestamp("cpu", ts),
        ];
        let report = driver.write_batch(&points).await.unwrap();

        assert_eq!(report.written, 1);
        assert_eq!(report.failures[0].index, 1);
        assert_eq!(server.await.unwrap(), "test.cpu.user 1.5 1698408000\n");
    }

    #[test]
    fn test_tagged_writes_and_path_reads_differ() {
        let ts = chrono::DateTime::from_timestamp(1698408000, 0).unwrap();
        let point = DataPoint::with_timestamp("cpu", ts)
            .add_tag("host", "web01")
            .add_field("usage", 1.5);
        assert_eq!(
            to_lines(&point, None).unwrap(),
            vec!["cpu.usage;host=web01 1.5 1698408000"]
        );

        let read = GraphiteCompiler::new(None)
            .compile(&Query::new("cpu").and_where("host", "=", "web01"))
            .unwrap();
        assert_eq!(read.target, "cpu.web01");

        // the written name `cpu.usage` is matched by the tag lookup
        assert_eq!(
            GraphiteCompiler::new(None).compile_metadata(&MetadataQuery::TagValues {
                measurement: "cpu".into(),
                tag: "host".into(),
            }),
            GraphiteLookup::TagValues {
                tag: "host".into(),
                expr: "name=~^cpu\\.".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_carbon_fails_once() {
        let mut config = Config::default();
        config.graphite.host = "127.0.0.1".into();
        config.graphite.port = 9;
        config.graphite.timeout_secs = 2;
        let driver = GraphiteDriver::new(&config).unwrap();

        let points = vec![
            DataPoint::new("cpu").add_field("user", 1.0),
            DataPoint::new("cpu").add_field("user", 2.0),
        ];
        let err = driver.write_batch(&points).await.unwrap_err();
        assert!(matches!(err, TimeseriesError::Write(_)));
    }
}
