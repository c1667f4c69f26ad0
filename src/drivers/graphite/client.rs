//! Graphite HTTP client and carbon sender
//!
//! Reads go through graphite-web (`/render`, `/metrics/find`, `/tags`),
//! writes go to carbon as plaintext over TCP or UDP.

use super::compiler::{GraphiteLookup, GraphiteQuery};
use super::parser::{parse_find, parse_render, parse_tag_list};
use crate::config::{GraphiteConfig, GraphiteProtocol};
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::query::{Executor, LabelResult, QueryResult};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

const DRIVER: &str = "graphite";

pub struct GraphiteClient {
    client: Client,
    config: GraphiteConfig,
}

impl GraphiteClient {
    pub fn new(config: GraphiteConfig) -> TimeseriesResult<Self> {
        if config.url.is_empty() {
            return Err(TimeseriesError::Configuration("graphite: missing url".to_string()));
        }
        if config.host.is_empty() || config.port == 0 {
            return Err(TimeseriesError::Configuration(
                "graphite: carbon host and port are required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TimeseriesError::Configuration(format!("graphite: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GraphiteConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    async fn get(&self, path: &str, params: &[(&str, String)], query: &str) -> TimeseriesResult<String> {
        let response = self
            .client
            .get(self.url(path))
            .query(params)
            .send()
            .await
            .map_err(|e| TimeseriesError::from_http(DRIVER, query, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TimeseriesError::from_http(DRIVER, query, e))?;

        if !status.is_success() {
            return Err(TimeseriesError::execution(
                DRIVER,
                query,
                format!("HTTP {}", status),
            ));
        }
        Ok(body)
    }

    pub async fn health_check(&self) -> TimeseriesResult<()> {
        self.get("/metrics/find", &[("query", "*".to_string())], "metrics/find")
            .await
            .map(|_| ())
    }

    /// Raw `/render` body
    pub async fn render(&self, query: &GraphiteQuery) -> TimeseriesResult<String> {
        self.get("/render", &query.params(), &query.target).await
    }

    pub async fn lookup(&self, lookup: &GraphiteLookup) -> TimeseriesResult<LabelResult> {
        match lookup {
            GraphiteLookup::Find(pattern) => {
                let body = self
                    .get("/metrics/find", &[("query", pattern.clone())], pattern)
                    .await?;
                parse_find(&body)
            }
            GraphiteLookup::TagKeys { expr } => {
                let body = self
                    .get("/tags/autoComplete/tags", &[("expr", expr.clone())], expr)
                    .await?;
                let mut result = parse_tag_list(&body)?;
                result.values.retain(|tag| tag != "name");
                Ok(result)
            }
            GraphiteLookup::TagValues { tag, expr } => {
                let params = [("tag", tag.clone()), ("expr", expr.clone())];
                let body = self.get("/tags/autoComplete/values", &params, expr).await?;
                parse_tag_list(&body)
            }
        }
    }

    /// Send newline-terminated plaintext lines to carbon
    pub async fn send_plaintext(&self, payload: &str) -> TimeseriesResult<()> {
        let address = (self.config.host.as_str(), self.config.port);
        let limit = Duration::from_secs(self.config.timeout_secs);

        match self.config.protocol {
            GraphiteProtocol::Tcp => {
                let mut stream = timeout(limit, TcpStream::connect(address))
                    .await
                    .map_err(|_| TimeseriesError::connection(DRIVER, "carbon connect timed out"))?
                    .map_err(|e| TimeseriesError::connection(DRIVER, e))?;
                stream
                    .write_all(payload.as_bytes())
                    .await
                    .map_err(|e| TimeseriesError::Write(format!("carbon: {}", e)))?;
                stream
                    .shutdown()
                    .await
                    .map_err(|e| TimeseriesError::Write(format!("carbon: {}", e)))?;
            }
            GraphiteProtocol::Udp => {
                let socket = UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| TimeseriesError::connection(DRIVER, e))?;
                socket
                    .send_to(payload.as_bytes(), address)
                    .await
                    .map_err(|e| TimeseriesError::Write(format!("carbon: {}", e)))?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for GraphiteClient {
    type Query = GraphiteQuery;

    async fn execute(&self, query: &GraphiteQuery) -> TimeseriesResult<QueryResult> {
        let body = self.render(query).await.map_err(|e| {
            tracing::error!(driver = DRIVER, target = %query.target, error = %e, "Render request failed");
            e
        })?;

        Ok(parse_render(&body)
            .with_metadata("backend", DRIVER)
            .with_metadata("query", query.target.clone())
            .with_metadata("from", query.from.clone())
            .with_metadata("until", query.until.clone())
            .into())
    }
}
