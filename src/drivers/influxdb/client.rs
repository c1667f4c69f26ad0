//! InfluxDB v2 HTTP client
//!
//! Flux goes to `/api/v2/query` as `application/vnd.flux` and comes back as
//! annotated CSV; line protocol goes to `/api/v2/write`.

use super::annotated_csv::{parse_labels, parse_time_series};
use super::flux::{FluxQuery, FluxQueryKind};
use super::line_protocol::Precision;
use crate::config::InfluxDbConfig;
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::query::{Executor, QueryResult};
use async_trait::async_trait;
use reqwest::{header, Client};
use std::time::Duration;

const DRIVER: &str = "influxdb";

/// InfluxDB REST API client
pub struct InfluxClient {
    client: Client,
    config: InfluxDbConfig,
}

impl InfluxClient {
    /// Create a client; url, org and bucket are required
    pub fn new(config: InfluxDbConfig) -> TimeseriesResult<Self> {
        let missing: Vec<&str> = [
            ("url", config.url.is_empty()),
            ("org", config.org.is_empty()),
            ("bucket", config.bucket.is_empty()),
        ]
        .into_iter()
        .filter_map(|(name, empty)| empty.then_some(name))
        .collect();
        if !missing.is_empty() {
            return Err(TimeseriesError::Configuration(format!(
                "influxdb: missing {}",
                missing.join(", ")
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TimeseriesError::Configuration(format!("influxdb: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &InfluxDbConfig {
        &self.config
    }

    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    pub(crate) fn query_url(&self) -> String {
        format!(
            "{}/api/v2/query?org={}",
            self.base_url(),
            urlencoding::encode(&self.config.org)
        )
    }

    pub(crate) fn write_url(&self, precision: Precision) -> String {
        format!(
            "{}/api/v2/write?org={}&bucket={}&precision={}",
            self.base_url(),
            urlencoding::encode(&self.config.org),
            urlencoding::encode(&self.config.bucket),
            precision.as_str()
        )
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.config.token)
    }

    /// Check if InfluxDB is available
    pub async fn health_check(&self) -> TimeseriesResult<()> {
        let url = format!("{}/health", self.base_url());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TimeseriesError::from_http(DRIVER, &url, e))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TimeseriesError::connection(
                DRIVER,
                format!("health check returned HTTP {}", response.status()),
            ))
        }
    }

    /// POST a Flux script, returning the raw CSV body
    pub async fn query_raw(&self, flux: &str) -> TimeseriesResult<String> {
        let response = self
            .client
            .post(self.query_url())
            .header(header::AUTHORIZATION, self.auth_header())
            .header(header::CONTENT_TYPE, "application/vnd.flux")
            .header(header::ACCEPT, "application/csv")
            .body(flux.to_string())
            .send()
            .await
            .map_err(|e| TimeseriesError::from_http(DRIVER, flux, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TimeseriesError::from_http(DRIVER, flux, e))?;

        if !status.is_success() {
            return Err(TimeseriesError::execution(
                DRIVER,
                flux,
                format!("HTTP {}: {}", status, body.trim()),
            ));
        }
        Ok(body)
    }

    /// POST line protocol
    pub async fn write_lines(&self, lines: &str, precision: Precision) -> TimeseriesResult<()> {
        let response = self
            .client
            .post(self.write_url(precision))
            .header(header::AUTHORIZATION, self.auth_header())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.to_string())
            .send()
            .await
            .map_err(|e| match TimeseriesError::from_http(DRIVER, "write", e) {
                conn @ TimeseriesError::Connection { .. } => conn,
                other => TimeseriesError::Write(other.to_string()),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TimeseriesError::Write(format!("HTTP {}: {}", status, body.trim())))
    }
}

#[async_trait]
impl Executor for InfluxClient {
    type Query = FluxQuery;

    async fn execute(&self, query: &FluxQuery) -> TimeseriesResult<QueryResult> {
        let body = self.query_raw(&query.text).await.map_err(|e| {
            tracing::error!(driver = DRIVER, flux = %query.text, error = %e, "Flux query failed");
            e
        })?;

        let result = match query.kind {
            FluxQueryKind::Data => parse_time_series(&body, &query.value_columns)?
                .with_metadata("backend", DRIVER)
                .with_metadata("query", query.text.clone())
                .into(),
            FluxQueryKind::Labels => parse_labels(&body)?.into(),
        };
        Ok(result)
    }
}
