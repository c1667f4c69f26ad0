//! Prometheus HTTP API client

use super::parser::{api_error, parse_label_values, parse_query_range};
use super::promql::{PromExpression, PromQuery};
use crate::config::PrometheusConfig;
use crate::error::{TimeseriesError, TimeseriesResult};
use crate::query::{Executor, LabelResult, QueryResult, TimeSeriesResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::try_join_all;
use reqwest::Client;
use std::time::Duration;

const DRIVER: &str = "prometheus";

pub struct PrometheusClient {
    client: Client,
    config: PrometheusConfig,
}

impl PrometheusClient {
    pub fn new(config: PrometheusConfig) -> TimeseriesResult<Self> {
        if config.url.is_empty() {
            return Err(TimeseriesError::Configuration("prometheus: missing url".to_string()));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TimeseriesError::Configuration(format!("prometheus: {}", e)))?;

        Ok(Self { client, config })
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
            let message = api_error(&body).unwrap_or_else(|| format!("HTTP {}", status));
            return Err(TimeseriesError::execution(DRIVER, query, message));
        }
        Ok(body)
    }

    pub async fn health_check(&self) -> TimeseriesResult<()> {
        self.get("/-/healthy", &[], "-/healthy").await.map(|_| ())
    }

    async fn range(
        &self,
        query: &PromQuery,
        expression: &PromExpression,
        now: DateTime<Utc>,
    ) -> TimeseriesResult<TimeSeriesResult> {
        let body = self
            .get("/api/v1/query_range", &query.params(expression, now), &expression.expr)
            .await?;
        parse_query_range(&body, &expression.name)
    }

    /// `/api/v1/label/<label>/values`, optionally restricted by a series selector
    pub async fn label_values(&self, label: &str, selector: Option<&str>) -> TimeseriesResult<LabelResult> {
        let params: Vec<(&str, String)> = selector.map(|s| ("match[]", s.to_string())).into_iter().collect();
        let path = format!("/api/v1/label/{}/values", urlencoding::encode(label));
        let body = self.get(&path, &params, &path).await?;
        parse_label_values(&body)
    }

    /// `/api/v1/labels` for series matching `selector`
    pub async fn label_names(&self, selector: &str) -> TimeseriesResult<LabelResult> {
        let params = [("match[]", selector.to_string())];
        let body = self.get("/api/v1/labels", &params, selector).await?;
        parse_label_values(&body)
    }
}

#[async_trait]
impl Executor for PrometheusClient {
    type Query = PromQuery;

    async fn execute(&self, query: &PromQuery) -> TimeseriesResult<QueryResult> {
        let now = Utc::now();
        let results = try_join_all(
            query
                .expressions
                .iter()
                .map(|expression| self.range(query, expression, now)),
        )
        .await
        .map_err(|e| {
            tracing::error!(driver = DRIVER, query = %query, error = %e, "Prometheus query failed");
            e
        })?;

        let (start, end) = query.bounds(now);
        let series = results.into_iter().flat_map(|r| r.series).collect();
        Ok(TimeSeriesResult::new(series)
            .with_metadata("backend", DRIVER)
            .with_metadata("query", query.to_string())
            .with_metadata("start", start.to_rfc3339())
            .with_metadata("end", end.to_rfc3339())
            .with_metadata("step", query.step.clone())
            .into())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::drivers::prometheus::PromQlCompiler;
    use crate::query::{AggregateFunction, Compiler, Query};
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `body` with `status` to every request; request lines are
    /// recorded in order
    pub(crate) async fn serve(status: u16, body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = requests.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let seen = seen.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    let request = String::from_utf8_lossy(&buf[..n]);
                    if let Some(line) = request.lines().next() {
                        seen.lock().unwrap().push(line.to_string());
                    }
                    let response = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        (address, requests)
    }

    pub(crate) fn client(url: &str) -> PrometheusClient {
        PrometheusClient::new(PrometheusConfig {
            url: url.to_string(),
            ..PrometheusConfig::default()
        })
        .unwrap()
    }

    const MATRIX: &str = r#"{"status":"success","data":{"resultType":"matrix","result":[
        {"metric":{"host":"a"},"values":[[1698404400,"1"],[1698404460,"2"]]}]}}"#;

    #[tokio::test]
    async fn test_range_queries_per_expression() {
        let (url, requests) = serve(200, MATRIX).await;
        let query = Query::new("cpu")
            .interval("5m")
            .group_by("host")
            .aggregate(AggregateFunction::Mean, "usage")
            .aggregate(AggregateFunction::Max, "usage");
        let compiled = PromQlCompiler::default().compile(&query).unwrap();

        let result = client(&url).execute(&compiled).await.unwrap();
        let series = result.as_time_series().unwrap();
        assert_eq!(series.series.len(), 2);
        assert_eq!(series.get("mean_usage").unwrap().values(), vec![1.0, 2.0]);
        assert!(series.get("max_usage").is_some());
        assert_eq!(series.metadata.get("step"), Some(&serde_json::json!("5m")));

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.starts_with("GET /api/v1/query_range?query=")));
        assert!(requests.iter().all(|r| r.contains("step=5m")));
    }

    #[tokio::test]
    async fn test_error_body_is_surfaced() {
        let (url, _) = serve(
            400,
            r#"{"status":"error","errorType":"bad_data","error":"invalid parameter"}"#,
        )
        .await;
        let compiled = PromQlCompiler::default().compile(&Query::new("up")).unwrap();

        let err = client(&url).execute(&compiled).await.unwrap_err();
        assert!(matches!(err, TimeseriesError::Execution { .. }));
        assert!(err.to_string().contains("bad_data: invalid parameter"));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let err = client("http://127.0.0.1:9").health_check().await.unwrap_err();
        assert!(matches!(err, TimeseriesError::Connection { .. }));
    }
}
