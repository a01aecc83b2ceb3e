//! Metrics query tool, backed by a Prometheus-compatible query API (e.g. VictoriaMetrics).
use super::{types, Router, Tool, ToolError};
use crate::config::MetricsConfig;
use anyhow::Context;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::*;

const INSTRUCTIONS: &str = "Query time series with PromQL/MetricsQL using the `query` tool.";

/// Build the in-process server that exposes [`QueryTool`]
pub fn metrics_router(config: &MetricsConfig) -> crate::Result<Router> {
    let router = Router::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .with_instructions(INSTRUCTIONS)
        .with_tool(QueryTool::new(config)?);
    Ok(router)
}

#[derive(Debug, Deserialize)]
struct QueryArguments {
    query: String,
    #[serde(default)]
    time: Option<String>,
}

/// Runs an instant query against `<endpoint>api/v1/query`
#[derive(Debug)]
pub struct QueryTool {
    descriptor: types::Tool,
    client: reqwest::Client,
    query_url: reqwest::Url,
}

impl QueryTool {
    pub fn new(config: &MetricsConfig) -> crate::Result<Self> {
        // `Url::join` replaces the last path segment unless the base ends in a slash
        let mut endpoint = config.endpoint.clone();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let query_url = reqwest::Url::parse(&endpoint)
            .and_then(|base| base.join("api/v1/query"))
            .with_context(|| format!("invalid metrics endpoint '{}'", config.endpoint))?;

        let client = reqwest::Client::builder()
            .timeout(config.query_timeout())
            .build()
            .context("building HTTP client for metrics queries")?;

        Ok(Self {
            descriptor: types::Tool {
                name: "query".to_string(),
                description: Some("Execute VictoriaMetrics query".to_string()),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string", "description": "PromQL/MetricsQL query"},
                        "time": {"type": "string", "description": "Query time (optional)"}
                    },
                    "required": ["query"]
                }),
            },
            client,
            query_url,
        })
    }

    async fn run(&self, arguments: &QueryArguments) -> anyhow::Result<String> {
        let mut params = vec![("query", arguments.query.as_str())];
        // An empty time means "now", which is also what leaving it out means
        if let Some(time) = arguments.time.as_deref().filter(|time| !time.is_empty()) {
            params.push(("time", time));
        }

        let response = self
            .client
            .get(self.query_url.clone())
            .query(&params)
            .send()
            .await?
            .error_for_status()?;
        let body: Value = response.json().await?;

        Ok(serde_json::to_string_pretty(&body)?)
    }
}

#[async_trait::async_trait]
impl Tool for QueryTool {
    fn descriptor(&self) -> &types::Tool {
        &self.descriptor
    }

    #[instrument(skip(self, arguments))]
    async fn call(&self, arguments: Value) -> Result<types::CallToolResult, ToolError> {
        let arguments: QueryArguments = serde_json::from_value(arguments)
            .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
        debug!(query = %arguments.query, time = ?arguments.time, "Running metrics query");

        let text = self.run(&arguments).await.context("Query failed")?;
        Ok(types::CallToolResult::text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{serve_http, serve_http_never};
    use assert_matches::assert_matches;
    use axum::http::{Method, StatusCode};
    use std::time::Duration;

    fn tool(endpoint: &str) -> QueryTool {
        QueryTool::new(&MetricsConfig::new(endpoint)).unwrap()
    }

    #[test]
    fn query_url_tolerates_missing_trailing_slash() {
        assert_eq!(
            tool("http://vm:8428/select/0/prometheus").query_url.as_str(),
            "http://vm:8428/select/0/prometheus/api/v1/query"
        );
        assert_eq!(
            tool("http://vm:8428/select/0/prometheus/").query_url.as_str(),
            "http://vm:8428/select/0/prometheus/api/v1/query"
        );
        assert!(QueryTool::new(&MetricsConfig::new("::not a url::")).is_err());
    }

    #[tokio::test]
    async fn successful_query_is_pretty_printed() {
        let server = serve_http(
            StatusCode::OK,
            r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#,
        )
        .await;

        let result = tool(&format!("{}select/0/prometheus/", server.url))
            .call(json!({"query": "up", "time": "2024-01-01T00:00:00Z"}))
            .await
            .unwrap();

        let types::ContentBlock::Text { text } = &result.content[0];
        assert!(text.contains('\n'), "expected pretty-printed JSON: {text}");
        assert_eq!(
            serde_json::from_str::<Value>(text).unwrap()["status"],
            "success"
        );

        let request = server.only_request();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, "/select/0/prometheus/api/v1/query");
        assert_eq!(
            request.query.as_deref(),
            Some("query=up&time=2024-01-01T00%3A00%3A00Z")
        );
    }

    #[tokio::test]
    async fn empty_time_is_left_out() {
        let server = serve_http(StatusCode::OK, r#"{"status":"success"}"#).await;
        tool(&server.url)
            .call(json!({"query": "up", "time": ""}))
            .await
            .unwrap();

        let request = server.only_request();
        assert_eq!(request.path, "/api/v1/query");
        assert_eq!(request.query.as_deref(), Some("query=up"));
    }

    #[tokio::test]
    async fn missing_query_is_invalid_arguments() {
        let err = tool("http://127.0.0.1:9/").call(json!({})).await.unwrap_err();
        assert_matches!(err, ToolError::InvalidArguments(detail) if detail.contains("query"));
    }

    #[tokio::test]
    async fn http_error_is_a_failure() {
        let server = serve_http(StatusCode::INTERNAL_SERVER_ERROR, "{}").await;
        let err = tool(&server.url).call(json!({"query": "up"})).await.unwrap_err();
        assert_matches!(err, ToolError::Failed(_));
        let message = err.to_string();
        assert!(message.starts_with("Query failed: "), "{message}");
        assert!(message.contains("500"), "{message}");
    }

    #[tokio::test]
    async fn slow_backend_is_a_failure() {
        let (url, _server) = serve_http_never().await;
        let tool = QueryTool::new(&MetricsConfig {
            endpoint: url,
            query_timeout_secs: 1,
        })
        .unwrap();

        let started = tokio::time::Instant::now();
        let err = tool.call(json!({"query": "up"})).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(err.to_string().starts_with("Query failed: "));
    }
}
