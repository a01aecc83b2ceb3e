//! Downstream MCP server reached by POSTing each JSON-RPC message to a single URL.
use super::{Downstream, TransportError};
use crate::config::HttpConfig;
use mcpbridge_jsonrpc::{Message, Request, Response};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT};
use std::time::Duration;
use tracing::*;

/// Upper bound on how much of an error body is carried into the error message
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug)]
pub struct HttpDownstream {
    name: String,
    url: reqwest::Url,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpDownstream {
    pub fn new(
        name: String,
        config: &HttpConfig,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let url = reqwest::Url::parse(&config.url)
            .map_err(|e| TransportError::Config(format!("invalid URL '{}': {e}", config.url)))?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        for (name, value) in &config.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                TransportError::Config(format!("invalid header name '{name}': {e}"))
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|e| {
                TransportError::Config(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.insert(header_name, header_value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(TransportError::Http)?;

        debug!(%url, header_count = config.headers.len(), "HTTP downstream configured");

        Ok(Self {
            name,
            url,
            client,
            timeout,
        })
    }

    async fn post(&self, message: &Message) -> Result<reqwest::Response, TransportError> {
        let response = self
            .client
            .post(self.url.clone())
            .json(message)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status,
                body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
            });
        }

        Ok(response)
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> TransportError {
        if e.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Http(e)
        }
    }
}

#[async_trait::async_trait]
impl Downstream for HttpDownstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&mut self, request: Request) -> Result<Response, TransportError> {
        let id = request.id.clone();
        let response = self.post(&request.into()).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let value: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| TransportError::BadReply(format!("body is not JSON: {e}")))?;
        match Message::from_value(value) {
            Ok(Message::Response(response)) if response.id == id => Ok(response),
            Ok(Message::Response(response)) => Err(TransportError::BadReply(format!(
                "response id {:?} does not match request id {:?}",
                response.id, id
            ))),
            Ok(other) => Err(TransportError::BadReply(format!(
                "expected a response, got {}",
                other.method().unwrap_or("a message without a method")
            ))),
            Err(e) => Err(TransportError::BadReply(e.to_string())),
        }
    }

    async fn notify(&mut self, message: Message) -> Result<(), TransportError> {
        // Whatever comes back (typically 202 with no body) is of no interest
        self.post(&message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{serve_http, serve_http_never};
    use assert_matches::assert_matches;
    use axum::http::{Method, StatusCode};
    use mcpbridge_jsonrpc::{Id, Notification};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn downstream(base_url: &str, timeout: Duration) -> HttpDownstream {
        let url = format!("{base_url}mcp");
        let config = HttpConfig {
            url: url.clone(),
            headers: BTreeMap::from([("X-Internal-Call".to_string(), "1".to_string())]),
        };
        HttpDownstream::new(url, &config, timeout).unwrap()
    }

    #[tokio::test]
    async fn posts_request_and_returns_response() {
        let server = serve_http(
            StatusCode::OK,
            r#"{"jsonrpc":"2.0","id":1,"result":{"tools":[{"name":"echo"}]}}"#,
        )
        .await;
        let mut downstream = downstream(&server.url, Duration::from_secs(5));

        let response = downstream
            .exchange(Request::new(Id::Number(1), "tools/list", None))
            .await
            .unwrap();
        assert_eq!(response.result, Ok(json!({"tools": [{"name": "echo"}]})));

        let captured = server.only_request();
        assert_eq!(captured.method, Method::POST);
        assert_eq!(captured.path, "/mcp");
        assert_eq!(captured.headers["x-internal-call"], "1");
        assert_eq!(captured.headers["accept"], "application/json");
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&captured.body).unwrap(),
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"})
        );
    }

    #[tokio::test]
    async fn error_status_carries_the_body() {
        let server = serve_http(StatusCode::SERVICE_UNAVAILABLE, "upstream overloaded").await;
        let mut downstream = downstream(&server.url, Duration::from_secs(5));

        let err = downstream
            .exchange(Request::new(Id::Number(1), "tools/list", None))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            TransportError::Status { status, body }
                if status == reqwest::StatusCode::SERVICE_UNAVAILABLE && body == "upstream overloaded"
        );
    }

    #[tokio::test]
    async fn mismatched_id_is_a_bad_reply() {
        let server = serve_http(StatusCode::OK, r#"{"jsonrpc":"2.0","id":2,"result":{}}"#).await;
        let mut downstream = downstream(&server.url, Duration::from_secs(5));

        let err = downstream
            .exchange(Request::new(Id::Number(1), "ping", None))
            .await
            .unwrap_err();
        assert_matches!(err, TransportError::BadReply(reason) if reason.contains("does not match"));
    }

    #[tokio::test]
    async fn non_json_body_is_a_bad_reply() {
        let server = serve_http(StatusCode::OK, "<html>hello</html>").await;
        let mut downstream = downstream(&server.url, Duration::from_secs(5));

        let err = downstream
            .exchange(Request::new(Id::Number(1), "ping", None))
            .await
            .unwrap_err();
        assert_matches!(err, TransportError::BadReply(_));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let (url, _server) = serve_http_never().await;
        let mut downstream = downstream(&url, Duration::from_millis(200));

        let err = downstream
            .exchange(Request::new(Id::Number(1), "ping", None))
            .await
            .unwrap_err();
        assert_matches!(err, TransportError::Timeout(timeout) if timeout == Duration::from_millis(200));
    }

    #[tokio::test]
    async fn notify_ignores_the_body() {
        let server = serve_http(StatusCode::ACCEPTED, "").await;
        let mut downstream = downstream(&server.url, Duration::from_secs(5));

        downstream
            .notify(
                Notification {
                    method: "notifications/initialized".to_string(),
                    params: None,
                }
                .into(),
            )
            .await
            .unwrap();
        assert!(server.only_request().body.contains("notifications/initialized"));
    }

    #[test]
    fn rejects_bad_configuration() {
        let bad_url = HttpConfig {
            url: "not a url".to_string(),
            headers: BTreeMap::new(),
        };
        assert_matches!(
            HttpDownstream::new("x".to_string(), &bad_url, Duration::from_secs(1)),
            Err(TransportError::Config(_))
        );

        let bad_header = HttpConfig {
            url: "http://localhost/mcp".to_string(),
            headers: BTreeMap::from([("Bad Header".to_string(), "v".to_string())]),
        };
        assert_matches!(
            HttpDownstream::new("x".to_string(), &bad_header, Duration::from_secs(1)),
            Err(TransportError::Config(_))
        );
    }
}
