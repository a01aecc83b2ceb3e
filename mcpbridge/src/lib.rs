//! Relay JSON-RPC (MCP) traffic between a client on stdin/stdout and a downstream server that
//! is a child process, an HTTP endpoint, or an in-process handler.
pub mod bridge;
pub mod config;
pub mod downstream;
pub mod mcp;

mod error;

pub use error::Result;

#[cfg(test)]
pub mod test_helpers {
    use axum::extract::{RawQuery, State};
    use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
    use axum::response::IntoResponse;
    use std::sync::{Arc, Mutex, OnceLock};
    use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

    static TRACING: OnceLock<()> = OnceLock::new();

    /// Initialize tracing for tests with a stdout subscriber.
    /// Safe to call multiple times - will only initialize once.
    pub fn init_test_logging() {
        TRACING.get_or_init(|| {
            let filter = std::env::var("RUST_LOG")
                .map(EnvFilter::new)
                .unwrap_or_else(|_| EnvFilter::new("debug"));

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_span_events(FmtSpan::CLOSE)
                .with_test_writer()
                .try_init()
                .ok();
        });
    }

    /// One HTTP request as seen by a [`MockHttp`] server
    #[derive(Clone, Debug)]
    pub struct CapturedRequest {
        pub method: Method,
        pub path: String,
        pub query: Option<String>,
        pub headers: HeaderMap,
        pub body: String,
    }

    #[derive(Clone)]
    struct MockState {
        status: StatusCode,
        body: &'static str,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
    }

    /// HTTP server on a loopback port that answers every request with the same canned reply
    pub struct MockHttp {
        /// Base URL, `http://127.0.0.1:<port>/`
        pub url: String,
        requests: Arc<Mutex<Vec<CapturedRequest>>>,
        _task: tokio::task::JoinHandle<()>,
    }

    impl MockHttp {
        /// Requests received so far, oldest first
        pub fn requests(&self) -> Vec<CapturedRequest> {
            self.requests.lock().unwrap().clone()
        }

        /// The one request received so far
        pub fn only_request(&self) -> CapturedRequest {
            let requests = self.requests();
            assert_eq!(requests.len(), 1, "expected exactly one request");
            requests[0].clone()
        }
    }

    async fn capture(
        State(st): State<MockState>,
        method: Method,
        uri: Uri,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
        body: String,
    ) -> impl IntoResponse {
        st.requests.lock().unwrap().push(CapturedRequest {
            method,
            path: uri.path().to_string(),
            query,
            headers,
            body,
        });
        (st.status, [(header::CONTENT_TYPE, "application/json")], st.body)
    }

    async fn never_answer() -> StatusCode {
        std::future::pending().await
    }

    async fn serve(app: axum::Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/"), task)
    }

    /// Answer every request, whatever its method or path, with `status` and a JSON `body`
    pub async fn serve_http(status: StatusCode, body: &'static str) -> MockHttp {
        let state = MockState {
            status,
            body,
            requests: Arc::new(Mutex::new(Vec::new())),
        };
        let requests = state.requests.clone();
        let (url, task) = serve(axum::Router::new().fallback(capture).with_state(state)).await;
        MockHttp {
            url,
            requests,
            _task: task,
        }
    }

    /// Accept requests and never answer them.  Returns the base URL and the server task.
    pub async fn serve_http_never() -> (String, tokio::task::JoinHandle<()>) {
        serve(axum::Router::new().fallback(never_answer)).await
    }
}
