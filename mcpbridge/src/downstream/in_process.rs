use super::{Downstream, TransportError};
use crate::mcp::Router;
use mcpbridge_jsonrpc::{Message, Request, Response};
use tracing::*;

/// A downstream server that lives in the bridge's own process.
///
/// Requests are dispatched straight into a [`Router`]; no bytes are framed on the way.  The
/// router answers every request itself, so this adapter never fails.
#[derive(Debug)]
pub struct InProcessDownstream {
    router: Router,
}

impl InProcessDownstream {
    pub fn new(router: Router) -> Self {
        Self { router }
    }
}

#[async_trait::async_trait]
impl Downstream for InProcessDownstream {
    fn name(&self) -> &str {
        self.router.name()
    }

    async fn exchange(&mut self, request: Request) -> Result<Response, TransportError> {
        Ok(self.router.handle_request(request).await)
    }

    async fn notify(&mut self, message: Message) -> Result<(), TransportError> {
        match message {
            Message::Notification(notification) => {
                self.router.handle_notification(&notification);
            }
            Message::Response(response) => {
                debug!(id = ?response.id, "Ignoring response; this server never sends requests");
            }
            Message::Request(request) => {
                // Requests are owed a reply and only `exchange` can deliver one
                warn!(
                    id = ?request.id,
                    method = %request.method,
                    "Dropping request passed as a notification"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{self, types::CallToolResult};
    use mcpbridge_jsonrpc::{ErrorCode, Id, Notification};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn relays_into_router() {
        let mut downstream = InProcessDownstream::new(Router::new("test-server", "0.0.1"));
        assert_eq!(downstream.name(), "test-server");

        let response = downstream
            .exchange(Request::new(Id::Number(7), "tools/list", None))
            .await
            .unwrap();
        assert_eq!(response, Response::success(Id::Number(7), json!({"tools": []})));

        let response = downstream
            .exchange(Request::new(Id::Number(8), "resources/list", None))
            .await
            .unwrap();
        assert_eq!(
            response.result.unwrap_err().code,
            ErrorCode::MethodNotFound.code()
        );
    }

    /// Counts its calls, to show which paths actually run a tool
    struct Counting(mcp::types::Tool, Arc<AtomicUsize>);

    #[async_trait::async_trait]
    impl mcp::Tool for Counting {
        fn descriptor(&self) -> &mcp::types::Tool {
            &self.0
        }

        async fn call(&self, _arguments: Value) -> Result<CallToolResult, mcp::ToolError> {
            self.1.fetch_add(1, Ordering::SeqCst);
            Ok(CallToolResult::text("counted"))
        }
    }

    #[tokio::test]
    async fn requests_sent_as_notifications_are_not_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let tool = Counting(
            mcp::types::Tool {
                name: "count".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
            calls.clone(),
        );
        let mut downstream =
            InProcessDownstream::new(Router::new("test-server", "0.0.1").with_tool(tool));
        let call = || Request::new(Id::Number(1), "tools/call", json!({"name": "count"}));

        downstream.notify(call().into()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        downstream.exchange(call()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn notifications_are_accepted() {
        let mut downstream = InProcessDownstream::new(Router::new("test-server", "0.0.1"));
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
    }
}
