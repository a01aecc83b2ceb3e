//! A small in-process MCP server: method dispatch plus a registry of tools.
use mcpbridge_jsonrpc::{ErrorCode, ErrorObject, Notification, Request, Response};
use serde_json::{json, Value};
use std::fmt;
use tracing::*;

mod metrics;
pub mod types;

pub use metrics::{metrics_router, QueryTool};

/// MCP protocol revision this server implements
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// A callable tool exposed through `tools/call`
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Name, description and argument schema, as advertised by `tools/list`
    fn descriptor(&self) -> &types::Tool;

    async fn call(&self, arguments: Value) -> Result<types::CallToolResult, ToolError>;
}

/// Why a tool call failed.  Tools never panic or bubble errors past the router; everything ends
/// up as one of these.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The arguments don't match the tool's input schema
    #[error("{0}")]
    InvalidArguments(String),

    /// The tool ran and failed.  The message is the full error chain.
    #[error("{0:#}")]
    Failed(#[from] anyhow::Error),
}

impl ToolError {
    fn into_error_object(self) -> ErrorObject {
        match self {
            ToolError::InvalidArguments(detail) => ErrorObject::invalid_params(detail),
            e @ ToolError::Failed(_) => ErrorObject::internal(e.to_string()),
        }
    }
}

/// Dispatches requests to the handful of MCP methods the in-process server understands.
pub struct Router {
    info: types::Implementation,
    instructions: Option<String>,
    tools: Vec<Box<dyn Tool>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("info", &self.info)
            .field(
                "tools",
                &self
                    .tools
                    .iter()
                    .map(|tool| tool.descriptor().name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Router {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            info: types::Implementation {
                name: name.into(),
                version: version.into(),
            },
            instructions: None,
            tools: Vec::new(),
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a tool.  Tools are listed in the order they are added.
    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Box::new(tool));
        self
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    /// Answer one request.  Every outcome, including failures, is a response carrying the
    /// request's id.
    #[instrument(skip(self, request), fields(id = ?request.id, method = %request.method))]
    pub async fn handle_request(&self, request: Request) -> Response {
        let Request { id, method, params } = request;
        match self.dispatch(&method, params).await {
            Ok(result) => Response::success(id, result),
            Err(error) => {
                debug!(code = error.code, message = %error.message, "Request failed");
                Response::error(id, error)
            }
        }
    }

    pub fn handle_notification(&self, notification: &Notification) {
        if notification.method.starts_with("notifications/") {
            debug!(method = %notification.method, "Received notification");
        } else {
            warn!(method = %notification.method, "Ignoring unexpected notification");
        }
    }

    async fn dispatch(&self, method: &str, params: Option<Value>) -> Result<Value, ErrorObject> {
        match method {
            "ping" => Ok(json!({})),
            "initialize" => {
                let params = params
                    .map(serde_json::from_value::<types::InitializeParams>)
                    .transpose()
                    .map_err(ErrorObject::invalid_params)?
                    .unwrap_or_default();
                debug!(?params, "Received initialize request");
                to_value(&types::InitializeResult {
                    protocol_version: PROTOCOL_VERSION.to_string(),
                    capabilities: types::ServerCapabilities {
                        tools: Some(types::ServerCapabilitiesTools::default()),
                    },
                    server_info: self.info.clone(),
                    instructions: self.instructions.clone(),
                })
            }
            "tools/list" => to_value(&types::ListToolsResult {
                tools: self
                    .tools
                    .iter()
                    .map(|tool| tool.descriptor().clone())
                    .collect(),
            }),
            "tools/call" => {
                let params = params.ok_or_else(|| ErrorObject::invalid_params("missing params"))?;
                let types::CallToolParams { name, arguments } =
                    serde_json::from_value(params).map_err(ErrorObject::invalid_params)?;
                let tool = self
                    .tools
                    .iter()
                    .find(|tool| tool.descriptor().name == name)
                    .ok_or_else(|| {
                        ErrorObject::new(ErrorCode::MethodNotFound, format!("Unknown tool: {name}"))
                    })?;

                let arguments = arguments.unwrap_or_else(|| json!({}));
                let result = tool
                    .call(arguments)
                    .await
                    .map_err(ToolError::into_error_object)?;
                to_value(&result)
            }
            _ => Err(ErrorObject::new(
                ErrorCode::MethodNotFound,
                format!("Unknown method: {method}"),
            )),
        }
    }
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, ErrorObject> {
    serde_json::to_value(value).map_err(|e| ErrorObject::from_error(ErrorCode::InternalError, &e))
}
