//! Transport adapters for the downstream MCP server.
//!
//! Every adapter offers the same contract: hand it one request, get back exactly one correlated
//! response (or a [`TransportError`]).  The bridge loop only ever talks to a
//! `Box<dyn Downstream>`, so one relay algorithm serves child processes, HTTP endpoints and
//! in-process handlers alike.
use crate::config::{BridgeConfig, DownstreamConfig};
use crate::mcp;
use anyhow::Context;
use mcpbridge_jsonrpc::{Message, Request, Response};
use std::process::ExitStatus;
use std::time::Duration;
use tracing::*;

mod http;
mod in_process;
mod process;

pub use http::HttpDownstream;
pub use in_process::InProcessDownstream;
pub use process::{redact_args, ProcessDownstream};

/// Trait representing a downstream server that requests can be relayed to
#[async_trait::async_trait]
pub trait Downstream: Send {
    /// Short name used to tag log events
    fn name(&self) -> &str;

    /// Send a request and wait for the response that carries the same id
    async fn exchange(&mut self, request: Request) -> Result<Response, TransportError>;

    /// Send a notification (or a client's response to a server request).  Nothing is expected
    /// back.
    async fn notify(&mut self, message: Message) -> Result<(), TransportError>;

    /// Release the downstream session.  Called once, when the bridge stops.
    async fn shutdown(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Errors talking to the downstream server.
///
/// None of these ever reach the upstream client as-is; the bridge turns them into JSON-RPC
/// internal errors carrying the id of the request that failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to start downstream command '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("downstream process has exited ({status})")]
    Exited { status: ExitStatus },

    #[error("downstream closed its output without replying")]
    Closed,

    #[error("downstream stdin was closed after a write was interrupted")]
    Abandoned,

    #[error("failed to write to downstream: {0}")]
    Write(#[source] std::io::Error),

    #[error("failed to read from downstream: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to manage downstream process: {0}")]
    Process(#[source] std::io::Error),

    #[error("downstream reply is not a valid JSON-RPC response: {0}")]
    BadReply(String),

    #[error("HTTP request to downstream failed: {0}")]
    Http(#[source] reqwest::Error),

    #[error("downstream returned HTTP {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("invalid downstream configuration: {0}")]
    Config(String),

    #[error("downstream did not reply within {0:?}")]
    Timeout(Duration),

    #[error("request cancelled because the bridge is shutting down")]
    Cancelled,
}

/// Open the downstream session described by the config.
///
/// This is the only place a downstream is created; failures here are fatal to the bridge.
#[instrument(skip(config), fields(downstream))]
pub fn connect(config: &BridgeConfig) -> crate::Result<Box<dyn Downstream>> {
    let downstream = config
        .downstream
        .as_ref()
        .context("no downstream server configured")?;
    let name = downstream.name();
    Span::current().record("downstream", name.as_str());

    let downstream: Box<dyn Downstream> = match downstream {
        DownstreamConfig::Stdio(process) => Box::new(ProcessDownstream::spawn(name, process)?),
        DownstreamConfig::Http(http) => {
            Box::new(HttpDownstream::new(name, http, config.timeout())?)
        }
        DownstreamConfig::Metrics(metrics) => {
            let router = mcp::metrics_router(metrics).context("configuring metrics server")?;
            Box::new(InProcessDownstream::new(router))
        }
    };

    info!(downstream = downstream.name(), "Downstream ready");
    Ok(downstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsConfig;

    #[tokio::test]
    async fn connect_requires_a_downstream() {
        let err = connect(&BridgeConfig::default()).err().unwrap();
        assert!(err.to_string().contains("no downstream"));
    }

    #[tokio::test]
    async fn connect_reports_spawn_failure() {
        let config = BridgeConfig::from_json(
            r#"{"downstream": {"transport": "stdio", "command": "/nonexistent/mcp-server"}}"#,
        )
        .unwrap();
        let err = connect(&config).err().unwrap();
        assert!(format!("{err:#}").contains("/nonexistent/mcp-server"));
    }

    #[tokio::test]
    async fn connect_builds_in_process_metrics_server() {
        let config = BridgeConfig {
            downstream: Some(DownstreamConfig::Metrics(MetricsConfig::new(
                "http://127.0.0.1:8428/select/0/prometheus/",
            ))),
            ..Default::default()
        };
        let downstream = connect(&config).unwrap();
        assert_eq!(downstream.name(), env!("CARGO_PKG_NAME"));
    }
}
