//! Bridge configuration.
//!
//! Everything the bridge needs to know about its downstream is gathered into a [`BridgeConfig`]
//! once, at startup, and handed to the adapter constructors.  Nothing on the request path reads
//! the process environment.
use crate::Result;
use anyhow::Context;
use mcpbridge_jsonrpc::Framing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// How long the bridge waits for any downstream to answer one request
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How long a single metrics query may take
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Upper bound on one downstream exchange, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// The downstream server.  May be left out of a config file and supplied on the command line
    /// instead.
    #[serde(default)]
    pub downstream: Option<DownstreamConfig>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            downstream: None,
        }
    }
}

impl BridgeConfig {
    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path.display()))?;
        Self::from_json(&contents)
            .with_context(|| format!("parsing config file '{}'", path.display()))
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.timeout_secs > 0, "timeout_secs must be greater than zero");
        if let Some(DownstreamConfig::Stdio(process)) = &self.downstream {
            anyhow::ensure!(
                !process.command.trim().is_empty(),
                "stdio downstream needs a command"
            );
        }
        Ok(())
    }
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_query_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

/// Which kind of downstream server the bridge relays to
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum DownstreamConfig {
    /// A child process speaking MCP on its stdin/stdout
    Stdio(ProcessConfig),

    /// An MCP server reachable with plain JSON-RPC over HTTP POST
    Http(HttpConfig),

    /// The built-in metrics query server, handled in-process
    Metrics(MetricsConfig),
}

impl DownstreamConfig {
    /// Short human-readable name, used to tag log events
    pub fn name(&self) -> String {
        match self {
            DownstreamConfig::Stdio(process) => Path::new(&process.command)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| process.command.clone()),
            DownstreamConfig::Http(http) => http.url.clone(),
            DownstreamConfig::Metrics(_) => "metrics".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Added to (or overriding) the environment inherited from the bridge
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Framing spoken on the child's pipes
    #[serde(default)]
    pub framing: Framing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpConfig {
    pub url: String,

    /// Static headers sent with every request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Base URL of a Prometheus-compatible query API, e.g. `http://vm:8428/select/0/prometheus/`
    pub endpoint: String,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl MetricsConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
        }
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}
