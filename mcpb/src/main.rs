use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mcpbridge::bridge::Bridge;
use mcpbridge::config::{
    BridgeConfig, DownstreamConfig, HttpConfig, MetricsConfig, ProcessConfig,
    DEFAULT_QUERY_TIMEOUT_SECS,
};
use mcpbridge::downstream;
use mcpbridge_jsonrpc::Framing;
use std::path::PathBuf;
use std::process::exit;
use tokio_util::sync::CancellationToken;
use tracing::*;
use tracing_subscriber::{filter::LevelFilter, EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    globals: Globals,

    /// The downstream server.  If omitted, the one in the config file is used.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Globals {
    /// JSON config file describing the downstream server
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Turn debugging information on.  Repeat for more detail.  Logs always go to stderr.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    debug: u8,

    /// Seconds to wait for the downstream to answer a request
    #[arg(long, value_name = "SECS", global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Relay to an MCP server run as a child process, speaking on its stdin/stdout
    Stdio {
        /// Set an environment variable for the child
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
        env: Vec<(String, String)>,

        /// Framing the child speaks on its pipes
        #[arg(long, default_value_t = Framing::Line)]
        framing: Framing,

        /// Program to run, followed by its arguments
        #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Relay to an MCP server that accepts JSON-RPC over HTTP POST
    Http {
        url: String,

        /// Extra header sent with every request
        #[arg(short = 'H', long = "header", value_name = "NAME: VALUE", value_parser = parse_header)]
        headers: Vec<(String, String)>,
    },

    /// Serve the built-in metrics query tool against a Prometheus-compatible API
    Metrics {
        /// Base URL of the query API, e.g. http://vm:8428/select/0/prometheus/
        #[arg(long, env = "VM_INSTANCE_ENTRYPOINT")]
        endpoint: String,

        /// Seconds a single query may take
        #[arg(long, value_name = "SECS", default_value_t = DEFAULT_QUERY_TIMEOUT_SECS)]
        query_timeout: u64,
    },
}

impl Commands {
    fn into_downstream(self) -> anyhow::Result<DownstreamConfig> {
        use Commands::*;
        Ok(match self {
            Stdio {
                env,
                framing,
                command,
            } => {
                let (program, args) = command
                    .split_first()
                    .context("stdio needs a program to run")?;
                DownstreamConfig::Stdio(ProcessConfig {
                    command: program.clone(),
                    args: args.to_vec(),
                    env: env.into_iter().collect(),
                    framing,
                })
            }
            Http { url, headers } => DownstreamConfig::Http(HttpConfig {
                url,
                headers: headers.into_iter().collect(),
            }),
            Metrics {
                endpoint,
                query_timeout,
            } => DownstreamConfig::Metrics(MetricsConfig {
                endpoint,
                query_timeout_secs: query_timeout,
            }),
        })
    }
}

fn parse_key_value(arg: &str) -> Result<(String, String), String> {
    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{arg}'")),
    }
}

fn parse_header(arg: &str) -> Result<(String, String), String> {
    match arg.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected 'Name: value', got '{arg}'")),
    }
}

/// Combine the config file (if any) with the command line.  The command line wins.
fn build_config(cli: Cli) -> anyhow::Result<BridgeConfig> {
    let mut config = match cli.globals.config.as_deref() {
        Some(path) => {
            debug!(path = %path.display(), "Loading config file");
            BridgeConfig::load(path)?
        }
        None => BridgeConfig::default(),
    };

    if let Some(timeout) = cli.globals.timeout {
        config.timeout_secs = timeout;
    }
    if let Some(command) = cli.command {
        config.downstream = Some(command.into_downstream()?);
    }
    if config.downstream.is_none() {
        anyhow::bail!("no downstream server: pass one of the subcommands, or a config file with a 'downstream' section");
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: BridgeConfig) -> anyhow::Result<()> {
    let downstream = downstream::connect(&config)?;

    let cancellation_token = CancellationToken::new();
    tokio::spawn({
        let cancellation_token = cancellation_token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C detected; stopping bridge");
                cancellation_token.cancel();
            }
        }
    });

    Bridge::stdio(downstream, config.timeout())
        .with_cancellation_token(cancellation_token)
        .serve()
        .await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_log_directive = match cli.globals.debug {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // stdout carries the protocol, so logs must only ever go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(default_log_directive.into())
                .from_env_lossy(),
        )
        .json()
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set up logging: {e}");
        exit(1);
    }

    let result = match build_config(cli) {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        exit(1);
    } else {
        debug!("bridge stopped");
    }
}
