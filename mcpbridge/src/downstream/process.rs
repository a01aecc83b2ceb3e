//! Downstream MCP server running as a child process, spoken to over its stdin/stdout.
use super::{Downstream, TransportError};
use crate::config::ProcessConfig;
use mcpbridge_jsonrpc::{
    ErrorCode, ErrorObject, FrameError, FrameReader, FrameWriter, Id, Message, Request, Response,
};
use regex::Regex;
use std::process::{ExitStatus, Stdio};
use std::sync::OnceLock;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::*;

/// How long a child gets to exit on its own after its stdin is closed
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// How long to wait for an exit status once the child's stdout has closed
const EXIT_STATUS_WAIT: Duration = Duration::from_millis(200);

/// Decoded messages buffered between the stdout reader task and `exchange`
const STDOUT_BACKLOG: usize = 32;

type Decoded = Result<Message, FrameError>;

pub struct ProcessDownstream {
    name: String,
    child: Child,
    /// Taken for the duration of each write.  `None` afterwards means the session was shut down,
    /// or a write was cut short and the child's stdin was closed with it.
    writer: Option<FrameWriter<ChildStdin>>,
    shut_down: bool,
    /// Fed by a task that owns the child's stdout, so an abandoned `exchange` never leaves a
    /// frame half-read
    messages: mpsc::Receiver<Decoded>,
}

impl std::fmt::Debug for ProcessDownstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDownstream")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

impl ProcessDownstream {
    /// Start the child process.
    ///
    /// The child inherits the bridge's environment plus the configured overrides.  Its stderr is
    /// forwarded to the log.
    #[instrument(skip(config))]
    pub fn spawn(name: String, config: &ProcessConfig) -> Result<Self, TransportError> {
        info!(
            command = %redacted_command_line(config),
            env = ?redact_env(config),
            framing = %config.framing,
            "Spawning downstream process"
        );

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TransportError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Config(
                "child process pipes were not captured".to_string(),
            ));
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.clone(), stderr));
        }

        let (sender, messages) = mpsc::channel(STDOUT_BACKLOG);
        tokio::spawn(read_stdout(
            name.clone(),
            FrameReader::new(BufReader::new(stdout), config.framing),
            sender,
        ));

        debug!(pid = child.id(), "Downstream process started");

        Ok(Self {
            name,
            child,
            writer: Some(FrameWriter::new(stdin, config.framing)),
            shut_down: false,
            messages,
        })
    }

    /// Exit status, if the child has already terminated
    fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if let Some(status) = self.exit_status() {
            return Err(TransportError::Exited { status });
        }
        let Some(mut writer) = self.writer.take() else {
            return Err(if self.shut_down {
                TransportError::Closed
            } else {
                TransportError::Abandoned
            });
        };

        // If this future is dropped mid-write the writer goes with it, closing the child's stdin
        // rather than leaving a partial frame for the next message to be appended to
        if let Err(e) = writer.write_message(message).await {
            // A broken pipe almost always means the child died; report that if we can
            return Err(match self.exit_status() {
                Some(status) => TransportError::Exited { status },
                None => TransportError::Write(e),
            });
        }

        self.writer = Some(writer);
        Ok(())
    }

    /// The error to report when the child's stdout reaches end-of-stream
    async fn closed_error(&mut self) -> TransportError {
        match tokio::time::timeout(EXIT_STATUS_WAIT, self.child.wait()).await {
            Ok(Ok(status)) => TransportError::Exited { status },
            _ => TransportError::Closed,
        }
    }

    /// Refuse a request the child sent us.  The upstream client never sees these, since the
    /// bridge only relays in the client-to-server direction.
    async fn reject_server_request(&mut self, request: Request) -> Result<(), TransportError> {
        warn!(
            downstream = %self.name,
            method = %request.method,
            "Rejecting server-initiated request"
        );
        let response = Response::error(
            request.id,
            ErrorObject::new(
                ErrorCode::MethodNotFound,
                format!(
                    "Unknown method: {} (server-initiated requests are not relayed)",
                    request.method
                ),
            ),
        );
        self.send(&response.into()).await
    }
}

#[async_trait::async_trait]
impl Downstream for ProcessDownstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exchange(&mut self, request: Request) -> Result<Response, TransportError> {
        let id = request.id.clone();
        self.send(&request.into()).await?;

        // Read until the reply to this request shows up.  Anything else the child says in the
        // meantime (log notifications, a late reply to a request that already timed out) is
        // not what we are waiting for.
        loop {
            match self.messages.recv().await {
                Some(Ok(Message::Response(response))) if response.id == id => return Ok(response),
                Some(Ok(Message::Response(Response {
                    id: Id::Null,
                    result: Err(error),
                }))) => {
                    // A server that could not parse a request cannot echo its id.  Only one
                    // request is ever in flight, so the error is ours.
                    debug!(
                        downstream = %self.name,
                        code = error.code,
                        "Downstream answered with a null id"
                    );
                    return Ok(Response::error(id, error));
                }
                Some(Ok(Message::Response(stale))) => {
                    debug!(
                        downstream = %self.name,
                        id = ?stale.id,
                        "Discarding uncorrelated response"
                    );
                }
                Some(Ok(Message::Notification(notification))) => {
                    debug!(
                        downstream = %self.name,
                        method = %notification.method,
                        "Discarding downstream notification"
                    );
                }
                Some(Ok(Message::Request(server_request))) => {
                    self.reject_server_request(server_request).await?;
                }
                Some(Err(FrameError::Io(e))) => return Err(TransportError::Read(e)),
                Some(Err(e)) => return Err(TransportError::BadReply(e.to_string())),
                None => return Err(self.closed_error().await),
            }
        }
    }

    async fn notify(&mut self, message: Message) -> Result<(), TransportError> {
        self.send(&message).await
    }

    #[instrument(skip(self), fields(downstream = %self.name))]
    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.shut_down = true;

        // Closing stdin is the polite way to ask a stdio MCP server to exit
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "Error closing downstream stdin");
            }
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                info!(%status, "Downstream process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(TransportError::Process(e)),
            Err(_) => {
                warn!(
                    grace = ?SHUTDOWN_GRACE,
                    "Downstream process did not exit after stdin closed; killing it"
                );
                self.child.kill().await.map_err(TransportError::Process)
            }
        }
    }
}

/// Decode the child's stdout until it closes, the stream breaks, or the session is dropped
async fn read_stdout(
    name: String,
    mut reader: FrameReader<BufReader<ChildStdout>>,
    sender: mpsc::Sender<Decoded>,
) {
    loop {
        let decoded = match reader.read_message().await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => {
                trace!(downstream = %name, "Downstream stdout closed");
                break;
            }
            Err(e) => Err(e),
        };
        let fatal = matches!(decoded, Err(FrameError::Io(_)));

        if sender.send(decoded).await.is_err() || fatal {
            break;
        }
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(downstream = %name, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(downstream = %name, error = %e, "Stopped reading downstream stderr");
                break;
            }
        }
    }
}

fn sensitive_name() -> &'static Regex {
    static SENSITIVE: OnceLock<Regex> = OnceLock::new();
    SENSITIVE.get_or_init(|| {
        Regex::new(r"(?i)(pass|password|token|secret|key|bearer)")
            .expect("BUG: sensitive name pattern is a valid regex")
    })
}

/// Mask the values of `NAME=value` arguments whose name looks like it holds a credential.
///
/// Handles both bare `NAME=value` arguments and `-e NAME=value` pairs (as passed to
/// `docker run`).  A `-e NAME` with a sensitive name and no value is masked too, since docker
/// will fill it in from the environment.
pub fn redact_args(args: &[String]) -> Vec<String> {
    let mut redacted = args.to_vec();
    let mut i = 0;
    while i < redacted.len() {
        if redacted[i] == "-e" && i + 1 < redacted.len() {
            let pair = &redacted[i + 1];
            let name = pair.split_once('=').map_or(pair.as_str(), |(name, _)| name);
            if sensitive_name().is_match(name) {
                redacted[i + 1] = format!("{name}=***");
            }
            i += 2;
            continue;
        }

        if let Some((name, _)) = redacted[i].split_once('=') {
            if !name.is_empty() && sensitive_name().is_match(name) {
                redacted[i] = format!("{name}=***");
            }
        }
        i += 1;
    }
    redacted
}

fn redacted_command_line(config: &ProcessConfig) -> String {
    std::iter::once(config.command.clone())
        .chain(redact_args(&config.args))
        .collect::<Vec<_>>()
        .join(" ")
}

fn redact_env(config: &ProcessConfig) -> Vec<String> {
    config
        .env
        .iter()
        .map(|(name, value)| {
            if sensitive_name().is_match(name) {
                format!("{name}=***")
            } else {
                format!("{name}={value}")
            }
        })
        .collect()
}
