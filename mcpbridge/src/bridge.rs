//! The relay loop between the upstream MCP client and a [`Downstream`].
//!
//! Strictly one request at a time: a request is read, relayed, and its reply written before the
//! next frame is read, so replies leave in the order requests arrived.  No failure on the
//! downstream side ever escapes the loop; each one becomes a JSON-RPC error reply carrying the
//! id of the request that caused it.
use crate::downstream::{Downstream, TransportError};
use anyhow::Context;
use mcpbridge_jsonrpc::{
    ErrorCode, ErrorObject, FrameReader, FrameWriter, Framing, Message, Request, Response,
};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader, Stdin, Stdout};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// MCP clients talk to stdio servers with `Content-Length` framing.  The reader also accepts
/// bare single-line JSON.
pub const UPSTREAM_FRAMING: Framing = Framing::ContentLength;

pub struct Bridge<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    downstream: Box<dyn Downstream>,
    timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Bridge<BufReader<Stdin>, Stdout> {
    /// Bridge serving the client on this process's stdin/stdout
    pub fn stdio(downstream: Box<dyn Downstream>, timeout: Duration) -> Self {
        Self::new(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            downstream,
            timeout,
        )
    }
}

impl<R, W> Bridge<R, W>
where
    R: AsyncBufRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, downstream: Box<dyn Downstream>, timeout: Duration) -> Self {
        Self {
            reader: FrameReader::new(reader, UPSTREAM_FRAMING),
            writer: FrameWriter::new(writer, UPSTREAM_FRAMING),
            downstream,
            timeout,
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Stop the loop (and abandon any in-flight exchange) when this token is cancelled
    pub fn with_cancellation_token(mut self, cancellation_token: CancellationToken) -> Self {
        self.cancellation_token = cancellation_token;
        self
    }

    /// Relay until the client closes its end, the token is cancelled, or upstream I/O fails.
    ///
    /// The downstream is shut down on the way out in every case.
    #[instrument(skip(self), fields(downstream = self.downstream.name()))]
    pub async fn serve(mut self) -> crate::Result<()> {
        let result = self.run().await;

        if let Err(e) = self.downstream.shutdown().await {
            warn!(error = %e, "Error shutting down downstream");
        }

        result
    }

    async fn run(&mut self) -> crate::Result<()> {
        loop {
            let message = tokio::select! {
                _ = self.cancellation_token.cancelled() => {
                    info!("Cancellation requested; stopping");
                    return Ok(());
                }
                message = self.reader.read_message() => message,
            };

            let reply = match message {
                Ok(Some(Message::Request(request))) => Some(self.relay(request).await),
                Ok(Some(message)) => {
                    self.forward(message).await;
                    None
                }
                Ok(None) => {
                    info!("Upstream client closed its input; stopping");
                    return Ok(());
                }
                Err(e) => match e.to_response() {
                    Some(response) => {
                        warn!(error = %e, "Rejecting malformed frame from upstream");
                        Some(response)
                    }
                    None => {
                        return Err(e).context("reading from upstream client");
                    }
                },
            };

            if let Some(reply) = reply {
                match self.writer.write_message(&reply.into()).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                        info!("Upstream client went away; stopping");
                        return Ok(());
                    }
                    Err(e) => return Err(e).context("writing to upstream client"),
                }
            }
        }
    }

    /// Relay one request and produce the reply owed to the client
    #[instrument(skip(self, request), fields(id = ?request.id, method = %request.method))]
    async fn relay(&mut self, request: Request) -> Response {
        let id = request.id.clone();
        let started = Instant::now();

        let result = tokio::select! {
            _ = self.cancellation_token.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.downstream.exchange(request)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(self.timeout)),
                }
            }
        };

        match result {
            Ok(response) => {
                debug!(
                    elapsed = ?started.elapsed(),
                    is_error = response.is_error(),
                    "Downstream replied"
                );
                response
            }
            Err(e) => {
                error!(elapsed = ?started.elapsed(), error = %e, "Downstream exchange failed");
                Response::error(id, ErrorObject::from_error(ErrorCode::InternalError, &e))
            }
        }
    }

    /// Pass a notification (or a client's response) downstream.  Nothing goes back upstream,
    /// even on failure.
    async fn forward(&mut self, message: Message) {
        let method = message.method().map(str::to_string);
        let result = tokio::select! {
            _ = self.cancellation_token.cancelled() => Err(TransportError::Cancelled),
            result = tokio::time::timeout(self.timeout, self.downstream.notify(message)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::Timeout(self.timeout)),
                }
            }
        };

        if let Err(e) = result {
            warn!(?method, error = %e, "Failed to forward message downstream");
        }
    }
}
