//! Reading and writing single JSON-RPC messages on a byte stream.
//!
//! Two framings are supported:
//!
//! - [`Framing::ContentLength`]: the LSP-style `Content-Length: <N>\r\n\r\n<N bytes>` framing
//!   that MCP clients use on stdio.  As a convenience the reader also accepts a bare
//!   single-line JSON document in place of a header.
//! - [`Framing::Line`]: one compact JSON document per line.
//!
//! The framing is a fixed property of a channel; a reader or writer never switches between them.
use crate::message::{ErrorObject, Id, InvalidMessage, Message, Response};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::*;

const CONTENT_LENGTH: &[u8] = b"Content-Length:";

/// Upper bound on a declared `Content-Length`.  Anything bigger is treated as a corrupt header
/// rather than an instruction to allocate.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// `Content-Length` header, blank line, then exactly that many bytes of JSON
    ContentLength,

    /// Newline-delimited JSON
    #[default]
    Line,
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Framing::ContentLength => f.write_str("content-length"),
            Framing::Line => f.write_str("line"),
        }
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content-length" | "lsp" => Ok(Framing::ContentLength),
            "line" | "newline" => Ok(Framing::Line),
            other => Err(format!(
                "unknown framing '{other}'; expected 'line' or 'content-length'"
            )),
        }
    }
}

/// Failure to decode one frame.
///
/// Everything except [`FrameError::Io`] leaves the stream positioned at the start of the next
/// frame, so the caller can report the problem and keep reading.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error on frame stream: {0}")]
    Io(#[from] io::Error),

    #[error("malformed frame: {0}")]
    Framing(String),

    #[error("frame is not valid JSON: {0}")]
    Parse(#[source] serde_json::Error),

    #[error(transparent)]
    Invalid(#[from] InvalidMessage),
}

impl FrameError {
    /// Whether the stream can still be read after this error
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }

    /// The JSON-RPC reply owed to the peer for a frame that could not be decoded.
    ///
    /// Framing and JSON errors have no usable id, so they are answered with a null id.  A
    /// message that parsed but is not valid JSON-RPC keeps whatever id could be salvaged.
    pub fn to_response(&self) -> Option<Response> {
        match self {
            FrameError::Io(_) => None,
            FrameError::Framing(detail) => {
                Some(Response::error(Id::Null, ErrorObject::parse_error(detail)))
            }
            FrameError::Parse(e) => Some(Response::error(Id::Null, ErrorObject::parse_error(e))),
            FrameError::Invalid(invalid) => Some(Response::error(
                invalid.id.clone().unwrap_or(Id::Null),
                ErrorObject::invalid_request(&invalid.reason),
            )),
        }
    }
}

/// Encode a message as a complete frame, ready to be written verbatim.
pub fn encode(message: &Message, framing: Framing) -> serde_json::Result<Vec<u8>> {
    let body = message.to_vec()?;
    Ok(frame_body(&body, framing))
}

fn frame_body(body: &[u8], framing: Framing) -> Vec<u8> {
    match framing {
        Framing::ContentLength => {
            let header = format!("Content-Length: {}\r\n\r\n", body.len());
            let mut frame = Vec::with_capacity(header.len() + body.len());
            frame.extend_from_slice(header.as_bytes());
            frame.extend_from_slice(body);
            frame
        }
        Framing::Line => {
            let mut frame = Vec::with_capacity(body.len() + 1);
            frame.extend_from_slice(body);
            frame.push(b'\n');
            frame
        }
    }
}

/// Reads framed messages from a buffered async reader.
pub struct FrameReader<R> {
    reader: R,
    framing: Framing,
    line: Vec<u8>,
}

impl<R> fmt::Debug for FrameReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameReader")
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R, framing: Framing) -> Self {
        Self {
            reader,
            framing,
            line: Vec::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Read and validate the next message.
    ///
    /// Returns `Ok(None)` at a clean end of stream.
    ///
    /// Not cancel safe: dropping the future part way through a frame loses the bytes read so
    /// far.  A reader that has to race a deadline belongs in its own task.
    pub async fn read_message(&mut self) -> Result<Option<Message>, FrameError> {
        let Some(body) = self.read_frame().await? else {
            return Ok(None);
        };

        let value: serde_json::Value = serde_json::from_slice(&body).map_err(FrameError::Parse)?;
        Ok(Some(Message::from_value(value)?))
    }

    /// Read the raw JSON body of the next frame, without parsing it.
    ///
    /// Blank lines between frames are skipped.  Returns `Ok(None)` at a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                trace!("EOF on frame reader");
                return Ok(None);
            }

            let line = self.line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            if self.framing == Framing::ContentLength {
                if let Some(value) = line.strip_prefix(CONTENT_LENGTH) {
                    let length = parse_content_length(value);

                    // Whatever the length header said, the remaining headers have to be consumed
                    // to get back in step with the stream
                    self.skip_headers().await?;

                    return self.read_body(length?).await.map(Some);
                }
            }

            // Either line framing, or the lenient bare-JSON fallback of the content-length
            // framing.  In both cases the line is the whole document.
            return Ok(Some(line.to_vec()));
        }
    }

    /// Consume header lines up to and including the blank separator line
    async fn skip_headers(&mut self) -> Result<(), FrameError> {
        loop {
            self.line.clear();
            if self.reader.read_until(b'\n', &mut self.line).await? == 0 {
                return Err(FrameError::Framing(
                    "stream closed inside a frame header".to_string(),
                ));
            }

            let line = self.line.trim_ascii();
            if line.is_empty() {
                return Ok(());
            }
            trace!(header = %String::from_utf8_lossy(line), "Ignoring frame header");
        }
    }

    async fn read_body(&mut self, length: usize) -> Result<Vec<u8>, FrameError> {
        let mut body = vec![0u8; length];
        match self.reader.read_exact(&mut body).await {
            Ok(_) => Ok(body),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FrameError::Framing(
                format!("stream closed before the {length}-byte body was complete"),
            )),
            Err(e) => Err(FrameError::Io(e)),
        }
    }
}

fn parse_content_length(value: &[u8]) -> Result<usize, FrameError> {
    let text = std::str::from_utf8(value)
        .map_err(|_| FrameError::Framing("Content-Length is not valid UTF-8".to_string()))?
        .trim();
    let length = text
        .parse::<usize>()
        .map_err(|e| FrameError::Framing(format!("invalid Content-Length '{text}': {e}")))?;

    if length > MAX_FRAME_LEN {
        return Err(FrameError::Framing(format!(
            "Content-Length {length} exceeds the {MAX_FRAME_LEN}-byte limit"
        )));
    }

    Ok(length)
}

/// Writes framed messages to an async writer, flushing after each one.
pub struct FrameWriter<W> {
    writer: W,
    framing: Framing,
}

impl<W> fmt::Debug for FrameWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriter")
            .field("framing", &self.framing)
            .finish_non_exhaustive()
    }
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, framing: Framing) -> Self {
        Self { writer, framing }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub async fn write_message(&mut self, message: &Message) -> io::Result<()> {
        let frame = encode(message, self.framing).map_err(io::Error::other)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown().await
    }
}
