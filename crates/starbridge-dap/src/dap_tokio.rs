//! DAP transport: `Content-Length` framed JSON, the one request shape the
//! adapter reads, and the responses and events it writes back.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Maximum accepted `Content-Length`.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dap protocol error: {0}")]
    Protocol(String),
}

pub type Result<T> = std::result::Result<T, DapError>;

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub seq: i64,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Answer to one [`Request`]. An `Err` outcome is sent as `success: false`
/// with the text as `message`.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub request_seq: i64,
    pub command: String,
    pub outcome: std::result::Result<Option<Value>, String>,
}

impl Response {
    pub fn to(request: &Request, outcome: std::result::Result<Option<Value>, String>) -> Self {
        Self {
            request_seq: request.seq,
            command: request.command.clone(),
            outcome,
        }
    }
}

/// The events this adapter emits.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "body", rename_all = "camelCase")]
pub enum Event {
    Initialized,
    Stopped(StoppedEvent),
    Continued(ContinuedEvent),
    Output(OutputEvent),
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoppedEvent {
    pub reason: &'static str,
    pub thread_id: i64,
    pub all_threads_stopped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuedEvent {
    pub thread_id: i64,
    pub all_threads_continued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputCategory {
    /// Adapter notices.
    Console,
    /// Anything the Bazel process printed.
    Stdout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputEvent {
    pub category: OutputCategory,
    pub output: String,
}

impl OutputEvent {
    /// One line of output; the trailing newline is added here.
    pub fn line(category: OutputCategory, line: impl AsRef<str>) -> Self {
        Self {
            category,
            output: format!("{}\n", line.as_ref()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Response(Response),
    Event(Event),
}

impl Outgoing {
    /// The wire form of this message under sequence number `seq`.
    pub fn to_json(&self, seq: i64) -> serde_json::Result<Value> {
        match self {
            Outgoing::Response(response) => {
                let mut value = json!({
                    "seq": seq,
                    "type": "response",
                    "request_seq": response.request_seq,
                    "command": response.command,
                    "success": response.outcome.is_ok(),
                });
                match &response.outcome {
                    Ok(Some(body)) => value["body"] = body.clone(),
                    Ok(None) => {}
                    Err(message) => value["message"] = json!(message),
                }
                Ok(value)
            }
            Outgoing::Event(event) => {
                let mut value = serde_json::to_value(event)?;
                value["seq"] = json!(seq);
                value["type"] = json!("event");
                Ok(value)
            }
        }
    }
}

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    /// Read one framed JSON message; `None` at end of stream.
    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let Some(len) = self.read_header().await? else {
            return Ok(None);
        };
        let mut body = vec![0u8; len];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Next `request` message. Responses and events from the client are
    /// skipped.
    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        while let Some(value) = self.read_value().await? {
            if value.get("type").and_then(Value::as_str) == Some("request") {
                return Ok(Some(serde_json::from_value(value)?));
            }
            tracing::debug!(target: "starbridge.dap", message = %value, "ignoring non-request message");
        }
        Ok(None)
    }

    /// Consume a header block and return its `Content-Length`.
    async fn read_header(&mut self) -> Result<Option<usize>> {
        let mut content_length = None;
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.reader.read_until(b'\n', &mut line).await? == 0 {
                return Ok(None);
            }
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some(len) = content_length_of(line)? {
                content_length = Some(len);
            }
        }

        match content_length {
            None => Err(DapError::Protocol(format!("missing {CONTENT_LENGTH} header"))),
            Some(len) if len > MAX_DAP_MESSAGE_BYTES => Err(DapError::Protocol(format!(
                "{CONTENT_LENGTH} {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            ))),
            Some(len) => Ok(Some(len)),
        }
    }
}

/// `Some(n)` for a `Content-Length: n` line; other headers are ignored.
fn content_length_of(line: &str) -> Result<Option<usize>> {
    let Some((name, value)) = line.split_once(':') else {
        return Ok(None);
    };
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    let value = value.trim();
    value
        .parse()
        .map(Some)
        .map_err(|err| DapError::Protocol(format!("invalid {CONTENT_LENGTH} {value:?}: {err}")))
}

/// Frames messages onto the client stream and stamps outgoing ones with
/// consecutive sequence numbers, starting at 1.
pub struct DapWriter<W> {
    writer: W,
    next_seq: i64,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            next_seq: 1,
        }
    }

    pub async fn send(&mut self, message: &Outgoing) -> Result<()> {
        let value = message.to_json(self.next_seq)?;
        self.next_seq += 1;
        self.write_value(&value).await
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        let header = format!("{CONTENT_LENGTH}: {}\r\n\r\n", body.len());
        self.writer.write_all(header.as_bytes()).await?;
        self.writer.write_all(&body).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
