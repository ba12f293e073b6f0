//! Worker output line protocol.
//!
//! Workers write newline-delimited UTF-8 to stdout. Each line is either a JSON
//! object (a [`StructuredEvent`], normally carrying `type` and `timestamp`) or
//! arbitrary text that is relayed as a raw output line.
//!
//! [`LineParser`] reassembles lines from arbitrarily split chunks: bytes after
//! the last `\n` stay buffered until a later chunk completes them, including
//! UTF-8 sequences split across chunk boundaries.
//!
//! Input to the worker goes the other way through [`write_line`], always one
//! newline-terminated frame per message.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// A successfully parsed JSON object line from a worker.
///
/// Fields other than `type` and `timestamp` are opaque and forwarded as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StructuredEvent(Map<String, Value>);

impl StructuredEvent {
    /// Wrap an already parsed JSON object.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// The `type` field, if present and a string.
    pub fn kind(&self) -> Option<&str> {
        self.0.get("type").and_then(Value::as_str)
    }

    /// The `timestamp` field in epoch milliseconds, if present.
    pub fn timestamp(&self) -> Option<i64> {
        self.0.get("timestamp").and_then(Value::as_i64)
    }

    /// Look up an arbitrary field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// One complete line of worker output after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// The line was a JSON object.
    Event(StructuredEvent),
    /// The line was anything else; kept verbatim (trimmed).
    Raw(String),
}

/// Classify a single trimmed, non-empty line.
///
/// Parse failures are not errors: the line is downgraded to raw output. JSON
/// values that are not objects (`42`, `"text"`, `[1]`) are raw output too.
pub fn classify_line(line: &str) -> ParsedLine {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(fields)) => ParsedLine::Event(StructuredEvent(fields)),
        _ => ParsedLine::Raw(line.to_string()),
    }
}

/// Incremental reassembler for newline-delimited worker output.
#[derive(Debug, Default)]
pub struct LineParser {
    buf: Vec<u8>,
}

impl LineParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed, in order.
    ///
    /// Empty and whitespace-only lines are discarded silently.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ParsedLine> {
        self.buf.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            let text = String::from_utf8_lossy(&self.buf[start..end]);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(classify_line(trimmed));
            }
            start = end + 1;
        }
        self.buf.drain(..start);
        lines
    }

    /// Number of buffered bytes belonging to an incomplete trailing line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Drop any incomplete trailing fragment.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Render an outbound message for the worker's stdin.
///
/// A JSON string is written verbatim; any other value is JSON-encoded.
pub fn encode_message(message: &Value) -> Result<String, serde_json::Error> {
    match message {
        Value::String(s) => Ok(s.clone()),
        other => serde_json::to_string(other),
    }
}

/// Write one newline-terminated frame and flush.
///
/// # Errors
///
/// Returns an I/O error if writing or flushing fails.
pub async fn write_line<W: AsyncWrite + Unpin + ?Sized>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}
