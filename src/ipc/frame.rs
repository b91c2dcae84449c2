//! Line codec for the worker wire protocol.
//!
//! Every message is one newline-terminated line:
//! ```text
//! data line       <opaque bytes>\n
//! control frame   J$<COMMAND>:<PAYLOAD>\n      COMMAND contains no ':'
//! result frame    J$_JITSU_RESULT:<PAYLOAD>\n  ends the exchange
//! ```
//! Host-callback responses travel back to the worker as a single JSON line
//! `{"command": ..., "payload": ...}`.

use serde::Serialize;
use std::borrow::Cow;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt};

use crate::types::Result;

/// Two-byte prefix marking a control frame.
pub const CONTROL_MARKER: &[u8] = b"J$";
/// Command name of the frame that ends an exchange.
pub const RESULT_COMMAND: &str = "_JITSU_RESULT";

/// One line received from the worker, trailing newline stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame<'a> {
    /// Plain output, forwarded to the listener.
    Data(&'a [u8]),
    /// `J$<command>:<payload>`.
    Control {
        command: Cow<'a, str>,
        payload: &'a [u8],
    },
    /// Nothing but a line terminator.
    Empty,
}

impl Frame<'_> {
    pub fn is_result(&self) -> bool {
        matches!(self, Frame::Control { command, .. } if command == RESULT_COMMAND)
    }
}

/// Classify one raw line. A control frame without a colon carries an
/// empty payload.
pub fn parse_line(line: &[u8]) -> Frame<'_> {
    let line = trim_newline(line);
    if line.is_empty() {
        return Frame::Empty;
    }
    let Some(body) = line.strip_prefix(CONTROL_MARKER) else {
        return Frame::Data(line);
    };
    let (command, payload) = match body.iter().position(|&b| b == b':') {
        Some(colon) => (&body[..colon], &body[colon + 1..]),
        None => (body, &body[body.len()..]),
    };
    Frame::Control {
        command: String::from_utf8_lossy(command),
        payload,
    }
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Outcome of [`read_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRead {
    /// A line (or a final unterminated fragment) was appended to the buffer.
    Line(usize),
    /// Clean end of stream with nothing buffered.
    Eof,
    /// The line exceeded `max_line_bytes`; the buffer holds a truncated prefix.
    TooLong,
}

/// Read one newline-terminated line into `buf`, refusing to buffer more than
/// `max_line_bytes`.
///
/// Not cancel-safe: bytes consumed before cancellation are lost.
pub async fn read_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_line_bytes: usize,
) -> std::io::Result<LineRead> {
    let mut total = 0usize;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if total == 0 { LineRead::Eof } else { LineRead::Line(total) });
        }

        let (complete, used) = match available.iter().position(|&b| b == b'\n') {
            Some(newline) => (true, newline + 1),
            None => (false, available.len()),
        };

        if total + used > max_line_bytes {
            let keep = max_line_bytes.saturating_sub(total);
            buf.extend_from_slice(&available[..keep]);
            reader.consume(used);
            return Ok(LineRead::TooLong);
        }

        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        total += used;

        if complete {
            return Ok(LineRead::Line(total));
        }
    }
}

/// Write `payload` followed by a single newline and flush.
pub async fn write_line<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> std::io::Result<()> {
    writer.write_all(payload).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Serialize)]
struct HostResponse<'a> {
    command: &'a str,
    payload: &'a serde_json::Value,
}

/// Serialize a host-callback response. No newline; `write_line` adds it.
pub fn encode_host_response(command: &str, payload: &serde_json::Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&HostResponse { command, payload })?)
}
