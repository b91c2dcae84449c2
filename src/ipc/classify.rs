//! Transient-failure classification.
//!
//! Decides whether a failed round trip means "the worker is gone" (respawn
//! candidate) or something the governor must hand back untouched. The
//! message sentinels are platform specific; extend them here.

use std::io::ErrorKind;

use crate::types::Error;

/// Lower-case fragments that identify a dead stream in foreign error text.
const GONE_SENTINELS: &[&str] = &[
    "eof",
    "end of file",
    "file already closed",
    "stream already closed",
    "broken pipe",
    "connection reset",
    "the pipe is being closed",
    "the pipe has been ended",
];

/// True when `err` means the worker's pipes are gone.
pub fn is_stream_gone(err: &Error) -> bool {
    match err {
        Error::StreamClosed(_) => true,
        Error::Io(io) => io_is_gone(io),
        _ => false,
    }
}

fn io_is_gone(err: &std::io::Error) -> bool {
    match err.kind() {
        ErrorKind::UnexpectedEof
        | ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => true,
        _ => message_is_gone(&err.to_string()),
    }
}

fn message_is_gone(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    GONE_SENTINELS.iter().any(|sentinel| message.contains(sentinel))
}
