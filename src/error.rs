//! Error kinds surfaced to users of the stream facade (§7).
//!
//! `message_too_big`, `invalid_argument` and `would_block` are handled
//! internally and never reach a user callback — they're listed here
//! only because the spec calls them out as named states of the state
//! machine's error latch.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TimedOut,
    ConnectionReset,
    Eof,
    OperationAborted,
    MessageTooBig,
    InvalidArgument,
    WouldBlock,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::TimedOut => "timed out",
            ErrorKind::ConnectionReset => "connection reset",
            ErrorKind::Eof => "end of file",
            ErrorKind::OperationAborted => "operation aborted",
            ErrorKind::MessageTooBig => "message too big",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::WouldBlock => "would block",
        };
        f.write_str(s)
    }
}

impl std::error::Error for ErrorKind {}

#[derive(Debug, thiserror::Error)]
pub enum UtpError {
    #[error("utp protocol error: {0}")]
    Protocol(ErrorKind),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<ErrorKind> for UtpError {
    fn from(kind: ErrorKind) -> Self {
        UtpError::Protocol(kind)
    }
}

pub type Result<T> = std::result::Result<T, UtpError>;
