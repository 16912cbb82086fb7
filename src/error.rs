//! Errors produced while talking to the console.

use crate::command::CommandId;
use std::{fmt, io};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A 32-bit result code returned by the console.
///
/// Zero is success. Driver calls report failures as negative values, while
/// a few calls (file reads and writes) report the number of elements
/// transferred as a positive value.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct StatusCode(u32);

impl StatusCode {
    pub const SUCCESS: StatusCode = StatusCode(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        StatusCode(raw)
    }

    #[inline]
    pub const fn to_raw(self) -> u32 {
        self.0
    }

    /// The code interpreted as the signed value the kernel returned.
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self.0 as i32
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Returns `true` for negative codes, which never carry output.
    #[inline]
    pub const fn is_error(self) -> bool {
        self.as_i32() < 0
    }

    /// Turns every nonzero code into [`Error::Status`].
    pub fn check(self) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Status(self))
        }
    }

    /// Turns negative codes into [`Error::Status`] and returns the
    /// non-negative value, used by calls that report a transfer count.
    pub fn count(self) -> Result<u32> {
        if self.is_error() {
            Err(Error::Status(self))
        } else {
            Ok(self.0)
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode(0x{:08X})", self.0)
    }
}

/// Coarse classification of an [`Error`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The socket failed. The connection is unusable.
    Transport,
    /// The console rejected the request with a status code.
    Remote,
    /// The client broke a protocol rule it could have avoided.
    Invariant,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("short response: expected {expected} bytes, received {received}")]
    ShortResponse { expected: usize, received: usize },

    #[error("{command} failed with status {status}")]
    Command {
        command: CommandId,
        status: StatusCode,
    },
    #[error("console returned status {0}")]
    Status(StatusCode),
    #[error("remote allocation of {size:#x} bytes failed")]
    AllocationFailed { size: u32 },
    #[error("short transfer: {actual} of {expected} elements moved")]
    ShortTransfer { expected: u32, actual: u32 },

    #[error("connection closed")]
    ConnectionClosed,
    #[error("a previous request timed out, the stream is out of sync")]
    RequestInFlight,
    #[error("read of {requested:#x} bytes exceeds the {limit:#x} byte response ceiling")]
    ReadTooLarge { requested: usize, limit: usize },
    #[error("write of {requested:#x} bytes exceeds the {limit:#x} byte request ceiling")]
    WriteTooLarge { requested: usize, limit: usize },
    #[error("response overflowed: expected {expected} bytes, received {received}")]
    ResponseOverflow { expected: usize, received: usize },
    #[error("malformed {what}: expected {expected} bytes, got {actual}")]
    MalformedResponse {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("malformed request frame: {0}")]
    MalformedRequest(&'static str),
    #[error("too many syscall arguments: {0}")]
    TooManyArguments(usize),
    #[error("{value:?} does not fit in a {capacity:#x} byte field")]
    FieldOverflow { value: String, capacity: usize },
    #[error("{0:?} must be ASCII without interior NUL bytes")]
    InvalidString(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connect { .. } | Error::Io(_) | Error::ShortResponse { .. } => {
                ErrorKind::Transport
            }
            Error::Command { .. }
            | Error::Status(_)
            | Error::AllocationFailed { .. }
            | Error::ShortTransfer { .. } => ErrorKind::Remote,
            Error::ConnectionClosed
            | Error::RequestInFlight
            | Error::ReadTooLarge { .. }
            | Error::WriteTooLarge { .. }
            | Error::ResponseOverflow { .. }
            | Error::MalformedResponse { .. }
            | Error::MalformedRequest(_)
            | Error::TooManyArguments(_)
            | Error::FieldOverflow { .. }
            | Error::InvalidString(_) => ErrorKind::Invariant,
        }
    }

    /// The status code of a remote failure, if this is one.
    pub fn status(&self) -> Option<StatusCode> {
        match *self {
            Error::Command { status, .. } | Error::Status(status) => Some(status),
            _ => None,
        }
    }
}
