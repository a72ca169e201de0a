//! Error types for the connection and relay layers.

use std::fmt;

use shunt_core::{CodecError, SystemErrCode};

/// Errors that take down a connection (or prevent one from forming).
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Codec(CodecError),
    /// The init handshake did not complete.
    Handshake(String),
    /// The peer violated the protocol after the handshake.
    Protocol(String),
    Closed,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::Handshake(msg) => write!(f, "handshake failed: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for ConnectionError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<shunt_core::FrameIoError> for ConnectionError {
    fn from(e: shunt_core::FrameIoError) -> Self {
        match e {
            shunt_core::FrameIoError::Io(e) => Self::Io(e),
            shunt_core::FrameIoError::Codec(e) => Self::Codec(e),
        }
    }
}

/// Outcome of a non-blocking enqueue on a connection's send queue.
///
/// A full queue is the backpressure signal: the frame was dropped and the
/// caller decides what that means for its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The bounded send queue was full; the frame was dropped.
    QueueFull,
    /// The connection is closed.
    Closed,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull => write!(f, "send queue full"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for SendError {}

/// Errors surfaced to a caller for a single call.
#[derive(Debug)]
pub enum CallError {
    /// The call's TTL elapsed before a terminal response arrived.
    Timeout,
    /// The call was cancelled (locally, or the connection drained).
    Cancelled,
    /// The connection's send queue was full; the call was dropped locally.
    SendQueueFull,
    ConnectionClosed,
    /// Arg1 exceeds the single-frame bound.
    MethodTooLarge(usize),
    /// The peer answered with a system error frame.
    Remote { code: SystemErrCode, message: String },
    /// A received frame could not be decoded.
    Codec(CodecError),
    /// A structurally invalid frame sequence for this call.
    Protocol(String),
    /// The call never got a connection.
    Connection(ConnectionError),
}

impl CallError {
    /// The system error code this error maps to on the wire.
    pub fn code(&self) -> SystemErrCode {
        match self {
            Self::Timeout => SystemErrCode::Timeout,
            Self::Cancelled => SystemErrCode::Cancelled,
            Self::SendQueueFull => SystemErrCode::Busy,
            Self::ConnectionClosed => SystemErrCode::NetworkError,
            Self::MethodTooLarge(_) => SystemErrCode::BadRequest,
            Self::Remote { code, .. } => *code,
            Self::Codec(_) => SystemErrCode::BadRequest,
            Self::Protocol(_) => SystemErrCode::ProtocolError,
            Self::Connection(_) => SystemErrCode::NetworkError,
        }
    }
}

impl fmt::Display for CallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "call timed out"),
            Self::Cancelled => write!(f, "call cancelled"),
            Self::SendQueueFull => write!(f, "send queue full"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::MethodTooLarge(len) => {
                write!(f, "method name of {len} bytes exceeds the single-frame bound")
            }
            Self::Remote { code, message } => write!(f, "remote error ({code}): {message}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Connection(e) => write!(f, "connection error: {e}"),
        }
    }
}

impl std::error::Error for CallError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Codec(e) => Some(e),
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for CallError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<ConnectionError> for CallError {
    fn from(e: ConnectionError) -> Self {
        Self::Connection(e)
    }
}

impl From<SendError> for CallError {
    fn from(e: SendError) -> Self {
        match e {
            SendError::QueueFull => Self::SendQueueFull,
            SendError::Closed => Self::ConnectionClosed,
        }
    }
}

/// Channel-level errors.
#[derive(Debug)]
pub enum ChannelError {
    InvalidConfig(String),
    Io(std::io::Error),
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Closed => write!(f, "channel closed"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
