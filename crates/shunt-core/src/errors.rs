//! Wire-level error codes and codec errors.

use core::fmt;

use crate::Span;

/// System error codes carried in error frames.
///
/// Application errors are not represented here; they travel in-band via the
/// call-response code byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SystemErrCode {
    Timeout = 0x01,
    Cancelled = 0x02,
    Busy = 0x03,
    Declined = 0x04,
    UnexpectedError = 0x05,
    BadRequest = 0x06,
    NetworkError = 0x07,
    ProtocolError = 0x08,
    /// Unrecoverable protocol violation; the connection must be torn down.
    FatalProtocol = 0xFF,
}

impl SystemErrCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Timeout),
            0x02 => Some(Self::Cancelled),
            0x03 => Some(Self::Busy),
            0x04 => Some(Self::Declined),
            0x05 => Some(Self::UnexpectedError),
            0x06 => Some(Self::BadRequest),
            0x07 => Some(Self::NetworkError),
            0x08 => Some(Self::ProtocolError),
            0xFF => Some(Self::FatalProtocol),
            _ => None,
        }
    }

    /// Short kebab-case name, used to build stat keys like `relay-declined`.
    pub fn stat_name(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Busy => "busy",
            Self::Declined => "declined",
            Self::UnexpectedError => "unexpected-error",
            Self::BadRequest => "bad-request",
            Self::NetworkError => "network-error",
            Self::ProtocolError => "protocol-error",
            Self::FatalProtocol => "fatal-protocol",
        }
    }
}

impl fmt::Display for SystemErrCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Busy => write!(f, "busy"),
            Self::Declined => write!(f, "declined"),
            Self::UnexpectedError => write!(f, "unexpected error"),
            Self::BadRequest => write!(f, "bad request"),
            Self::NetworkError => write!(f, "network error"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::FatalProtocol => write!(f, "fatal protocol error"),
        }
    }
}

/// Body of an error frame: `code:1 tracing:25 message~2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorBody {
    pub code: SystemErrCode,
    pub span: Span,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: SystemErrCode, message: impl Into<String>) -> Self {
        Self {
            code,
            span: Span::default(),
            message: message.into(),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.message.len() > u16::MAX as usize {
            return Err(CodecError::FieldTooLong("error message"));
        }
        buf.push(self.code as u8);
        self.span.encode(buf);
        buf.extend_from_slice(&(self.message.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.message.as_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 1 + Span::LEN + 2 {
            return Err(CodecError::Truncated("error body"));
        }
        let code = SystemErrCode::from_u8(buf[0]).ok_or(CodecError::UnknownErrCode(buf[0]))?;
        let span = Span::decode(&buf[1..1 + Span::LEN])?;
        let msg_off = 1 + Span::LEN;
        let msg_len = u16::from_be_bytes([buf[msg_off], buf[msg_off + 1]]) as usize;
        let msg_start = msg_off + 2;
        if buf.len() < msg_start + msg_len {
            return Err(CodecError::Truncated("error message"));
        }
        let message = String::from_utf8_lossy(&buf[msg_start..msg_start + msg_len]).into_owned();
        Ok(Self {
            code,
            span,
            message,
        })
    }
}

/// Errors produced while encoding or decoding wire structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before the named field was complete.
    Truncated(&'static str),
    /// A variable-length field exceeds its length-prefix range.
    FieldTooLong(&'static str),
    /// The frame size field is smaller than the fixed header.
    FrameTooSmall(u16),
    /// A payload would not fit in a single frame.
    PayloadTooLarge(usize),
    UnknownMessageType(u8),
    UnknownChecksum(u8),
    UnknownErrCode(u8),
    UnknownResponseCode(u8),
    /// A required init header was absent.
    MissingInitHeader(&'static str),
    /// A header or service name was not valid UTF-8.
    InvalidUtf8(&'static str),
    /// Frame checksum did not match the arg region.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated(what) => write!(f, "truncated {what}"),
            Self::FieldTooLong(what) => write!(f, "{what} exceeds length prefix"),
            Self::FrameTooSmall(size) => write!(f, "frame size {size} is smaller than the header"),
            Self::PayloadTooLarge(len) => write!(f, "payload of {len} bytes does not fit a frame"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type 0x{t:02X}"),
            Self::UnknownChecksum(t) => write!(f, "unknown checksum type 0x{t:02X}"),
            Self::UnknownErrCode(c) => write!(f, "unknown system error code 0x{c:02X}"),
            Self::UnknownResponseCode(c) => write!(f, "unknown response code 0x{c:02X}"),
            Self::MissingInitHeader(key) => write!(f, "init body is missing header {key:?}"),
            Self::InvalidUtf8(what) => write!(f, "{what} is not valid UTF-8"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected:#010x}, got {actual:#010x}")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// Errors while reading a frame off a byte stream.
#[derive(Debug)]
pub enum FrameIoError {
    Io(std::io::Error),
    Codec(CodecError),
}

impl fmt::Display for FrameIoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Codec(e) => write!(f, "codec error: {e}"),
        }
    }
}

impl std::error::Error for FrameIoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Codec(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for FrameIoError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CodecError> for FrameIoError {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}
