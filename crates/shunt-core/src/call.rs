//! Call request/response body codecs.
//!
//! A call travels as one call-req (or call-res) frame followed by zero or
//! more continuation frames. Every call frame starts with a flags byte whose
//! bit 0 says "more fragments follow". The first frame carries the full
//! header prefix; continuations carry only flags and the (repeated) checksum.
//! The three arguments arrive after the prefix as 2-byte length-prefixed
//! chunks.

use bitflags::bitflags;

use crate::{ChecksumType, CodecError, Span};

bitflags! {
    /// Flags byte leading every call-scope frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallFlags: u8 {
        /// More fragments of this call follow in subsequent frames.
        const MORE_FRAGMENTS = 0x01;
    }
}

/// Maximum encoded length of arg1 (the method name). Arg1 may not span
/// frames.
pub const ARG1_MAX_LEN: usize = 16 * 1024;

/// Well-known transport header keys carried on call requests.
pub mod transport_headers {
    /// Argument scheme: how arg2/arg3 are encoded (`raw`, `json`, `thrift`).
    pub const ARG_SCHEME: &str = "as";
    /// Service name of the caller.
    pub const CALLER_NAME: &str = "cn";
    /// Retry flags.
    pub const RETRY_FLAGS: &str = "re";
}

/// Argument scheme values for the `as` transport header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgScheme {
    #[default]
    Raw,
    Json,
    Thrift,
}

impl ArgScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Json => "json",
            Self::Thrift => "thrift",
        }
    }
}

/// Response code byte on call-res frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseCode {
    Ok = 0x00,
    /// Application-level error; details travel in the response args.
    AppError = 0x01,
}

impl ResponseCode {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::AppError),
            other => Err(CodecError::UnknownResponseCode(other)),
        }
    }
}

/// Location of the 4-byte checksum value inside an encoded prefix, to be
/// patched once the frame's arg region is final.
#[derive(Debug, Clone, Copy)]
pub struct ChecksumSlot {
    offset: Option<usize>,
}

impl ChecksumSlot {
    pub fn patch(&self, buf: &mut [u8], value: u32) {
        if let Some(off) = self.offset {
            buf[off..off + 4].copy_from_slice(&value.to_be_bytes());
        }
    }
}

/// Where the arg region begins and what checksum the prefix declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgRegion {
    pub args_offset: usize,
    pub checksum: u32,
}

fn write_checksum_slot(buf: &mut Vec<u8>, checksum_type: ChecksumType) -> ChecksumSlot {
    buf.push(checksum_type as u8);
    if checksum_type.value_len() == 0 {
        return ChecksumSlot { offset: None };
    }
    let offset = buf.len();
    buf.extend_from_slice(&[0u8; 4]);
    ChecksumSlot {
        offset: Some(offset),
    }
}

fn read_checksum(buf: &[u8], off: &mut usize) -> Result<(ChecksumType, u32), CodecError> {
    if buf.len() < *off + 1 {
        return Err(CodecError::Truncated("checksum type"));
    }
    let checksum_type = ChecksumType::from_u8(buf[*off])?;
    *off += 1;
    let mut checksum = 0;
    if checksum_type.value_len() == 4 {
        if buf.len() < *off + 4 {
            return Err(CodecError::Truncated("checksum value"));
        }
        checksum = u32::from_be_bytes([buf[*off], buf[*off + 1], buf[*off + 2], buf[*off + 3]]);
        *off += 4;
    }
    Ok((checksum_type, checksum))
}

fn write_str1(buf: &mut Vec<u8>, value: &str, what: &'static str) -> Result<(), CodecError> {
    if value.len() > u8::MAX as usize {
        return Err(CodecError::FieldTooLong(what));
    }
    buf.push(value.len() as u8);
    buf.extend_from_slice(value.as_bytes());
    Ok(())
}

fn read_str1(buf: &[u8], off: &mut usize, what: &'static str) -> Result<String, CodecError> {
    if buf.len() < *off + 1 {
        return Err(CodecError::Truncated(what));
    }
    let len = buf[*off] as usize;
    *off += 1;
    if buf.len() < *off + len {
        return Err(CodecError::Truncated(what));
    }
    let value = std::str::from_utf8(&buf[*off..*off + len])
        .map_err(|_| CodecError::InvalidUtf8(what))?
        .to_owned();
    *off += len;
    Ok(value)
}

fn write_transport_headers(
    buf: &mut Vec<u8>,
    headers: &[(String, String)],
) -> Result<(), CodecError> {
    if headers.len() > u8::MAX as usize {
        return Err(CodecError::FieldTooLong("transport header count"));
    }
    buf.push(headers.len() as u8);
    for (key, value) in headers {
        write_str1(buf, key, "transport header key")?;
        write_str1(buf, value, "transport header value")?;
    }
    Ok(())
}

fn read_transport_headers(
    buf: &[u8],
    off: &mut usize,
) -> Result<Vec<(String, String)>, CodecError> {
    if buf.len() < *off + 1 {
        return Err(CodecError::Truncated("transport header count"));
    }
    let nh = buf[*off] as usize;
    *off += 1;
    let mut headers = Vec::with_capacity(nh);
    for _ in 0..nh {
        let key = read_str1(buf, off, "transport header key")?;
        let value = read_str1(buf, off, "transport header value")?;
        headers.push((key, value));
    }
    Ok(headers)
}

/// Prefix of a call-req frame, everything before the arg region:
/// `flags:1 ttl:4 tracing:25 service~1 nh:1 (hk~1 hv~1)* csumtype:1 (csum:4)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallReqHeader {
    pub flags: CallFlags,
    pub ttl_ms: u32,
    pub span: Span,
    pub service: String,
    pub headers: Vec<(String, String)>,
    pub checksum_type: ChecksumType,
}

impl CallReqHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<ChecksumSlot, CodecError> {
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.ttl_ms.to_be_bytes());
        self.span.encode(buf);
        write_str1(buf, &self.service, "service name")?;
        write_transport_headers(buf, &self.headers)?;
        Ok(write_checksum_slot(buf, self.checksum_type))
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, ArgRegion), CodecError> {
        if buf.len() < 1 + 4 + Span::LEN {
            return Err(CodecError::Truncated("call-req header"));
        }
        let flags = CallFlags::from_bits_truncate(buf[0]);
        let ttl_ms = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        let span = Span::decode(&buf[5..5 + Span::LEN])?;
        let mut off = 5 + Span::LEN;
        let service = read_str1(buf, &mut off, "service name")?;
        let headers = read_transport_headers(buf, &mut off)?;
        let (checksum_type, checksum) = read_checksum(buf, &mut off)?;
        Ok((
            Self {
                flags,
                ttl_ms,
                span,
                service,
                headers,
                checksum_type,
            },
            ArgRegion {
                args_offset: off,
                checksum,
            },
        ))
    }
}

/// Prefix of a call-res frame:
/// `flags:1 code:1 tracing:25 nh:1 (hk~1 hv~1)* csumtype:1 (csum:4)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResHeader {
    pub flags: CallFlags,
    pub code: ResponseCode,
    pub span: Span,
    pub headers: Vec<(String, String)>,
    pub checksum_type: ChecksumType,
}

impl CallResHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<ChecksumSlot, CodecError> {
        buf.push(self.flags.bits());
        buf.push(self.code as u8);
        self.span.encode(buf);
        write_transport_headers(buf, &self.headers)?;
        Ok(write_checksum_slot(buf, self.checksum_type))
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, ArgRegion), CodecError> {
        if buf.len() < 2 + Span::LEN {
            return Err(CodecError::Truncated("call-res header"));
        }
        let flags = CallFlags::from_bits_truncate(buf[0]);
        let code = ResponseCode::from_u8(buf[1])?;
        let span = Span::decode(&buf[2..2 + Span::LEN])?;
        let mut off = 2 + Span::LEN;
        let headers = read_transport_headers(buf, &mut off)?;
        let (checksum_type, checksum) = read_checksum(buf, &mut off)?;
        Ok((
            Self {
                flags,
                code,
                span,
                headers,
                checksum_type,
            },
            ArgRegion {
                args_offset: off,
                checksum,
            },
        ))
    }
}

/// Prefix of call-req-continue / call-res-continue frames:
/// `flags:1 csumtype:1 (csum:4)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinueHeader {
    pub flags: CallFlags,
    pub checksum_type: ChecksumType,
}

impl ContinueHeader {
    pub fn encode(&self, buf: &mut Vec<u8>) -> ChecksumSlot {
        buf.push(self.flags.bits());
        write_checksum_slot(buf, self.checksum_type)
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, ArgRegion), CodecError> {
        if buf.is_empty() {
            return Err(CodecError::Truncated("continue header"));
        }
        let flags = CallFlags::from_bits_truncate(buf[0]);
        let mut off = 1;
        let (checksum_type, checksum) = read_checksum(buf, &mut off)?;
        Ok((
            Self {
                flags,
                checksum_type,
            },
            ArgRegion {
                args_offset: off,
                checksum,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_headers() -> Vec<(String, String)> {
        vec![
            ("as".to_owned(), "raw".to_owned()),
            ("cn".to_owned(), "caller-svc".to_owned()),
        ]
    }

    #[test]
    fn call_req_header_round_trip() {
        let header = CallReqHeader {
            flags: CallFlags::MORE_FRAGMENTS,
            ttl_ms: 1500,
            span: Span::new_root(),
            service: "payments".to_owned(),
            headers: sample_headers(),
            checksum_type: ChecksumType::Crc32,
        };
        let mut buf = Vec::new();
        let slot = header.encode(&mut buf).unwrap();
        slot.patch(&mut buf, 0xCAFE_F00D);

        let (decoded, region) = CallReqHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(region.args_offset, buf.len());
        assert_eq!(region.checksum, 0xCAFE_F00D);
    }

    #[test]
    fn call_res_header_round_trip() {
        let header = CallResHeader {
            flags: CallFlags::empty(),
            code: ResponseCode::AppError,
            span: Span::default(),
            headers: vec![],
            checksum_type: ChecksumType::None,
        };
        let mut buf = Vec::new();
        let slot = header.encode(&mut buf).unwrap();
        // None has no checksum slot to patch.
        slot.patch(&mut buf, 0xFFFF_FFFF);

        let (decoded, region) = CallResHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(region.checksum, 0);
        assert_eq!(region.args_offset, buf.len());
    }

    #[test]
    fn continue_header_round_trip() {
        let header = ContinueHeader {
            flags: CallFlags::MORE_FRAGMENTS,
            checksum_type: ChecksumType::Crc32C,
        };
        let mut buf = Vec::new();
        let slot = header.encode(&mut buf);
        slot.patch(&mut buf, 42);
        let (decoded, region) = ContinueHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(region.checksum, 42);
    }

    #[test]
    fn truncated_call_req_header() {
        let header = CallReqHeader {
            flags: CallFlags::empty(),
            ttl_ms: 100,
            span: Span::default(),
            service: "svc".to_owned(),
            headers: sample_headers(),
            checksum_type: ChecksumType::Crc32,
        };
        let mut buf = Vec::new();
        header.encode(&mut buf).unwrap();
        for cut in 1..buf.len() {
            assert!(
                CallReqHeader::decode(&buf[..cut]).is_err(),
                "prefix of {cut} bytes should not decode"
            );
        }
    }

    #[test]
    fn oversize_service_name_rejected() {
        let header = CallReqHeader {
            flags: CallFlags::empty(),
            ttl_ms: 100,
            span: Span::default(),
            service: "x".repeat(300),
            headers: vec![],
            checksum_type: ChecksumType::None,
        };
        let mut buf = Vec::new();
        let err = header.encode(&mut buf).unwrap_err();
        assert_eq!(err, CodecError::FieldTooLong("service name"));
    }
}
