//! Lazy call-frame views.
//!
//! The relay forwards frames without decoding bodies. These views parse just
//! enough of a raw call frame to answer routing questions (service, method,
//! TTL) and to rewrite the id or TTL in place. Nothing past arg1 is touched
//! unless arg2 inspection is explicitly requested.

use core::fmt;
use std::ops::Range;

use crate::{
    transport_headers, CallFlags, ChecksumType, CodecError, Frame, MessageType, ResponseCode,
    Span, MAX_FRAME_PAYLOAD,
};

/// Why arg2 could not be inspected or modified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg2Error {
    /// Arg2 continues in a later frame.
    Fragmented,
    /// The call's arg scheme is not Thrift.
    NotThrift,
    /// The mutated arg2 would overflow the frame or its length prefix.
    TooLarge,
    Malformed(CodecError),
}

impl fmt::Display for Arg2Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fragmented => write!(f, "fragmented arg2"),
            Self::NotThrift => {
                write!(f, "cannot inspect or modify arg2 for non-Thrift calls")
            }
            Self::TooLarge => write!(f, "modified arg2 does not fit the frame"),
            Self::Malformed(e) => write!(f, "malformed arg2: {e}"),
        }
    }
}

impl std::error::Error for Arg2Error {}

const TTL_OFFSET: usize = 1;
const SPAN_OFFSET: usize = 5;

/// Borrowed view over a raw call-req frame.
pub struct LazyCallReq<'a> {
    frame: &'a mut Frame,
    service: Range<usize>,
    headers: Vec<(Range<usize>, Range<usize>)>,
    checksum_type: ChecksumType,
    csum_offset: Option<usize>,
    /// Offset of the arg region (arg1's length prefix); checksums cover from
    /// here to the end of the payload.
    args_offset: usize,
    arg1: Range<usize>,
}

impl<'a> LazyCallReq<'a> {
    pub fn new(frame: &'a mut Frame) -> Result<Self, CodecError> {
        debug_assert_eq!(frame.header.message_type, MessageType::CallReq);
        let payload = frame.payload();
        if payload.len() < SPAN_OFFSET + Span::LEN + 1 {
            return Err(CodecError::Truncated("call-req header"));
        }
        let mut off = SPAN_OFFSET + Span::LEN;

        let take1 = |payload: &[u8], off: &mut usize,
                     what: &'static str|
         -> Result<Range<usize>, CodecError> {
            if payload.len() < *off + 1 {
                return Err(CodecError::Truncated(what));
            }
            let len = payload[*off] as usize;
            *off += 1;
            if payload.len() < *off + len {
                return Err(CodecError::Truncated(what));
            }
            let range = *off..*off + len;
            *off += len;
            Ok(range)
        };

        let service = take1(payload, &mut off, "service name")?;

        if payload.len() < off + 1 {
            return Err(CodecError::Truncated("transport header count"));
        }
        let nh = payload[off] as usize;
        off += 1;
        let mut headers = Vec::with_capacity(nh);
        for _ in 0..nh {
            let key = take1(payload, &mut off, "transport header key")?;
            let value = take1(payload, &mut off, "transport header value")?;
            headers.push((key, value));
        }

        if payload.len() < off + 1 {
            return Err(CodecError::Truncated("checksum type"));
        }
        let checksum_type = ChecksumType::from_u8(payload[off])?;
        off += 1;
        let csum_offset = if checksum_type.value_len() == 4 {
            let csum_offset = off;
            if payload.len() < off + 4 {
                return Err(CodecError::Truncated("checksum value"));
            }
            off += 4;
            Some(csum_offset)
        } else {
            None
        };

        let args_offset = off;
        if payload.len() < off + 2 {
            return Err(CodecError::Truncated("arg1 length"));
        }
        let arg1_len = u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
        off += 2;
        if payload.len() < off + arg1_len {
            return Err(CodecError::Truncated("arg1"));
        }
        let arg1 = off..off + arg1_len;

        Ok(Self {
            frame,
            service,
            headers,
            checksum_type,
            csum_offset,
            args_offset,
            arg1,
        })
    }

    pub fn id(&self) -> u32 {
        self.frame.header.id
    }

    pub fn set_id(&mut self, id: u32) {
        self.frame.header.id = id;
    }

    pub fn has_more_fragments(&self) -> bool {
        CallFlags::from_bits_truncate(self.frame.payload()[0]).contains(CallFlags::MORE_FRAGMENTS)
    }

    pub fn ttl_ms(&self) -> u32 {
        let p = self.frame.payload();
        u32::from_be_bytes([
            p[TTL_OFFSET],
            p[TTL_OFFSET + 1],
            p[TTL_OFFSET + 2],
            p[TTL_OFFSET + 3],
        ])
    }

    /// Rewrite the TTL in place (used when the relay clamps deadlines).
    pub fn set_ttl_ms(&mut self, ttl_ms: u32) {
        self.frame.payload_mut()[TTL_OFFSET..TTL_OFFSET + 4]
            .copy_from_slice(&ttl_ms.to_be_bytes());
        self.refresh_checksum();
    }

    pub fn span(&self) -> Span {
        Span::decode(&self.frame.payload()[SPAN_OFFSET..SPAN_OFFSET + Span::LEN])
            .expect("span bounds validated at construction")
    }

    /// The destination service name.
    pub fn service(&self) -> &[u8] {
        &self.frame.payload()[self.service.clone()]
    }

    /// The method name (arg1).
    pub fn method(&self) -> &[u8] {
        &self.frame.payload()[self.arg1.clone()]
    }

    pub fn transport_header(&self, key: &str) -> Option<&[u8]> {
        let payload = self.frame.payload();
        self.headers
            .iter()
            .find(|(k, _)| &payload[k.clone()] == key.as_bytes())
            .map(|(_, v)| &payload[v.clone()])
    }

    pub fn caller(&self) -> Option<&[u8]> {
        self.transport_header(transport_headers::CALLER_NAME)
    }

    pub fn arg_scheme(&self) -> Option<&[u8]> {
        self.transport_header(transport_headers::ARG_SCHEME)
    }

    fn is_thrift(&self) -> bool {
        self.arg_scheme() == Some(b"thrift")
    }

    /// Offset of arg2's length prefix within the payload.
    pub fn arg2_start_offset(&self) -> usize {
        self.arg1.end
    }

    /// End offset of arg2's chunk in this frame, plus whether arg2 continues
    /// past it.
    pub fn arg2_end_offset(&self) -> Result<(usize, bool), Arg2Error> {
        let payload = self.frame.payload();
        let len_off = self.arg2_start_offset();
        if payload.len() < len_off + 2 {
            return Err(Arg2Error::Malformed(CodecError::Truncated("arg2 length")));
        }
        let len = u16::from_be_bytes([payload[len_off], payload[len_off + 1]]) as usize;
        let end = len_off + 2 + len;
        if end > payload.len() {
            return Err(Arg2Error::Malformed(CodecError::Truncated("arg2")));
        }
        // A chunk running to the end of the frame leaves the argument open.
        Ok((end, end == payload.len()))
    }

    /// Iterate arg2's key/value pairs (Thrift layout: `nh:2 (k~2 v~2)*`).
    pub fn arg2_kv(&self) -> Result<Vec<(&[u8], &[u8])>, Arg2Error> {
        let (end, _) = self.inspectable_arg2()?;
        let payload = self.frame.payload();
        let start = self.arg2_start_offset() + 2;
        let region = &payload[start..end];
        if region.is_empty() {
            return Ok(Vec::new());
        }
        if region.len() < 2 {
            return Err(Arg2Error::Malformed(CodecError::Truncated("arg2 headers")));
        }
        let nh = u16::from_be_bytes([region[0], region[1]]) as usize;
        let mut off = 2;
        let mut pairs = Vec::with_capacity(nh);
        for _ in 0..nh {
            let mut fields = [0..0, 0..0];
            for field in fields.iter_mut() {
                if region.len() < off + 2 {
                    return Err(Arg2Error::Malformed(CodecError::Truncated("arg2 header")));
                }
                let len = u16::from_be_bytes([region[off], region[off + 1]]) as usize;
                off += 2;
                if region.len() < off + len {
                    return Err(Arg2Error::Malformed(CodecError::Truncated("arg2 header")));
                }
                *field = off..off + len;
                off += len;
            }
            let [k, v] = fields;
            pairs.push((&region[k], &region[v]));
        }
        Ok(pairs)
    }

    /// Append key/value pairs to arg2 in place, fixing lengths, the header
    /// count, the checksum and the frame size.
    pub fn append_arg2(&mut self, pairs: &[(&[u8], &[u8])]) -> Result<(), Arg2Error> {
        if pairs.is_empty() {
            return Ok(());
        }
        let (mut end, _) = self.inspectable_arg2()?;
        let len_off = self.arg2_start_offset();
        let start = len_off + 2;

        let mut extra = Vec::new();
        for (key, value) in pairs {
            for field in [*key, *value] {
                if field.len() > u16::MAX as usize {
                    return Err(Arg2Error::TooLarge);
                }
                extra.extend_from_slice(&(field.len() as u16).to_be_bytes());
                extra.extend_from_slice(field);
            }
        }

        let payload = self.frame.payload_mut();

        // An empty arg2 first needs its header-count prefix.
        if end == start {
            payload.splice(start..start, [0u8, 0u8]);
            end += 2;
        }

        let old_arg2_len = end - start;
        let new_arg2_len = old_arg2_len + extra.len();
        if new_arg2_len > u16::MAX as usize
            || payload.len() + extra.len() > MAX_FRAME_PAYLOAD
        {
            return Err(Arg2Error::TooLarge);
        }

        payload.splice(end..end, extra.iter().copied());

        let nh = u16::from_be_bytes([payload[start], payload[start + 1]]);
        let new_nh = nh
            .checked_add(pairs.len() as u16)
            .ok_or(Arg2Error::TooLarge)?;
        payload[start..start + 2].copy_from_slice(&new_nh.to_be_bytes());
        payload[len_off..len_off + 2]
            .copy_from_slice(&(new_arg2_len as u16).to_be_bytes());

        self.frame.sync_size();
        self.refresh_checksum();
        Ok(())
    }

    fn inspectable_arg2(&self) -> Result<(usize, bool), Arg2Error> {
        if !self.is_thrift() {
            return Err(Arg2Error::NotThrift);
        }
        let (end, fragmented) = self.arg2_end_offset()?;
        if fragmented && self.has_more_fragments() {
            return Err(Arg2Error::Fragmented);
        }
        Ok((end, fragmented))
    }

    fn refresh_checksum(&mut self) {
        if let Some(csum_offset) = self.csum_offset {
            let args_offset = self.args_offset;
            let value = {
                let payload = self.frame.payload();
                self.checksum_type.compute(&payload[args_offset..])
            };
            self.frame.payload_mut()[csum_offset..csum_offset + 4]
                .copy_from_slice(&value.to_be_bytes());
        }
    }
}

/// Borrowed view over a raw call-res frame.
pub struct LazyCallRes<'a> {
    frame: &'a Frame,
    code: ResponseCode,
}

impl<'a> LazyCallRes<'a> {
    pub fn new(frame: &'a Frame) -> Result<Self, CodecError> {
        debug_assert_eq!(frame.header.message_type, MessageType::CallRes);
        let (header, region) = crate::CallResHeader::decode(frame.payload())?;
        if region.args_offset > frame.payload().len() {
            return Err(CodecError::Truncated("call-res args"));
        }
        Ok(Self {
            frame,
            code: header.code,
        })
    }

    pub fn id(&self) -> u32 {
        self.frame.header.id
    }

    pub fn code(&self) -> ResponseCode {
        self.code
    }

    pub fn ok(&self) -> bool {
        self.code == ResponseCode::Ok
    }

    pub fn has_more_fragments(&self) -> bool {
        CallFlags::from_bits_truncate(self.frame.payload()[0]).contains(CallFlags::MORE_FRAGMENTS)
    }
}
