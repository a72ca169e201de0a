//! Cancel and claim bodies.

use crate::{CodecError, Span};

/// Body of a cancel frame: `ttl:4 tracing:25 why~2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelBody {
    pub ttl_ms: u32,
    pub span: Span,
    pub why: String,
}

impl CancelBody {
    pub fn new(span: Span, why: impl Into<String>) -> Self {
        Self {
            ttl_ms: 0,
            span,
            why: why.into(),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        if self.why.len() > u16::MAX as usize {
            return Err(CodecError::FieldTooLong("cancel reason"));
        }
        buf.extend_from_slice(&self.ttl_ms.to_be_bytes());
        self.span.encode(buf);
        buf.extend_from_slice(&(self.why.len() as u16).to_be_bytes());
        buf.extend_from_slice(self.why.as_bytes());
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 + Span::LEN + 2 {
            return Err(CodecError::Truncated("cancel body"));
        }
        let ttl_ms = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let span = Span::decode(&buf[4..4 + Span::LEN])?;
        let why_off = 4 + Span::LEN;
        let why_len = u16::from_be_bytes([buf[why_off], buf[why_off + 1]]) as usize;
        let why_start = why_off + 2;
        if buf.len() < why_start + why_len {
            return Err(CodecError::Truncated("cancel reason"));
        }
        let why = String::from_utf8_lossy(&buf[why_start..why_start + why_len]).into_owned();
        Ok(Self { ttl_ms, span, why })
    }
}

/// Body of a claim frame: `ttl:4 tracing:25`. Decoded, logged and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimBody {
    pub ttl_ms: u32,
    pub span: Span,
}

impl ClaimBody {
    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < 4 + Span::LEN {
            return Err(CodecError::Truncated("claim body"));
        }
        let ttl_ms = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let span = Span::decode(&buf[4..4 + Span::LEN])?;
        Ok(Self { ttl_ms, span })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_round_trip() {
        let body = CancelBody::new(Span::new_root(), "deadline exceeded");
        let mut buf = Vec::new();
        body.encode(&mut buf).unwrap();
        assert_eq!(CancelBody::decode(&buf).unwrap(), body);
    }

    #[test]
    fn claim_decode() {
        let cancel = CancelBody::new(Span::default(), "");
        let mut buf = Vec::new();
        cancel.encode(&mut buf).unwrap();
        let claim = ClaimBody::decode(&buf[..4 + Span::LEN]).unwrap();
        assert_eq!(claim.ttl_ms, 0);
    }
}
