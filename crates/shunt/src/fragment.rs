//! Argument streaming across frames.
//!
//! A call's three arguments travel as 2-byte length-prefixed chunks packed
//! into frames. The rules:
//!
//! - a chunk that ends before the end of the frame closes its argument; the
//!   next chunk starts the next argument,
//! - a chunk that runs exactly to the end of the frame leaves the argument
//!   open; the next frame re-opens it with an immediate length prefix
//!   (possibly zero),
//! - a fragment chain ends with a frame whose "more fragments" bit is clear,
//! - arg1 never spans frames and is bounded at 16 KiB.
//!
//! Each frame carries one checksum over its own arg region; the first frame
//! declares the algorithm and continuations repeat it.

use shunt_core::{
    ArgRegion, CallFlags, CallReqHeader, CallResHeader, ChecksumType, CodecError, ContinueHeader,
    Frame, FrameHeader, FramePool, MessageType, ARG1_MAX_LEN, MAX_FRAME_PAYLOAD,
};

use crate::errors::CallError;

/// The fixed prefix of the first frame of a call.
pub(crate) enum CallPrefix {
    Req(CallReqHeader),
    Res(CallResHeader),
}

impl CallPrefix {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<shunt_core::ChecksumSlot, CodecError> {
        match self {
            Self::Req(h) => h.encode(buf),
            Self::Res(h) => h.encode(buf),
        }
    }

    fn checksum_type(&self) -> ChecksumType {
        match self {
            Self::Req(h) => h.checksum_type,
            Self::Res(h) => h.checksum_type,
        }
    }

    fn frame_types(&self) -> (MessageType, MessageType) {
        match self {
            Self::Req(_) => (MessageType::CallReq, MessageType::CallReqContinue),
            Self::Res(_) => (MessageType::CallRes, MessageType::CallResContinue),
        }
    }
}

/// Pack a call into frames: `preArg1 → writingArg1 → writingArg2 →
/// writingArg3 → done`, emitting a continuation whenever a frame fills
/// mid-argument.
pub(crate) fn write_call_frames(
    pool: &FramePool,
    id: u32,
    prefix: CallPrefix,
    args: [&[u8]; 3],
) -> Result<Vec<Frame>, CallError> {
    if args[0].len() > ARG1_MAX_LEN {
        return Err(CallError::MethodTooLarge(args[0].len()));
    }
    let checksum_type = prefix.checksum_type();
    let (first_type, cont_type) = prefix.frame_types();

    let mut frames = Vec::new();
    let mut arg_idx = 0usize;
    let mut arg_off = 0usize;

    loop {
        let mut buf = pool.get();
        let slot = if frames.is_empty() {
            prefix.encode(&mut buf).map_err(CallError::Codec)?
        } else {
            let cont = ContinueHeader {
                flags: CallFlags::empty(),
                checksum_type,
            };
            cont.encode(&mut buf)
        };
        let args_start = buf.len();

        while arg_idx < 3 {
            let space = MAX_FRAME_PAYLOAD - buf.len();
            if space < 2 {
                break;
            }
            let arg = args[arg_idx];
            let left = arg.len() - arg_off;
            let chunk = left.min(space - 2);
            buf.extend_from_slice(&(chunk as u16).to_be_bytes());
            buf.extend_from_slice(&arg[arg_off..arg_off + chunk]);
            arg_off += chunk;

            if arg_off == arg.len() {
                if buf.len() < MAX_FRAME_PAYLOAD {
                    // Chunk ended before the frame end: the argument closes.
                    arg_idx += 1;
                    arg_off = 0;
                } else {
                    // Ran exactly to the frame end: the argument stays open
                    // and the next frame re-opens it with a zero-length chunk.
                    break;
                }
            } else {
                break;
            }
        }

        let more = arg_idx < 3;
        if more {
            buf[0] |= CallFlags::MORE_FRAGMENTS.bits();
        }
        let sum = checksum_type.compute(&buf[args_start..]);
        slot.patch(&mut buf, sum);

        let message_type = if frames.is_empty() { first_type } else { cont_type };
        frames.push(Frame::from_parts(FrameHeader::new(message_type, id), buf));

        if !more {
            return Ok(frames);
        }
    }
}

/// What a completed [`ArgReader`] assembled.
pub(crate) enum AssembledCall {
    Request {
        header: CallReqHeader,
        args: [Vec<u8>; 3],
    },
    Response {
        header: CallResHeader,
        args: [Vec<u8>; 3],
    },
}

enum ReaderHeader {
    None,
    Req(CallReqHeader),
    Res(CallResHeader),
}

/// Reassembles a call's arguments from its frame sequence.
pub(crate) struct ArgReader {
    expect_response: bool,
    header: ReaderHeader,
    checksum_type: Option<ChecksumType>,
    args: [Vec<u8>; 3],
    arg_idx: usize,
    done: bool,
}

impl ArgReader {
    pub fn new_request() -> Self {
        Self::new(false)
    }

    pub fn new_response() -> Self {
        Self::new(true)
    }

    fn new(expect_response: bool) -> Self {
        Self {
            expect_response,
            header: ReaderHeader::None,
            checksum_type: None,
            args: [Vec::new(), Vec::new(), Vec::new()],
            arg_idx: 0,
            done: false,
        }
    }

    /// TTL from the request header, once the first frame has been fed.
    pub fn ttl_ms(&self) -> Option<u32> {
        match &self.header {
            ReaderHeader::Req(h) => Some(h.ttl_ms),
            _ => None,
        }
    }

    /// Feed the next frame of the call. Returns true when the call's
    /// fragment chain has terminated.
    pub fn feed(&mut self, frame: &Frame) -> Result<bool, CallError> {
        if self.done {
            return Err(CallError::Protocol("frame after call completed".into()));
        }

        let payload = frame.payload();
        let (flags, region) = self.decode_prefix(frame.header.message_type, payload)?;

        let declared = self
            .checksum_type
            .expect("checksum type set by prefix decode");
        declared
            .verify(&payload[region.args_offset..], region.checksum)
            .map_err(CallError::Codec)?;

        let more = flags.contains(CallFlags::MORE_FRAGMENTS);
        self.consume_args(payload, region, more)?;

        if !more {
            if self.arg_idx != 3 {
                return Err(CallError::Protocol(
                    "call terminated with missing args".into(),
                ));
            }
            self.done = true;
        }
        Ok(self.done)
    }

    fn decode_prefix(
        &mut self,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<(CallFlags, ArgRegion), CallError> {
        let started = !matches!(self.header, ReaderHeader::None);
        match (started, message_type, self.expect_response) {
            (false, MessageType::CallReq, false) => {
                let (header, region) = CallReqHeader::decode(payload).map_err(CallError::Codec)?;
                let flags = header.flags;
                self.checksum_type = Some(header.checksum_type);
                self.header = ReaderHeader::Req(header);
                Ok((flags, region))
            }
            (false, MessageType::CallRes, true) => {
                let (header, region) = CallResHeader::decode(payload).map_err(CallError::Codec)?;
                let flags = header.flags;
                self.checksum_type = Some(header.checksum_type);
                self.header = ReaderHeader::Res(header);
                Ok((flags, region))
            }
            (true, MessageType::CallReqContinue, false)
            | (true, MessageType::CallResContinue, true) => {
                let (header, region) = ContinueHeader::decode(payload).map_err(CallError::Codec)?;
                if Some(header.checksum_type) != self.checksum_type {
                    return Err(CallError::Protocol(
                        "checksum type changed mid-call".into(),
                    ));
                }
                Ok((header.flags, region))
            }
            _ => Err(CallError::Protocol(format!(
                "unexpected frame type {message_type:?} for this call"
            ))),
        }
    }

    fn consume_args(
        &mut self,
        payload: &[u8],
        region: ArgRegion,
        more: bool,
    ) -> Result<(), CallError> {
        let mut off = region.args_offset;
        while off < payload.len() {
            if self.arg_idx >= 3 {
                return Err(CallError::Protocol("more than three args".into()));
            }
            if payload.len() < off + 2 {
                return Err(CallError::Codec(CodecError::Truncated("arg chunk length")));
            }
            let len = u16::from_be_bytes([payload[off], payload[off + 1]]) as usize;
            off += 2;
            if payload.len() < off + len {
                return Err(CallError::Codec(CodecError::Truncated("arg chunk")));
            }
            self.args[self.arg_idx].extend_from_slice(&payload[off..off + len]);
            off += len;

            if off < payload.len() || !more {
                self.close_arg()?;
            }
            // Otherwise the chunk ran to the frame end with more fragments
            // coming: the argument stays open.
        }
        if more && self.arg_idx == 0 {
            return Err(CallError::Protocol("arg1 cannot span frames".into()));
        }
        Ok(())
    }

    fn close_arg(&mut self) -> Result<(), CallError> {
        if self.arg_idx == 0 && self.args[0].len() > ARG1_MAX_LEN {
            return Err(CallError::MethodTooLarge(self.args[0].len()));
        }
        self.arg_idx += 1;
        Ok(())
    }

    /// Take the assembled call. Only valid after `feed` returned true.
    pub fn finish(self) -> Result<AssembledCall, CallError> {
        if !self.done {
            return Err(CallError::Protocol("call not complete".into()));
        }
        match self.header {
            ReaderHeader::Req(header) => Ok(AssembledCall::Request {
                header,
                args: self.args,
            }),
            ReaderHeader::Res(header) => Ok(AssembledCall::Response {
                header,
                args: self.args,
            }),
            ReaderHeader::None => Err(CallError::Protocol("call never started".into())),
        }
    }
}
