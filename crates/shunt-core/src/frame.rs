//! Frame header codec and owned frames.
//!
//! Every wire unit is a frame: a fixed 16-byte header followed by up to
//! `MAX_FRAME_SIZE - 16` payload bytes. All integers are big-endian.
//!
//! ```text
//! 0       2   3   4       8               16
//! +-------+---+---+-------+---------------+----------------+
//! | size  | t | _ |  id   |   reserved    |    payload     |
//! +-------+---+---+-------+---------------+----------------+
//! ```

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{CodecError, FrameIoError, FramePool, PooledBuf};

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Maximum total frame size; the size field is a u16.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Maximum payload bytes in a single frame.
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Message id reserved for protocol-scope messages (init, ping, connection
/// errors).
pub const ID_PROTOCOL: u32 = 0xFFFF_FFFF;

/// Wire message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    InitReq = 0x01,
    InitRes = 0x02,
    CallReq = 0x03,
    CallRes = 0x04,
    CallReqContinue = 0x13,
    CallResContinue = 0x14,
    Cancel = 0xC0,
    Claim = 0xC1,
    PingReq = 0xD0,
    PingRes = 0xD1,
    Error = 0xFF,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::InitReq),
            0x02 => Some(Self::InitRes),
            0x03 => Some(Self::CallReq),
            0x04 => Some(Self::CallRes),
            0x13 => Some(Self::CallReqContinue),
            0x14 => Some(Self::CallResContinue),
            0xC0 => Some(Self::Cancel),
            0xC1 => Some(Self::Claim),
            0xD0 => Some(Self::PingReq),
            0xD1 => Some(Self::PingRes),
            0xFF => Some(Self::Error),
            _ => None,
        }
    }

    /// True for the frame types that belong to a specific call (as opposed to
    /// protocol-scope traffic).
    pub fn is_call_scope(&self) -> bool {
        matches!(
            self,
            Self::CallReq
                | Self::CallRes
                | Self::CallReqContinue
                | Self::CallResContinue
                | Self::Cancel
                | Self::Claim
        )
    }
}

/// The fixed 16-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Total frame length including this header.
    pub size: u16,
    pub message_type: MessageType,
    pub id: u32,
}

impl FrameHeader {
    pub fn new(message_type: MessageType, id: u32) -> Self {
        Self {
            size: FRAME_HEADER_SIZE as u16,
            message_type,
            id,
        }
    }

    pub fn payload_len(&self) -> usize {
        self.size as usize - FRAME_HEADER_SIZE
    }

    pub fn write_to(&self, buf: &mut [u8; FRAME_HEADER_SIZE]) {
        buf.fill(0);
        buf[0..2].copy_from_slice(&self.size.to_be_bytes());
        buf[2] = self.message_type as u8;
        buf[4..8].copy_from_slice(&self.id.to_be_bytes());
    }

    pub fn read_from(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, CodecError> {
        let size = u16::from_be_bytes([buf[0], buf[1]]);
        if (size as usize) < FRAME_HEADER_SIZE {
            return Err(CodecError::FrameTooSmall(size));
        }
        let message_type =
            MessageType::from_u8(buf[2]).ok_or(CodecError::UnknownMessageType(buf[2]))?;
        let id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        Ok(Self {
            size,
            message_type,
            id,
        })
    }
}

/// An owned frame backed by a pooled payload buffer.
///
/// The buffer returns to the pool when the frame is dropped, after the send
/// loop has written it or a handler has consumed it.
#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    payload: PooledBuf,
}

impl Frame {
    /// A frame with an empty payload.
    pub fn new(pool: &FramePool, message_type: MessageType, id: u32) -> Self {
        Self {
            header: FrameHeader::new(message_type, id),
            payload: pool.get(),
        }
    }

    /// A frame whose payload is a copy of `bytes`.
    pub fn with_payload(
        pool: &FramePool,
        message_type: MessageType,
        id: u32,
        bytes: &[u8],
    ) -> Result<Self, CodecError> {
        if bytes.len() > MAX_FRAME_PAYLOAD {
            return Err(CodecError::PayloadTooLarge(bytes.len()));
        }
        let mut frame = Self::new(pool, message_type, id);
        frame.payload.extend_from_slice(bytes);
        frame.sync_size();
        Ok(frame)
    }

    /// Assemble a frame from a header and an already-filled buffer.
    pub fn from_parts(mut header: FrameHeader, payload: PooledBuf) -> Self {
        header.size = (FRAME_HEADER_SIZE + payload.len()) as u16;
        Self { header, payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Mutable payload access. Callers that change the length must follow up
    /// with [`Frame::sync_size`].
    pub fn payload_mut(&mut self) -> &mut PooledBuf {
        &mut self.payload
    }

    /// Recompute the header size field from the payload length.
    pub fn sync_size(&mut self) {
        debug_assert!(self.payload.len() <= MAX_FRAME_PAYLOAD);
        self.header.size = (FRAME_HEADER_SIZE + self.payload.len()) as u16;
    }

    /// True iff this frame terminates its RPC: a call response (or response
    /// continuation) whose fragment flag is clear. A call request never
    /// terminates the RPC by itself; the response does.
    pub fn finishes_call(&self) -> bool {
        match self.header.message_type {
            MessageType::CallRes | MessageType::CallResContinue => {
                matches!(self.payload.first(), Some(flags) if flags & 0x01 == 0)
            }
            _ => false,
        }
    }

    /// Read exactly one frame. Returns `Ok(None)` on a clean EOF at a frame
    /// boundary.
    pub async fn read_from<R>(reader: &mut R, pool: &FramePool) -> Result<Option<Frame>, FrameIoError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        match reader.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let header = FrameHeader::read_from(&header_buf)?;

        let payload_len = header.payload_len();
        let mut payload = pool.get();
        if payload_len > 0 {
            payload.resize(payload_len, 0);
            reader.read_exact(&mut payload[..]).await?;
        }
        Ok(Some(Frame { header, payload }))
    }

    /// Write this frame to a stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        debug_assert_eq!(
            self.header.size as usize,
            FRAME_HEADER_SIZE + self.payload.len()
        );
        let mut header_buf = [0u8; FRAME_HEADER_SIZE];
        self.header.write_to(&mut header_buf);
        writer.write_all(&header_buf).await?;
        if !self.payload.is_empty() {
            writer.write_all(&self.payload).await?;
        }
        writer.flush().await
    }
}
