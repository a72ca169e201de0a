//! Init handshake bodies.
//!
//! The first exchange on every connection: the dialing side sends init-req,
//! the accepting side answers init-res. Both carry a protocol version and a
//! block of key/value headers identifying the peer.

use crate::CodecError;

/// Current protocol version.
pub const PROTOCOL_VERSION: u16 = 2;

/// Host:port advertised by peers that accept no inbound connections.
pub const EPHEMERAL_HOST_PORT: &str = "0.0.0.0:0";

/// Well-known init header keys.
pub mod init_headers {
    pub const HOST_PORT: &str = "host_port";
    pub const PROCESS_NAME: &str = "process_name";
    pub const LANGUAGE: &str = "language";
    pub const VERSION: &str = "version";
}

/// Body of init-req and init-res frames:
/// `version:u16 nh:u16 (key~2 value~2)*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitBody {
    pub version: u16,
    pub headers: Vec<(String, String)>,
}

impl InitBody {
    /// Build an init body advertising this process.
    pub fn new(host_port: &str, process_name: &str) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            headers: vec![
                (init_headers::HOST_PORT.to_owned(), host_port.to_owned()),
                (
                    init_headers::PROCESS_NAME.to_owned(),
                    process_name.to_owned(),
                ),
                (init_headers::LANGUAGE.to_owned(), "rust".to_owned()),
                (
                    init_headers::VERSION.to_owned(),
                    env!("CARGO_PKG_VERSION").to_owned(),
                ),
            ],
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), CodecError> {
        buf.extend_from_slice(&self.version.to_be_bytes());
        if self.headers.len() > u16::MAX as usize {
            return Err(CodecError::FieldTooLong("init header count"));
        }
        buf.extend_from_slice(&(self.headers.len() as u16).to_be_bytes());
        for (key, value) in &self.headers {
            for field in [key.as_bytes(), value.as_bytes()] {
                if field.len() > u16::MAX as usize {
                    return Err(CodecError::FieldTooLong("init header"));
                }
                buf.extend_from_slice(&(field.len() as u16).to_be_bytes());
                buf.extend_from_slice(field);
            }
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut off = 0usize;
        let take_u16 = |buf: &[u8], off: &mut usize| -> Result<u16, CodecError> {
            if buf.len() < *off + 2 {
                return Err(CodecError::Truncated("init body"));
            }
            let v = u16::from_be_bytes([buf[*off], buf[*off + 1]]);
            *off += 2;
            Ok(v)
        };

        let version = take_u16(buf, &mut off)?;
        let nh = take_u16(buf, &mut off)?;
        let mut headers = Vec::with_capacity(nh as usize);
        for _ in 0..nh {
            let mut fields = [String::new(), String::new()];
            for field in fields.iter_mut() {
                let len = take_u16(buf, &mut off)? as usize;
                if buf.len() < off + len {
                    return Err(CodecError::Truncated("init header"));
                }
                *field = std::str::from_utf8(&buf[off..off + len])
                    .map_err(|_| CodecError::InvalidUtf8("init header"))?
                    .to_owned();
                off += len;
            }
            let [key, value] = fields;
            headers.push((key, value));
        }
        Ok(Self { version, headers })
    }

    fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn host_port(&self) -> Result<&str, CodecError> {
        self.header(init_headers::HOST_PORT)
            .ok_or(CodecError::MissingInitHeader(init_headers::HOST_PORT))
    }

    pub fn process_name(&self) -> Result<&str, CodecError> {
        self.header(init_headers::PROCESS_NAME)
            .ok_or(CodecError::MissingInitHeader(init_headers::PROCESS_NAME))
    }

    pub fn is_ephemeral(&self) -> bool {
        self.header(init_headers::HOST_PORT) == Some(EPHEMERAL_HOST_PORT)
    }
}
