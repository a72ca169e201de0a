//! shunt-core: wire-level types for the shunt RPC transport.
//!
//! This crate defines:
//! - Frame header codec and owned frames ([`FrameHeader`], [`Frame`])
//! - Pooled frame buffers ([`FramePool`], [`PooledBuf`])
//! - Checksums over frame arg regions ([`ChecksumType`])
//! - Init handshake bodies ([`InitBody`])
//! - Call request/response body prefixes ([`CallReqHeader`], [`CallResHeader`])
//! - Lazy views used by the relay ([`LazyCallReq`], [`LazyCallRes`])
//! - System error codes and codec errors ([`SystemErrCode`], [`CodecError`])
//!
//! Everything above framing (connections, exchanges, the relay) lives in the
//! `shunt` crate.

mod call;
mod checksum;
mod control;
mod errors;
mod frame;
mod init;
mod lazy;
mod pool;
mod span;

pub use call::*;
pub use checksum::*;
pub use control::*;
pub use errors::*;
pub use frame::*;
pub use init::*;
pub use lazy::*;
pub use pool::*;
pub use span::*;
