//! shunt: a multiplexed, bidirectional framed RPC transport over TCP with a
//! frame-level relay.
//!
//! One TCP connection carries calls in both directions at once, multiplexed
//! by message id; arguments stream across frames. A channel configured with
//! a [`RelayHost`] forwards call frames between a caller-facing connection
//! and a backend-facing connection without decoding bodies past the method
//! name.
//!
//! # Layering
//!
//! ```text
//!   Channel ──────────── listener, dialer, handlers, relay host
//!     │
//!   Connection ───────── handshake, FSM, read/send loops, exchanges
//!     │
//!   shunt-core ────────── frames, checksums, body codecs, frame pool
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use shunt::{CallOptions, Channel, ChannelConfig, HandlerFn};
//!
//! let server = Channel::new(ChannelConfig::new("echo-svc"))?;
//! server.register(
//!     "echo",
//!     Arc::new(HandlerFn(|mut call: shunt::InboundCall| async move {
//!         let (arg2, arg3) = (call.arg2().to_vec(), call.arg3().to_vec());
//!         let _ = call.response().send_ok(&arg2, &arg3);
//!     })),
//! );
//! let addr = server.listen("127.0.0.1:0").await?;
//!
//! let client = Channel::new(ChannelConfig::new("echo-client"))?;
//! let response = client
//!     .call(&addr.to_string(), &CallOptions::new("echo-svc", "echo"), b"hdr", b"body")
//!     .await?;
//! assert_eq!(response.arg3, b"body");
//! ```

mod channel;
mod config;
mod connection;
mod errors;
mod exchange;
mod fragment;
mod handler;
mod inbound;
mod outbound;
mod peers;
pub mod relay;
mod stats;

pub use channel::Channel;
pub use config::{
    BoxFuture, CallOptions, ChannelConfig, ConnObserver, Dialer, SendBufferSizeOverride,
};
pub use connection::{Connection, ConnectionState};
pub use errors::{CallError, ChannelError, ConnectionError, SendError};
pub use exchange::{CallDirection, ExchangeError, ExchangeSet};
pub use handler::{CallHandler, HandlerFn};
pub use inbound::{InboundCall, Response};
pub use outbound::CallResponse;
pub use peers::{Direction, PeerInfo, PeerStatusCallback, PeerStatusChange};
pub use relay::{
    FrameFn, RelayCall, RelayConnInfo, RelayHost, RelayStart, RelayStartError, RelayTimerPool,
};
pub use stats::{stat_keys, NoopStats, StatsReporter};

// Re-export the wire layer for callers that build or inspect raw frames.
pub use shunt_core as core;
