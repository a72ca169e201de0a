//! Relay host contract.
//!
//! The relay host is the environment's policy surface: it picks a
//! destination per call and owns the call's stats scope. The core consumes
//! these traits and never implements policy itself.

use std::sync::Arc;

use shunt_core::{Arg2Error, LazyCallReq, LazyCallRes, SystemErrCode};

/// Metadata about the caller-facing connection, passed to the host.
#[derive(Debug, Clone)]
pub struct RelayConnInfo {
    pub remote_host_port: String,
    pub remote_process_name: String,
    pub is_ephemeral: bool,
}

/// Why the host refused a call.
#[derive(Debug)]
pub enum RelayStartError {
    /// Reply with an error frame of this kind.
    System(SystemErrCode, String),
    /// Unknown failure: the relay declines the call.
    Other(String),
}

/// Host decision for one inbound call-req.
pub enum RelayStart {
    /// Forward toward `call.destination()`.
    Forward(Box<dyn RelayCall>),
    /// Silently drop the frame (rate limiting); the caller times out.
    Drop,
    /// Refuse the call. `call`, when present, still receives the failure
    /// stats.
    Fail {
        call: Option<Box<dyn RelayCall>>,
        err: RelayStartError,
    },
}

/// Chooses destinations and scopes per-call stats.
pub trait RelayHost: Send + Sync {
    fn start(&self, frame: &LazyCallReq<'_>, conn: &RelayConnInfo) -> RelayStart;
}

/// Per-forwarded-call stats scope.
///
/// All methods default to no-ops so hosts only implement what they track.
pub trait RelayCall: Send + Sync {
    /// Destination host:port, or `None` when the host failed to pick one.
    fn destination(&self) -> Option<String>;

    /// Bytes forwarded toward the destination (request frames).
    fn sent_bytes(&self, _n: u64) {}

    /// Bytes forwarded back toward the caller (response frames).
    fn received_bytes(&self, _n: u64) {}

    /// Invoked with the first response frame's metadata.
    fn call_response(&self, _frame: &LazyCallRes<'_>) {}

    fn succeeded(&self) {}

    fn failed(&self, _reason: &str) {}

    /// The call's stats scope is finished; no further calls follow.
    fn end(&self) {}
}

/// Side-channel hook for inspecting or mutating arg2 on forwarded call-req
/// frames. Only legal for unfragmented Thrift arg2.
pub type FrameFn =
    Arc<dyn Fn(&mut LazyCallReq<'_>, &RelayConnInfo) -> Result<(), Arg2Error> + Send + Sync>;
