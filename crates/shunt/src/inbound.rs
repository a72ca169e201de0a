//! Inbound call handling: reassemble the request, dispatch, respond.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use shunt_core::{
    CallFlags, CallResHeader, ChecksumType, Frame, ResponseCode, Span, SystemErrCode,
};

use crate::channel::ChannelInner;
use crate::connection::Connection;
use crate::errors::CallError;
use crate::fragment::{write_call_frames, ArgReader, AssembledCall, CallPrefix};

/// A fully-assembled inbound call, handed to a [`CallHandler`].
///
/// [`CallHandler`]: crate::handler::CallHandler
pub struct InboundCall {
    service: String,
    method: String,
    caller: Option<String>,
    arg2: Vec<u8>,
    arg3: Vec<u8>,
    ttl: Duration,
    deadline: tokio::time::Instant,
    response: Option<Response>,
}

impl InboundCall {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Caller service name from the `cn` transport header.
    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    pub fn arg2(&self) -> &[u8] {
        &self.arg2
    }

    pub fn arg3(&self) -> &[u8] {
        &self.arg3
    }

    /// The TTL the caller declared for this call.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Absolute deadline derived from the TTL at arrival.
    pub fn deadline(&self) -> tokio::time::Instant {
        self.deadline
    }

    /// Take the responder. Panics if taken twice.
    pub fn response(&mut self) -> Response {
        self.response
            .take()
            .expect("response already taken for this call")
    }
}

/// Writes the response for one inbound call.
///
/// Every call must be completed exactly one way: a response, a system error,
/// or a blackhole. Dropping a responder without completing it sends an
/// UnexpectedError so the caller is not left hanging.
pub struct Response {
    conn: Arc<Connection>,
    id: u32,
    span: Span,
    checksum_type: ChecksumType,
    completed: bool,
}

impl Response {
    fn new(conn: Arc<Connection>, id: u32, span: Span, checksum_type: ChecksumType) -> Self {
        Self {
            conn,
            id,
            span,
            checksum_type,
            completed: false,
        }
    }

    /// Send a successful response.
    pub fn send_ok(self, arg2: &[u8], arg3: &[u8]) -> Result<(), CallError> {
        self.send(ResponseCode::Ok, arg2, arg3)
    }

    /// Send an application-level error (response code byte 1).
    pub fn send_app_error(self, arg2: &[u8], arg3: &[u8]) -> Result<(), CallError> {
        self.send(ResponseCode::AppError, arg2, arg3)
    }

    fn send(mut self, code: ResponseCode, arg2: &[u8], arg3: &[u8]) -> Result<(), CallError> {
        self.completed = true;
        // A gone exchange means the caller cancelled; nobody is listening.
        if self.conn.exchanges.sender(self.id).is_err() {
            return Err(CallError::Cancelled);
        }
        let header = CallResHeader {
            flags: CallFlags::empty(),
            code,
            span: self.span,
            headers: Vec::new(),
            checksum_type: self.checksum_type,
        };
        let frames =
            write_call_frames(&self.conn.pool, self.id, CallPrefix::Res(header), [b"", arg2, arg3])?;
        // Enqueue before removing the exchange: a draining connection closes
        // once its last exchange completes, and these frames must still make
        // the queue.
        let mut result = Ok(());
        for frame in frames {
            if let Err(e) = self.conn.try_send_frame(frame) {
                result = Err(e.into());
                break;
            }
        }
        self.conn.finish_exchange(self.id);
        result
    }

    /// Fail the call with a system error frame.
    pub fn send_system_error(mut self, code: SystemErrCode, message: &str) {
        self.completed = true;
        if self.conn.exchanges.sender(self.id).is_ok() {
            self.conn.send_system_error(self.id, self.span, code, message);
        }
        self.conn.finish_exchange(self.id);
    }

    /// Abandon the call without sending anything. The exchange is cleaned up
    /// immediately; the caller will observe a timeout (or its own
    /// cancellation).
    pub fn blackhole(mut self) {
        self.completed = true;
        self.conn.finish_exchange(self.id);
        debug!(conn_id = self.conn.conn_id, id = self.id, "call blackholed");
    }
}

impl Drop for Response {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        warn!(
            conn_id = self.conn.conn_id,
            id = self.id,
            "handler completed without responding"
        );
        if self.conn.exchanges.sender(self.id).is_ok() {
            self.conn.send_system_error(
                self.id,
                self.span,
                SystemErrCode::UnexpectedError,
                "handler did not produce a response",
            );
        }
        self.conn.finish_exchange(self.id);
    }
}

/// Per-inbound-call task: reassemble the request within its TTL, look up the
/// handler, dispatch, and make sure the call completes exactly once.
pub(crate) async fn run_inbound_call(
    conn: Arc<Connection>,
    channel: Arc<ChannelInner>,
    first: Frame,
    mut rx: mpsc::Receiver<Frame>,
) {
    let id = first.header.id;
    let mut reader = ArgReader::new_request();

    let mut done = match reader.feed(&first) {
        Ok(done) => done,
        Err(e) => {
            reject(&conn, id, e);
            return;
        }
    };
    let ttl = Duration::from_millis(u64::from(reader.ttl_ms().unwrap_or(0)));
    let deadline = tokio::time::Instant::now() + ttl;

    while !done {
        let frame = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_elapsed) => {
                debug!(conn_id = conn.conn_id, id, "request did not complete within its ttl");
                conn.finish_exchange(id);
                return;
            }
            // Exchange removed from under us: cancelled or connection closed.
            Ok(None) => return,
            Ok(Some(frame)) => frame,
        };
        done = match reader.feed(&frame) {
            Ok(done) => done,
            Err(e) => {
                reject(&conn, id, e);
                return;
            }
        };
    }
    drop(rx);

    let (header, [arg1, arg2, arg3]) = match reader.finish() {
        Ok(AssembledCall::Request { header, args }) => (header, args),
        Ok(AssembledCall::Response { .. }) | Err(_) => {
            reject(&conn, id, CallError::Protocol("request assembly failed".into()));
            return;
        }
    };

    let method = String::from_utf8_lossy(&arg1).into_owned();
    let caller = header
        .headers
        .iter()
        .find(|(k, _)| k == shunt_core::transport_headers::CALLER_NAME)
        .map(|(_, v)| v.clone());

    let response = Response::new(
        conn.clone(),
        id,
        header.span,
        channel.config.checksum_type,
    );

    let Some(handler) = channel.handlers.get(&method) else {
        debug!(conn_id = conn.conn_id, id, method = %method, "no handler for method");
        response.send_system_error(
            SystemErrCode::BadRequest,
            &format!("no handler for method {method:?}"),
        );
        return;
    };

    let call = InboundCall {
        service: header.service,
        method,
        caller,
        arg2,
        arg3,
        ttl,
        deadline,
        response: Some(response),
    };

    // A panicking handler must not leave the caller hanging; the responder's
    // drop guard answers with UnexpectedError.
    if AssertUnwindSafe(handler.handle(call)).catch_unwind().await.is_err() {
        warn!(conn_id = conn.conn_id, id, "handler panicked");
    }
}

fn reject(conn: &Arc<Connection>, id: u32, err: CallError) {
    debug!(conn_id = conn.conn_id, id, error = %err, "rejecting inbound call");
    // Answer first, then remove: once the last exchange goes a draining
    // connection may close, and the error frame must still make the queue.
    if conn.exchanges.sender(id).is_ok() {
        conn.send_system_error(id, Span::default(), err.code(), &err.to_string());
    }
    conn.finish_exchange(id);
}
