//! Outbound calls: stream the request, await the response.

use std::sync::Arc;

use tracing::debug;

use shunt_core::{
    CallFlags, CallReqHeader, CancelBody, ErrorBody, Frame, FrameHeader, MessageType, ResponseCode,
    Span, SystemErrCode,
};

use crate::config::CallOptions;
use crate::connection::Connection;
use crate::errors::CallError;
use crate::exchange::{CallDirection, ExchangeError};
use crate::fragment::{write_call_frames, ArgReader, AssembledCall, CallPrefix};

/// Terminal result of an outbound call.
#[derive(Debug)]
pub struct CallResponse {
    /// False when the callee flagged an application error (code byte 1).
    pub ok: bool,
    pub arg2: Vec<u8>,
    pub arg3: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

/// Removes the exchange on every exit path that did not already remove it.
struct ExchangeGuard<'a> {
    conn: &'a Connection,
    id: u32,
}

impl Drop for ExchangeGuard<'_> {
    fn drop(&mut self) {
        self.conn.finish_exchange(self.id);
    }
}

pub(crate) async fn send_outbound_call(
    conn: &Arc<Connection>,
    caller_name: &str,
    checksum_type: shunt_core::ChecksumType,
    opts: &CallOptions,
    arg2: &[u8],
    arg3: &[u8],
) -> Result<CallResponse, CallError> {
    if !conn.is_active() {
        return Err(CallError::ConnectionClosed);
    }

    let id = conn.next_message_id();
    let mut rx = conn
        .exchanges
        .add(id, CallDirection::Outbound)
        .map_err(|e| match e {
            ExchangeError::Closed => CallError::ConnectionClosed,
            other => CallError::Protocol(other.to_string()),
        })?;
    let _guard = ExchangeGuard {
        conn: conn.as_ref(),
        id,
    };

    let span = Span::new_root();
    let mut headers = vec![
        (
            shunt_core::transport_headers::ARG_SCHEME.to_owned(),
            opts.arg_scheme.as_str().to_owned(),
        ),
        (
            shunt_core::transport_headers::CALLER_NAME.to_owned(),
            caller_name.to_owned(),
        ),
    ];
    headers.extend(opts.headers.iter().cloned());

    let header = CallReqHeader {
        flags: CallFlags::empty(),
        ttl_ms: opts.ttl.as_millis().min(u128::from(u32::MAX)) as u32,
        span,
        service: opts.service.clone(),
        headers,
        checksum_type,
    };

    let frames = write_call_frames(
        &conn.pool,
        id,
        CallPrefix::Req(header),
        [opts.method.as_bytes(), arg2, arg3],
    )?;
    for frame in frames {
        conn.try_send_frame(frame)?;
    }

    let deadline = tokio::time::Instant::now() + opts.ttl;
    let mut reader = ArgReader::new_response();
    loop {
        let frame = match tokio::time::timeout_at(deadline, rx.recv()).await {
            Err(_elapsed) => {
                debug!(conn_id = conn.conn_id, id, "call timed out, sending cancel");
                send_cancel(conn, id, span, "deadline exceeded");
                return Err(CallError::Timeout);
            }
            Ok(None) => {
                return Err(match conn.exchanges.close_code() {
                    SystemErrCode::Cancelled => CallError::Cancelled,
                    _ => CallError::ConnectionClosed,
                });
            }
            Ok(Some(frame)) => frame,
        };

        if frame.header.message_type == MessageType::Error {
            let body = ErrorBody::decode(frame.payload())?;
            return Err(CallError::Remote {
                code: body.code,
                message: body.message,
            });
        }
        if reader.feed(&frame)? {
            break;
        }
    }

    match reader.finish()? {
        AssembledCall::Response { header, args } => {
            let [_, arg2, arg3] = args;
            Ok(CallResponse {
                ok: header.code == ResponseCode::Ok,
                arg2,
                arg3,
                headers: header.headers,
            })
        }
        AssembledCall::Request { .. } => {
            Err(CallError::Protocol("assembled a request as a response".into()))
        }
    }
}

/// Best-effort cancel frame toward the callee.
fn send_cancel(conn: &Connection, id: u32, span: Span, why: &str) {
    let mut buf = conn.pool.get();
    let body = CancelBody::new(span, why);
    if body.encode(&mut buf).is_err() {
        return;
    }
    let frame = Frame::from_parts(FrameHeader::new(MessageType::Cancel, id), buf);
    if let Err(e) = conn.try_send_frame(frame) {
        debug!(conn_id = conn.conn_id, id, error = %e, "cancel frame dropped");
    }
}
