//! The relay forwarding path.
//!
//! A relay channel forwards call frames between a caller-facing connection
//! and a backend-facing connection without decoding bodies. Per call-req:
//!
//! 1. the relay host picks a destination (or refuses the call),
//! 2. an outbound connection is acquired (dials coalesce per destination),
//! 3. a fresh id is allocated there and twinned relay items are installed
//!    on both connections, with timers clamped to the relay's max timeout,
//! 4. the frame's id (and, when clamped, TTL) is rewritten and the frame is
//!    enqueued on the outbound send loop,
//! 5. subsequent frames of the call are forwarded by item lookup; the
//!    terminal response finishes both items,
//! 6. a timer fire injects a timeout error toward the caller and leaves
//!    tombstones to absorb the late response.
//!
//! Cancel frames are not forwarded to the backend: the backend call
//! completes or times out on its own. This mirrors the original behavior
//! and is deliberate.

mod host;
mod items;
mod timer;

pub use host::{FrameFn, RelayCall, RelayConnInfo, RelayHost, RelayStart, RelayStartError};
pub(crate) use items::{RelayItem, RelayItems, RelayRoute};
pub(crate) use timer::TimerTrigger;
pub use timer::{RelayTimer, RelayTimerPool};

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use shunt_core::{
    ErrorBody, Frame, LazyCallReq, LazyCallRes, MessageType, Span, SystemErrCode,
};

use crate::channel::ChannelInner;
use crate::connection::Connection;
use crate::stats::stat_keys;

/// Channel-wide relay state.
pub(crate) struct RelayContext {
    pub host: Arc<dyn RelayHost>,
    pub timer_pool: Arc<RelayTimerPool>,
    pub frame_fn: Option<FrameFn>,
}

impl RelayContext {
    pub fn new(
        host: Arc<dyn RelayHost>,
        frame_fn: Option<FrameFn>,
        verify_timers: bool,
    ) -> Self {
        let trigger: TimerTrigger = Arc::new(|items, id, is_originator| {
            items.on_timer_fire(id, is_originator);
        });
        Self {
            host,
            timer_pool: RelayTimerPool::new(trigger, verify_timers),
            frame_fn,
        }
    }
}

/// Entry point from the read loop for call-scope frames on relay channels.
pub(crate) async fn handle_frame(
    channel: &Arc<ChannelInner>,
    conn: &Arc<Connection>,
    frame: Frame,
) {
    match frame.header.message_type {
        MessageType::CallReq => handle_call_req(channel, conn, frame).await,
        _ => handle_in_flight(channel, conn, frame).await,
    }
}

enum ReqDecision {
    /// The service is handled by this channel itself.
    Local,
    /// Refused, dropped, or already answered.
    Done,
    Forward {
        dest: String,
        span: Span,
        call: Arc<dyn RelayCall>,
    },
}

async fn handle_call_req(channel: &Arc<ChannelInner>, conn: &Arc<Connection>, mut frame: Frame) {
    let relay = channel.relay.as_ref().expect("relay context on relay channel");
    let id = frame.header.id;

    let conn_info = RelayConnInfo {
        remote_host_port: conn.remote_peer().host_port.clone(),
        remote_process_name: conn.remote_peer().process_name.clone(),
        is_ephemeral: conn.remote_peer().is_ephemeral,
    };

    let decision = {
        let mut req = match LazyCallReq::new(&mut frame) {
            Ok(req) => req,
            Err(e) => {
                conn.send_system_error(
                    id,
                    Span::default(),
                    SystemErrCode::BadRequest,
                    &format!("malformed call request: {e}"),
                );
                return;
            }
        };
        let span = req.span();
        let service = String::from_utf8_lossy(req.service()).into_owned();

        if channel.config.relay_local_handlers.contains(&service) {
            ReqDecision::Local
        } else if !conn.is_active() {
            channel.stats.inc(stat_keys::RELAY_CLIENT_CONN_INACTIVE, 1);
            conn.send_system_error(
                id,
                span,
                SystemErrCode::Declined,
                "relay connection is not active",
            );
            ReqDecision::Done
        } else {
            match relay.host.start(&req, &conn_info) {
                RelayStart::Drop => {
                    // Rate-limited: drop the frame, let the caller time out.
                    channel.stats.inc(stat_keys::RELAY_DROPPED, 1);
                    debug!(id, service = %service, "relay dropped call");
                    ReqDecision::Done
                }
                RelayStart::Fail { call, err } => {
                    let (code, message, key) = match err {
                        RelayStartError::System(code, message) => {
                            let key =
                                format!("{}{}", stat_keys::RELAY_PREFIX, code.stat_name());
                            (code, message, key)
                        }
                        RelayStartError::Other(message) => (
                            SystemErrCode::Declined,
                            message,
                            stat_keys::RELAY_DECLINED.to_owned(),
                        ),
                    };
                    channel.stats.inc(&key, 1);
                    if let Some(call) = call {
                        call.failed(&key);
                        call.end();
                    }
                    conn.send_system_error(id, span, code, &message);
                    ReqDecision::Done
                }
                RelayStart::Forward(call) => match call.destination() {
                    None => {
                        channel.stats.inc(stat_keys::RELAY_BAD_RELAY_HOST, 1);
                        call.failed(stat_keys::RELAY_BAD_RELAY_HOST);
                        call.end();
                        conn.send_system_error(
                            id,
                            span,
                            SystemErrCode::Declined,
                            "relay host returned no destination",
                        );
                        ReqDecision::Done
                    }
                    Some(dest) => {
                        let call: Arc<dyn RelayCall> = Arc::from(call);

                        // Clamp the forwarded deadline; the backend must
                        // observe the clamped TTL, so rewrite it in place.
                        if let Some(max) = channel.config.relay_max_timeout {
                            let max_ms = max.as_millis().min(u128::from(u32::MAX)) as u32;
                            if req.ttl_ms() > max_ms {
                                req.set_ttl_ms(max_ms);
                            }
                        }

                        match &relay.frame_fn {
                            Some(frame_fn) => match frame_fn(&mut req, &conn_info) {
                                Ok(()) => ReqDecision::Forward { dest, span, call },
                                Err(e) => {
                                    channel.stats.inc(stat_keys::RELAY_ARG2_MODIFY_FAILED, 1);
                                    call.failed(stat_keys::RELAY_ARG2_MODIFY_FAILED);
                                    call.end();
                                    conn.send_system_error(
                                        id,
                                        span,
                                        SystemErrCode::UnexpectedError,
                                        &format!("relay-arg2-modify-failed: {e}"),
                                    );
                                    ReqDecision::Done
                                }
                            },
                            None => ReqDecision::Forward { dest, span, call },
                        }
                    }
                },
            }
        }
    };

    match decision {
        ReqDecision::Local => Connection::handle_call_req_local(conn, channel, frame),
        ReqDecision::Done => {}
        ReqDecision::Forward { dest, span, call } => {
            forward_call_req(channel, conn, frame, span, dest, call).await;
        }
    }
}

async fn forward_call_req(
    channel: &Arc<ChannelInner>,
    conn: &Arc<Connection>,
    mut frame: Frame,
    span: Span,
    dest: String,
    call: Arc<dyn RelayCall>,
) {
    let relay = channel.relay.as_ref().expect("relay context on relay channel");
    let id_in = frame.header.id;

    // Concurrent calls racing on the same destination share one dial.
    let dest_conn = match ChannelInner::get_connection(
        channel,
        &dest,
        channel.config.relay_max_connection_timeout,
    )
    .await
    {
        Ok(dest_conn) => dest_conn,
        Err(e) => {
            warn!(dest = %dest, error = %e, "relay could not reach destination");
            let key = format!(
                "{}{}",
                stat_keys::RELAY_PREFIX,
                SystemErrCode::NetworkError.stat_name()
            );
            channel.stats.inc(&key, 1);
            call.failed(&key);
            call.end();
            conn.send_system_error(
                id_in,
                span,
                SystemErrCode::NetworkError,
                &format!("relay could not reach {dest}: {e}"),
            );
            return;
        }
    };

    let caller_items = conn.relay_items.as_ref().expect("relay items on relay channel");
    let dest_items = dest_conn
        .relay_items
        .as_ref()
        .expect("relay items on relay channel");

    let id_out = dest_conn.next_message_id();
    // Read the (possibly clamped) TTL back off the frame.
    let ttl = {
        let req = LazyCallReq::new(&mut frame).expect("validated call request");
        Duration::from_millis(u64::from(req.ttl_ms()))
    };

    let caller_item = RelayItem {
        remote_id: id_out,
        destination: Arc::downgrade(&dest_conn),
        timer: Some(relay.timer_pool.clone().get()),
        tomb: false,
        is_originator: true,
        call: Some(call.clone()),
    };
    if caller_items.add(id_in, caller_item).is_err() {
        warn!(conn_id = conn.conn_id, id = id_in, "duplicate relayed call id");
        call.failed(&format!(
            "{}{}",
            stat_keys::RELAY_PREFIX,
            SystemErrCode::BadRequest.stat_name()
        ));
        call.end();
        conn.send_system_error(
            id_in,
            span,
            SystemErrCode::BadRequest,
            &format!("inbound call with id {id_in} is already active"),
        );
        return;
    }

    let dest_item = RelayItem {
        remote_id: id_in,
        destination: Arc::downgrade(conn),
        timer: Some(relay.timer_pool.clone().get()),
        tomb: false,
        is_originator: false,
        call: Some(call.clone()),
    };
    if dest_items.add(id_out, dest_item).is_err() {
        // Ids on the outbound side are relay-allocated and cannot collide.
        error!(id_out, "relay id collision on destination connection");
        caller_items.finish(id_in);
        call.failed(&format!(
            "{}{}",
            stat_keys::RELAY_PREFIX,
            SystemErrCode::UnexpectedError.stat_name()
        ));
        call.end();
        conn.send_system_error(
            id_in,
            span,
            SystemErrCode::UnexpectedError,
            "relay id collision",
        );
        return;
    }

    caller_items.clone().arm(id_in, ttl);
    dest_items.clone().arm(id_out, ttl);

    frame.header.id = id_out;
    let size = u64::from(frame.header.size);
    match dest_conn.try_send_frame(frame) {
        Ok(()) => {
            call.sent_bytes(size);
            debug!(
                id_in,
                id_out,
                dest = %dest,
                ttl_ms = ttl.as_millis() as u64,
                "relaying call"
            );
        }
        Err(_) => {
            channel.stats.inc(stat_keys::RELAY_DEST_CONN_SLOW, 1);
            call.failed(stat_keys::RELAY_DEST_CONN_SLOW);
            call.end();
            finish_pair(caller_items, id_in);
            conn.send_system_error(
                id_in,
                span,
                SystemErrCode::Busy,
                "relay destination connection is slow",
            );
        }
    }
}

/// Frames for calls that already have relay items: continuations, responses,
/// errors and cancels.
async fn handle_in_flight(
    channel: &Arc<ChannelInner>,
    conn: &Arc<Connection>,
    frame: Frame,
) {
    let items = conn.relay_items.as_ref().expect("relay items on relay channel");
    let id = frame.header.id;

    let (remote_id, destination, call, is_originator) = match items.route(id) {
        RelayRoute::Missing => {
            // Frames for the channel's own calls and local handlers still
            // have an exchange; those stay on the local paths. Anything else
            // is late traffic for an item that no longer exists (tombstone
            // evicted on overflow, or never installed).
            if conn.exchanges.sender(id).is_ok() {
                Connection::handle_local_frame(conn, channel, frame).await;
            } else {
                warn!(
                    conn_id = conn.conn_id,
                    id,
                    message_type = ?frame.header.message_type,
                    "no relay item"
                );
                channel.stats.inc(stat_keys::RELAY_NO_ITEM, 1);
            }
            return;
        }
        RelayRoute::Tombstone => {
            channel.stats.inc(stat_keys::RELAY_DROPPED, 1);
            debug!(conn_id = conn.conn_id, id, "late frame absorbed by tombstone");
            return;
        }
        RelayRoute::Found {
            remote_id,
            destination,
            call,
            is_originator,
        } => (remote_id, destination, call, is_originator),
    };

    match frame.header.message_type {
        MessageType::Cancel => {
            // Not forwarded: the backend completes or times out naturally.
            // Tombstone the backend side so its late response dies quietly.
            debug!(conn_id = conn.conn_id, id, "relayed call cancelled by caller");
            if let Some(finished) = items.finish(id) {
                if let Some(dest_conn) = finished.destination.upgrade() {
                    if let Some(dest_items) = &dest_conn.relay_items {
                        dest_items.clone().entomb(finished.remote_id);
                    }
                }
                if let Some(call) = finished.call {
                    call.failed("cancelled");
                    call.end();
                }
            }
        }
        MessageType::Error => {
            let code = ErrorBody::decode(frame.payload())
                .map(|body| body.code)
                .unwrap_or(SystemErrCode::UnexpectedError);
            if let Some(call) = &call {
                call.failed(&format!("{}{}", stat_keys::RELAY_PREFIX, code.stat_name()));
                call.end();
            }
            finish_pair(items, id);
            let _ = forward(channel, frame, remote_id, &destination, is_originator);
        }
        MessageType::CallRes => {
            match LazyCallRes::new(&frame) {
                Ok(res) => {
                    if let Some(call) = &call {
                        call.call_response(&res);
                    }
                }
                Err(e) => {
                    error!(conn_id = conn.conn_id, id, cause = %e, "Malformed callRes frame.");
                    if let Some(finished) = finish_pair(items, id) {
                        if let Some(caller_conn) = finished.destination.upgrade() {
                            caller_conn.send_system_error(
                                finished.remote_id,
                                Span::default(),
                                SystemErrCode::UnexpectedError,
                                "malformed response from relay destination",
                            );
                        }
                    }
                    if let Some(call) = &call {
                        call.failed("relay-malformed-response");
                        call.end();
                    }
                    return;
                }
            }
            forward_response_frame(channel, conn, items, frame, remote_id, &destination, &call, is_originator);
        }
        MessageType::CallReqContinue | MessageType::CallResContinue => {
            forward_response_frame(channel, conn, items, frame, remote_id, &destination, &call, is_originator);
        }
        other => {
            debug!(conn_id = conn.conn_id, id, ?other, "unexpected relayed frame type");
        }
    }
}

/// Forward a response or continuation frame for an in-flight relayed call,
/// accounting bytes and finishing the item pair on a terminal frame or a
/// forwarding failure.
#[allow(clippy::too_many_arguments)]
fn forward_response_frame(
    channel: &Arc<ChannelInner>,
    conn: &Arc<Connection>,
    items: &Arc<RelayItems>,
    frame: Frame,
    remote_id: u32,
    destination: &std::sync::Weak<Connection>,
    call: &Option<Arc<dyn RelayCall>>,
    is_originator: bool,
) {
    let id = frame.header.id;
    let terminal = frame.finishes_call();
    let size = u64::from(frame.header.size);
    match forward(channel, frame, remote_id, destination, is_originator) {
        ForwardOutcome::Sent => {
            if let Some(call) = call {
                if is_originator {
                    call.sent_bytes(size);
                } else {
                    call.received_bytes(size);
                }
            }
            if terminal {
                finish_pair(items, id);
                if let Some(call) = call {
                    call.succeeded();
                    call.end();
                }
            }
        }
        ForwardOutcome::Gone => {
            debug!(conn_id = conn.conn_id, id, "relay twin gone, failing call");
            finish_pair(items, id);
            if let Some(call) = call {
                call.failed("relay-conn-closed");
                call.end();
            }
        }
        ForwardOutcome::Slow(key) => {
            finish_pair(items, id);
            if let Some(call) = call {
                call.failed(key);
                call.end();
            }
        }
    }
}

enum ForwardOutcome {
    Sent,
    /// The twin connection no longer exists.
    Gone,
    /// The twin's send queue was full; carries the stat key recorded.
    Slow(&'static str),
}

/// Rewrite the frame id and enqueue it on the twin connection.
fn forward(
    channel: &Arc<ChannelInner>,
    mut frame: Frame,
    remote_id: u32,
    destination: &std::sync::Weak<Connection>,
    is_originator: bool,
) -> ForwardOutcome {
    let Some(twin) = destination.upgrade() else {
        debug!(remote_id, "relay twin connection is gone, dropping frame");
        channel.stats.inc(stat_keys::RELAY_DROPPED, 1);
        return ForwardOutcome::Gone;
    };
    frame.header.id = remote_id;
    match twin.try_send_frame(frame) {
        Ok(()) => ForwardOutcome::Sent,
        Err(_) => {
            let key = if is_originator {
                stat_keys::RELAY_DEST_CONN_SLOW
            } else {
                stat_keys::RELAY_SOURCE_CONN_SLOW
            };
            channel.stats.inc(key, 1);
            warn!(remote_id, key, "relay twin connection is slow, dropping frame");
            ForwardOutcome::Slow(key)
        }
    }
}

/// Finish this side's item and its twin.
fn finish_pair(items: &Arc<RelayItems>, id: u32) -> Option<items::FinishedItem> {
    let finished = items.finish(id)?;
    if let Some(twin_conn) = finished.destination.upgrade() {
        if let Some(twin_items) = &twin_conn.relay_items {
            twin_items.finish(finished.remote_id);
        }
    }
    Some(finished)
}
