//! One TCP connection: handshake, lifecycle FSM, read and send loops.
//!
//! Each connection is symmetric: it carries calls in both directions at
//! once, multiplexed by message id. The side that sent init-req allocates
//! odd ids; the accepting side allocates even ids. Per connection exactly
//! three long-lived tasks run:
//!
//! ```text
//!   read loop ──▶ protocol handler (id 0xFFFFFFFF)
//!            ├──▶ relay forwarder (relay channels)
//!            └──▶ exchange table ──▶ call tasks
//!
//!   call tasks ──try_send──▶ bounded send queue ──▶ send loop ──▶ socket
//!
//!   maintenance ──▶ idle sweep, close-stage timeout
//! ```
//!
//! The read loop never blocks on the send queue: every enqueue is
//! non-blocking, and a full queue drops the frame with a "slow connection"
//! event instead.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use shunt_core::{
    CancelBody, ClaimBody, ErrorBody, Frame, FrameHeader, FramePool, InitBody, LazyCallReq,
    MessageType, Span, SystemErrCode, ID_PROTOCOL, PROTOCOL_VERSION,
};

use crate::channel::ChannelInner;
use crate::config::BoxFuture;
use crate::errors::{ConnectionError, SendError};
use crate::exchange::{CallDirection, ExchangeError, ExchangeSet};
use crate::peers::{Direction, PeerInfo};
use crate::relay::RelayItems;
use crate::stats::stat_keys;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const MAINTENANCE_TICK: Duration = Duration::from_millis(250);
/// How long a connection may sit in InboundClosed before it is forced shut.
const CLOSE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection lifecycle states.
///
/// The two waiting states cover the init handshake, which runs inline on the
/// establishing task before the loops start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting side, waiting for the peer's init-req.
    WaitingInitReq,
    /// Dialing side, init-req sent, waiting for init-res.
    WaitingInitRes,
    Active,
    /// Locally closing: new calls are refused, in-flight calls drain.
    StartClose,
    /// No more inbound frames will be processed; queued writes flush.
    InboundClosed,
    Closed,
}

/// One established connection.
pub struct Connection {
    pub(crate) conn_id: u64,
    direction: Direction,
    local_peer: PeerInfo,
    remote_peer: PeerInfo,

    state: Mutex<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,

    pub(crate) exchanges: ExchangeSet,
    send_tx: mpsc::Sender<Frame>,
    next_message_id: AtomicU32,

    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    epoch: Instant,

    pub(crate) pool: FramePool,
    pub(crate) channel: Weak<ChannelInner>,
    pub(crate) relay_items: Option<Arc<RelayItems>>,
}

impl Connection {
    /// Run the init handshake on `stream`, then start the connection's
    /// loops.
    // Returns an explicitly boxed future rather than `async fn` because the
    // relay path can recurse back into this call (read_loop -> handle_frame
    // -> get_connection -> establish), and an opaque `impl Future` return
    // type can't be defined recursively.
    pub(crate) fn establish<S>(
        stream: S,
        direction: Direction,
        channel: Arc<ChannelInner>,
    ) -> BoxFuture<'static, Result<Arc<Connection>, ConnectionError>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Box::pin(Self::establish_inner(stream, direction, channel))
    }

    async fn establish_inner<S>(
        stream: S,
        direction: Direction,
        channel: Arc<ChannelInner>,
    ) -> Result<Arc<Connection>, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = stream;
        let pool = channel.pool.clone();
        let local_host_port = channel.local_host_port();
        let local_init = InitBody::new(&local_host_port, &channel.config.process_name);

        let remote_init = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            Self::handshake(&mut stream, direction, &local_init, &pool),
        )
        .await
        .map_err(|_| ConnectionError::Handshake("timed out".into()))??;

        let remote_peer = PeerInfo {
            host_port: remote_init.host_port()?.to_owned(),
            process_name: remote_init.process_name()?.to_owned(),
            is_ephemeral: remote_init.is_ephemeral(),
        };
        let local_peer = PeerInfo {
            host_port: local_init.host_port()?.to_owned(),
            process_name: local_init.process_name()?.to_owned(),
            is_ephemeral: local_init.is_ephemeral(),
        };

        // The send-queue capacity depends on the remote process name, which
        // is only known now that the handshake is done.
        let capacity = channel
            .config
            .send_buffer_size_for(&remote_peer.process_name)
            .max(1);
        let (send_tx, send_rx) = mpsc::channel(capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Active);
        let (shutdown_tx, _) = watch::channel(false);

        let conn_id = channel.next_conn_id();
        let relay_enabled = channel.relay.is_some();
        let max_tombs = channel.config.relay_max_tombs;

        let conn = Arc::new_cyclic(|weak: &Weak<Connection>| Connection {
            conn_id,
            direction,
            local_peer,
            remote_peer,
            state: Mutex::new(ConnectionState::Active),
            state_tx,
            shutdown_tx,
            exchanges: ExchangeSet::new(),
            send_tx,
            next_message_id: AtomicU32::new(match direction {
                Direction::Outbound => 1,
                Direction::Inbound => 2,
            }),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            pool,
            channel: Arc::downgrade(&channel),
            relay_items: relay_enabled.then(|| RelayItems::new(weak.clone(), max_tombs)),
        });

        debug!(
            conn_id,
            ?direction,
            remote = %conn.remote_peer.host_port,
            remote_process = %conn.remote_peer.process_name,
            send_capacity = capacity,
            "connection established"
        );

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(Self::read_loop(
            conn.clone(),
            channel.clone(),
            Box::new(read_half),
        ));
        tokio::spawn(Self::send_loop(conn.clone(), send_rx, Box::new(write_half)));
        tokio::spawn(Self::maintenance_loop(conn.clone()));

        if let Some(observer) = &channel.config.on_conn {
            observer(&conn);
        }
        Ok(conn)
    }

    async fn handshake<S>(
        stream: &mut S,
        direction: Direction,
        local_init: &InitBody,
        pool: &FramePool,
    ) -> Result<InitBody, ConnectionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match direction {
            Direction::Outbound => {
                Self::write_init(stream, MessageType::InitReq, local_init, pool).await?;
                Self::read_init(stream, MessageType::InitRes, pool).await
            }
            Direction::Inbound => {
                let remote = Self::read_init(stream, MessageType::InitReq, pool).await?;
                Self::write_init(stream, MessageType::InitRes, local_init, pool).await?;
                Ok(remote)
            }
        }
    }

    async fn write_init<S>(
        stream: &mut S,
        message_type: MessageType,
        body: &InitBody,
        pool: &FramePool,
    ) -> Result<(), ConnectionError>
    where
        S: AsyncWrite + Unpin,
    {
        let mut buf = pool.get();
        body.encode(&mut buf)?;
        let frame = Frame::from_parts(FrameHeader::new(message_type, ID_PROTOCOL), buf);
        frame.write_to(stream).await?;
        Ok(())
    }

    async fn read_init<S>(
        stream: &mut S,
        expected: MessageType,
        pool: &FramePool,
    ) -> Result<InitBody, ConnectionError>
    where
        S: AsyncRead + Unpin,
    {
        let frame = Frame::read_from(stream, pool)
            .await?
            .ok_or(ConnectionError::Closed)?;
        if frame.header.message_type != expected || frame.header.id != ID_PROTOCOL {
            return Err(ConnectionError::Handshake(format!(
                "expected {expected:?}, got {:?} (id {:#010x})",
                frame.header.message_type, frame.header.id
            )));
        }
        let body = InitBody::decode(frame.payload())?;
        if body.version != PROTOCOL_VERSION {
            return Err(ConnectionError::Handshake(format!(
                "unsupported protocol version {}",
                body.version
            )));
        }
        Ok(body)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_peer(&self) -> &PeerInfo {
        &self.local_peer
    }

    pub fn remote_peer(&self) -> &PeerInfo {
        &self.remote_peer
    }

    /// In-flight exchanges, both directions.
    pub fn exchange_count(&self) -> usize {
        self.exchanges.count()
    }

    pub fn inbound_exchange_count(&self) -> usize {
        self.exchanges.count_by(CallDirection::Inbound)
    }

    /// Live relay items on this connection (zero on non-relay channels).
    pub fn relay_item_count(&self) -> usize {
        self.relay_items.as_ref().map_or(0, |items| items.count())
    }

    pub fn relay_tomb_count(&self) -> usize {
        self.relay_items
            .as_ref()
            .map_or(0, |items| items.tomb_count())
    }

    pub(crate) fn next_message_id(&self) -> u32 {
        self.next_message_id.fetch_add(2, Ordering::Relaxed)
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub(crate) fn touch_read(&self) {
        self.last_read_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn touch_write(&self) {
        self.last_write_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    /// Milliseconds since the last read or write activity.
    pub fn idle_ms(&self) -> u64 {
        let last = self
            .last_read_ms
            .load(Ordering::Relaxed)
            .max(self.last_write_ms.load(Ordering::Relaxed));
        self.now_ms().saturating_sub(last)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Non-blocking enqueue on the send loop.
    pub(crate) fn try_send_frame(&self, frame: Frame) -> Result<(), SendError> {
        if self.state() == ConnectionState::Closed {
            return Err(SendError::Closed);
        }
        match self.send_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_frame)) => {
                warn!(conn_id = self.conn_id, "send queue full, dropping frame");
                if let Some(channel) = self.channel.upgrade() {
                    channel.stats.inc(stat_keys::CONNECTION_SLOW, 1);
                }
                Err(SendError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_frame)) => Err(SendError::Closed),
        }
    }

    /// Build and enqueue a system error frame for the given call id.
    pub(crate) fn send_system_error(
        &self,
        id: u32,
        span: Span,
        code: SystemErrCode,
        message: &str,
    ) {
        let mut buf = self.pool.get();
        let body = ErrorBody {
            code,
            span,
            message: message.to_owned(),
        };
        if let Err(e) = body.encode(&mut buf) {
            warn!(conn_id = self.conn_id, error = %e, "failed to encode error frame");
            return;
        }
        let frame = Frame::from_parts(FrameHeader::new(MessageType::Error, id), buf);
        if let Err(e) = self.try_send_frame(frame) {
            debug!(conn_id = self.conn_id, id, error = %e, "error frame dropped");
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn set_state(&self, next: ConnectionState) {
        *self.state.lock() = next;
        self.state_tx.send_replace(next);
    }

    /// Begin a graceful close: refuse new calls, let in-flight calls drain.
    pub fn close(&self) {
        {
            let mut st = self.state.lock();
            if *st != ConnectionState::Active {
                return;
            }
            *st = ConnectionState::StartClose;
        }
        self.state_tx.send_replace(ConnectionState::StartClose);
        debug!(conn_id = self.conn_id, "close initiated");
        self.maybe_advance_close();
    }

    /// Advance StartClose once the last in-flight exchange (and, on relay
    /// channels, the last live relay item) completes.
    pub(crate) fn maybe_advance_close(&self) {
        let advance = {
            let mut st = self.state.lock();
            if *st == ConnectionState::StartClose
                && self.exchanges.count() == 0
                && self.relay_item_count() == 0
            {
                *st = ConnectionState::InboundClosed;
                true
            } else {
                false
            }
        };
        if advance {
            self.state_tx.send_replace(ConnectionState::InboundClosed);
            self.to_closed(SystemErrCode::Cancelled);
        }
    }

    /// Final transition: release everything, fail in-flight calls with
    /// `code`, notify the channel.
    pub(crate) fn to_closed(&self, code: SystemErrCode) {
        {
            let mut st = self.state.lock();
            if *st == ConnectionState::Closed {
                return;
            }
            *st = ConnectionState::Closed;
        }
        self.state_tx.send_replace(ConnectionState::Closed);
        let _ = self.shutdown_tx.send(true);
        self.exchanges.shutdown(code);
        if let Some(items) = &self.relay_items {
            items.abort_all();
        }
        if let Some(channel) = self.channel.upgrade() {
            channel.on_connection_closed(self);
        }
        debug!(conn_id = self.conn_id, ?code, "connection closed");
    }

    /// Wait for the Closed state.
    pub async fn closed(&self) {
        let mut rx = self.state_tx.subscribe();
        loop {
            if *rx.borrow() == ConnectionState::Closed {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Remove a completed exchange and, if draining, advance the close.
    pub(crate) fn finish_exchange(&self, id: u32) -> bool {
        let removed = self.exchanges.remove(id);
        if removed {
            self.maybe_advance_close();
        }
        removed
    }

    // ========================================================================
    // Read loop and frame dispatch
    // ========================================================================

    async fn read_loop(
        conn: Arc<Connection>,
        channel: Arc<ChannelInner>,
        mut reader: Box<dyn AsyncRead + Send + Unpin>,
    ) {
        let mut shutdown = conn.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                res = Frame::read_from(&mut reader, &conn.pool) => match res {
                    Ok(Some(frame)) => {
                        conn.touch_read();
                        Self::handle_frame(&conn, &channel, frame).await;
                    }
                    Ok(None) => {
                        // Peer shut its write side.
                        let code = match conn.state() {
                            ConnectionState::StartClose | ConnectionState::InboundClosed => {
                                SystemErrCode::Cancelled
                            }
                            _ => SystemErrCode::NetworkError,
                        };
                        conn.set_state(ConnectionState::InboundClosed);
                        conn.to_closed(code);
                        break;
                    }
                    Err(e) => {
                        warn!(conn_id = conn.conn_id, error = %e, "read failed");
                        conn.to_closed(SystemErrCode::NetworkError);
                        break;
                    }
                },
            }
        }
    }

    async fn handle_frame(conn: &Arc<Connection>, channel: &Arc<ChannelInner>, frame: Frame) {
        let message_type = frame.header.message_type;
        trace!(
            conn_id = conn.conn_id,
            id = frame.header.id,
            ?message_type,
            size = frame.header.size,
            "frame received"
        );

        if frame.header.id == ID_PROTOCOL {
            conn.handle_protocol_frame(frame);
            return;
        }

        if channel.relay.is_some()
            && (message_type.is_call_scope() || message_type == MessageType::Error)
        {
            crate::relay::handle_frame(channel, conn, frame).await;
            return;
        }

        Self::handle_local_frame(conn, channel, frame).await;
    }

    /// Dispatch a call-scope frame through the local (non-relayed) paths.
    pub(crate) async fn handle_local_frame(
        conn: &Arc<Connection>,
        channel: &Arc<ChannelInner>,
        frame: Frame,
    ) {
        match frame.header.message_type {
            MessageType::CallReq => Self::handle_call_req_local(conn, channel, frame),
            MessageType::CallReqContinue
            | MessageType::CallRes
            | MessageType::CallResContinue
            | MessageType::Error => conn.route_to_exchange(frame),
            MessageType::Cancel => conn.handle_cancel(frame),
            MessageType::Claim => match ClaimBody::decode(frame.payload()) {
                Ok(claim) => debug!(
                    conn_id = conn.conn_id,
                    id = frame.header.id,
                    ttl_ms = claim.ttl_ms,
                    "claim frame ignored"
                ),
                Err(e) => debug!(conn_id = conn.conn_id, error = %e, "bad claim frame ignored"),
            },
            MessageType::InitReq
            | MessageType::InitRes
            | MessageType::PingReq
            | MessageType::PingRes => {
                error!(
                    conn_id = conn.conn_id,
                    id = frame.header.id,
                    message_type = ?frame.header.message_type,
                    "protocol-scope frame with call id"
                );
                conn.send_system_error(
                    frame.header.id,
                    Span::default(),
                    SystemErrCode::FatalProtocol,
                    "protocol-scope message with a call id",
                );
                conn.to_closed(SystemErrCode::NetworkError);
            }
        }
    }

    /// Start a locally-handled inbound call.
    pub(crate) fn handle_call_req_local(
        conn: &Arc<Connection>,
        channel: &Arc<ChannelInner>,
        mut frame: Frame,
    ) {
        let id = frame.header.id;
        let span = match LazyCallReq::new(&mut frame) {
            Ok(req) => req.span(),
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

        if conn.state() != ConnectionState::Active {
            conn.send_system_error(
                id,
                span,
                SystemErrCode::Declined,
                "connection is not accepting new calls",
            );
            return;
        }

        match conn.exchanges.add(id, CallDirection::Inbound) {
            Ok(rx) => {
                tokio::spawn(crate::inbound::run_inbound_call(
                    conn.clone(),
                    channel.clone(),
                    frame,
                    rx,
                ));
            }
            Err(ExchangeError::IdInUse) => {
                warn!(conn_id = conn.conn_id, id, "duplicate inbound call id");
                conn.send_system_error(
                    id,
                    span,
                    SystemErrCode::BadRequest,
                    &format!("inbound call with id {id} is already active"),
                );
            }
            Err(_) => {
                conn.send_system_error(
                    id,
                    span,
                    SystemErrCode::Declined,
                    "connection is not accepting new calls",
                );
            }
        }
    }

    /// Route a frame onto its exchange's queue, removing the exchange after
    /// delivering a terminal frame.
    pub(crate) fn route_to_exchange(&self, frame: Frame) {
        let id = frame.header.id;
        let terminal =
            frame.finishes_call() || frame.header.message_type == MessageType::Error;
        match self.exchanges.sender(id) {
            Ok(tx) => match tx.try_send(frame) {
                Ok(()) => {
                    if terminal {
                        self.finish_exchange(id);
                    }
                }
                Err(mpsc::error::TrySendError::Full(_frame)) => {
                    warn!(conn_id = self.conn_id, id, "exchange queue full, failing call");
                    self.finish_exchange(id);
                }
                Err(mpsc::error::TrySendError::Closed(_frame)) => {
                    debug!(conn_id = self.conn_id, id, "exchange consumer gone");
                }
            },
            Err(_) => {
                debug!(conn_id = self.conn_id, id, "frame for unknown id dropped");
                if let Some(channel) = self.channel.upgrade() {
                    channel.stats.inc(stat_keys::UNKNOWN_ID, 1);
                }
            }
        }
    }

    fn handle_cancel(&self, frame: Frame) {
        let id = frame.header.id;
        let why = CancelBody::decode(frame.payload())
            .map(|c| c.why)
            .unwrap_or_default();
        if self.finish_exchange(id) {
            debug!(conn_id = self.conn_id, id, why = %why, "call cancelled by peer");
        } else {
            debug!(conn_id = self.conn_id, id, "cancel for unknown id");
        }
    }

    fn handle_protocol_frame(&self, frame: Frame) {
        match frame.header.message_type {
            MessageType::PingReq => {
                let pong = Frame::new(&self.pool, MessageType::PingRes, ID_PROTOCOL);
                if let Err(e) = self.try_send_frame(pong) {
                    debug!(conn_id = self.conn_id, error = %e, "ping response dropped");
                }
            }
            MessageType::PingRes => {
                trace!(conn_id = self.conn_id, "ping response received");
            }
            MessageType::Error => {
                match ErrorBody::decode(frame.payload()) {
                    Ok(body) => error!(
                        conn_id = self.conn_id,
                        code = %body.code,
                        message = %body.message,
                        "connection-level error from peer"
                    ),
                    Err(e) => error!(
                        conn_id = self.conn_id,
                        error = %e,
                        "unparseable connection-level error from peer"
                    ),
                }
                self.to_closed(SystemErrCode::NetworkError);
            }
            other => {
                error!(
                    conn_id = self.conn_id,
                    ?other,
                    "unexpected protocol-scope frame"
                );
                self.send_system_error(
                    ID_PROTOCOL,
                    Span::default(),
                    SystemErrCode::FatalProtocol,
                    &format!("unexpected protocol-scope frame {other:?}"),
                );
                self.to_closed(SystemErrCode::NetworkError);
            }
        }
    }

    // ========================================================================
    // Send loop
    // ========================================================================

    async fn send_loop(
        conn: Arc<Connection>,
        mut rx: mpsc::Receiver<Frame>,
        mut writer: Box<dyn AsyncWrite + Send + Unpin>,
    ) {
        let mut shutdown = conn.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(frame) => {
                        if let Err(e) = frame.write_to(&mut writer).await {
                            warn!(conn_id = conn.conn_id, error = %e, "write failed");
                            conn.to_closed(SystemErrCode::NetworkError);
                            break;
                        }
                        conn.touch_write();
                    }
                    None => break,
                },
                _ = shutdown.changed() => {
                    // Flush what is already queued, then stop.
                    while let Ok(frame) = rx.try_recv() {
                        if frame.write_to(&mut writer).await.is_err() {
                            break;
                        }
                        conn.touch_write();
                    }
                    break;
                }
            }
        }
        // Release any remaining frames back to the pool.
        while rx.try_recv().is_ok() {}
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    async fn maintenance_loop(conn: Arc<Connection>) {
        let (max_idle, idle_interval) = match conn.channel.upgrade() {
            Some(channel) => (
                channel.config.max_idle_time,
                channel.config.idle_check_interval,
            ),
            None => return,
        };
        let tick = idle_interval.unwrap_or(MAINTENANCE_TICK).min(MAINTENANCE_TICK);
        let mut interval = tokio::time::interval(tick);
        let mut shutdown = conn.shutdown_tx.subscribe();
        let mut inbound_closed_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            match conn.state() {
                ConnectionState::Closed => break,
                ConnectionState::StartClose => conn.maybe_advance_close(),
                ConnectionState::InboundClosed => {
                    let since = inbound_closed_since.get_or_insert_with(Instant::now);
                    if since.elapsed() > CLOSE_DRAIN_TIMEOUT {
                        warn!(conn_id = conn.conn_id, "close drain timed out");
                        conn.to_closed(SystemErrCode::Cancelled);
                        break;
                    }
                }
                ConnectionState::Active => {
                    if let Some(max_idle) = max_idle {
                        if conn.idle_ms() > max_idle.as_millis() as u64
                            && conn.exchanges.count() == 0
                        {
                            debug!(conn_id = conn.conn_id, "closing idle connection");
                            conn.close();
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("direction", &self.direction)
            .field("remote", &self.remote_peer.host_port)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
