//! Channel: the per-process endpoint owning connections, handlers and the
//! relay.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

use shunt_core::{FramePool, EPHEMERAL_HOST_PORT};

use crate::config::{CallOptions, ChannelConfig};
use crate::connection::Connection;
use crate::errors::{CallError, ChannelError, ConnectionError};
use crate::handler::{CallHandler, HandlerRegistry};
use crate::outbound::{send_outbound_call, CallResponse};
use crate::peers::{Direction, PeerRegistry};
use crate::relay::RelayContext;
use crate::stats::StatsReporter;

/// A channel is one logical service endpoint: it accepts inbound
/// connections, dials outbound ones, and (when configured with a relay
/// host) forwards calls between them.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

pub(crate) struct ChannelInner {
    pub(crate) config: ChannelConfig,
    pub(crate) pool: FramePool,
    pub(crate) handlers: HandlerRegistry,
    pub(crate) stats: Arc<dyn StatsReporter>,
    pub(crate) relay: Option<RelayContext>,

    peers: PeerRegistry,
    conns: Mutex<HashMap<u64, Arc<Connection>>>,
    next_conn_id: AtomicU64,
    /// Per-destination slot; concurrent dials to one destination coalesce
    /// behind its async mutex.
    dial_slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Weak<Connection>>>>>,
    listen_addr: Mutex<Option<SocketAddr>>,
    accept_shutdown: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Result<Self, ChannelError> {
        if config.service_name.is_empty() {
            return Err(ChannelError::InvalidConfig("empty service name".into()));
        }
        let relay = config.relay_host.clone().map(|host| {
            RelayContext::new(host, config.relay_frame_fn.clone(), config.relay_timer_verify)
        });
        let (accept_shutdown, _) = watch::channel(false);
        let inner = Arc::new(ChannelInner {
            pool: config.frame_pool.clone(),
            stats: config.stats.clone(),
            peers: PeerRegistry::new(config.on_peer_status_changed.clone()),
            handlers: HandlerRegistry::new(),
            relay,
            conns: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            dial_slots: Mutex::new(HashMap::new()),
            listen_addr: Mutex::new(None),
            accept_shutdown,
            closed: AtomicBool::new(false),
            config,
        });
        Ok(Self { inner })
    }

    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    /// Register a handler for a method name.
    pub fn register(&self, method: impl Into<String>, handler: Arc<dyn CallHandler>) {
        self.inner.handlers.register(method, handler);
    }

    /// Bind and start accepting inbound connections. Returns the bound
    /// address (useful with port 0).
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, ChannelError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *self.inner.listen_addr.lock() = Some(local);
        debug!(service = %self.inner.config.service_name, %local, "listening");

        let inner = self.inner.clone();
        let mut shutdown = self.inner.accept_shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer_addr)) => {
                            debug!(%peer_addr, "accepted connection");
                            inner.apply_socket_options(&stream);
                            let inner = inner.clone();
                            tokio::spawn(async move {
                                match Connection::establish(stream, Direction::Inbound, inner.clone())
                                    .await
                                {
                                    Ok(conn) => inner.register_connection(&conn),
                                    Err(e) => {
                                        warn!(%peer_addr, error = %e, "inbound handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            break;
                        }
                    },
                }
            }
        });
        Ok(local)
    }

    /// The bound listen address, if listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.listen_addr.lock()
    }

    /// Issue a call to `host_port`.
    pub async fn call(
        &self,
        host_port: &str,
        opts: &CallOptions,
        arg2: &[u8],
        arg3: &[u8],
    ) -> Result<CallResponse, CallError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CallError::ConnectionClosed);
        }
        let conn = ChannelInner::get_connection(&self.inner, host_port, opts.ttl)
            .await
            .map_err(CallError::Connection)?;
        send_outbound_call(
            &conn,
            &self.inner.config.service_name,
            self.inner.config.checksum_type,
            opts,
            arg2,
            arg3,
        )
        .await
    }

    /// Snapshot of live connections (tests and diagnostics).
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.inner.conns.lock().values().cloned().collect()
    }

    /// In-flight exchanges across all connections.
    pub fn total_exchange_count(&self) -> usize {
        self.connections()
            .iter()
            .map(|conn| conn.exchange_count())
            .sum()
    }

    /// Total connections to `host_port`, both directions.
    pub fn peer_connection_count(&self, host_port: &str) -> usize {
        self.inner.peers.connection_count(host_port)
    }

    /// Close every connection gracefully and stop accepting.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.inner.accept_shutdown.send(true);

        let conns = self.connections();
        for conn in &conns {
            conn.close();
        }
        for conn in &conns {
            if tokio::time::timeout(Duration::from_secs(5), conn.closed())
                .await
                .is_err()
            {
                warn!(conn_id = conn.conn_id, "connection did not drain, forcing close");
                conn.to_closed(shunt_core::SystemErrCode::Cancelled);
            }
        }
    }
}

impl ChannelInner {
    /// The host:port this process advertises in init headers.
    pub(crate) fn local_host_port(&self) -> String {
        (*self.listen_addr.lock())
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| EPHEMERAL_HOST_PORT.to_owned())
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_connection(&self, conn: &Arc<Connection>) {
        self.conns.lock().insert(conn.conn_id, conn.clone());
        self.peers
            .connection_added(&conn.remote_peer().host_port, conn.direction());
        // The connection may have died before it was registered; undo so the
        // table and peer counts do not leak a closed entry.
        if conn.state() == crate::connection::ConnectionState::Closed {
            self.on_connection_closed(conn);
        }
    }

    /// Called by a connection when it reaches Closed.
    pub(crate) fn on_connection_closed(&self, conn: &Connection) {
        if self.conns.lock().remove(&conn.conn_id).is_some() {
            self.peers
                .connection_removed(&conn.remote_peer().host_port, conn.direction());
        }
    }

    /// Get or create an outbound connection to `host_port`. Concurrent
    /// callers racing on one destination share a single dial attempt.
    pub(crate) async fn get_connection(
        inner: &Arc<ChannelInner>,
        host_port: &str,
        dial_timeout: Duration,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let slot = {
            let mut slots = inner.dial_slots.lock();
            slots
                .entry(host_port.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Weak::new())))
                .clone()
        };
        let mut guard = slot.lock().await;
        if let Some(conn) = guard.upgrade() {
            if conn.is_active() {
                return Ok(conn);
            }
        }

        let stream = tokio::time::timeout(dial_timeout, inner.dial(host_port))
            .await
            .map_err(|_| ConnectionError::Handshake("dial timed out".into()))??;
        inner.apply_socket_options(&stream);
        let conn = Connection::establish(stream, Direction::Outbound, inner.clone()).await?;
        inner.register_connection(&conn);
        *guard = Arc::downgrade(&conn);
        Ok(conn)
    }

    async fn dial(&self, host_port: &str) -> std::io::Result<TcpStream> {
        match &self.config.dialer {
            Some(dialer) => dialer.dial(host_port).await,
            None => TcpStream::connect(host_port).await,
        }
    }

    fn apply_socket_options(&self, stream: &TcpStream) {
        if let Some(tos) = self.config.tos_priority {
            let sock = socket2::SockRef::from(stream);
            if let Err(e) = sock.set_tos(tos) {
                warn!(tos, error = %e, "failed to set TOS on socket");
            }
        }
    }
}
