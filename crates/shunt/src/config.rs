//! Channel configuration knobs.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use shunt_core::{ArgScheme, ChecksumType, FramePool};
use tokio::net::TcpStream;

use crate::connection::Connection;
use crate::peers::PeerStatusCallback;
use crate::relay::{FrameFn, RelayHost};
use crate::stats::{noop_stats, StatsReporter};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Custom outbound dialer.
pub trait Dialer: Send + Sync {
    fn dial(&self, host_port: &str) -> BoxFuture<'static, std::io::Result<TcpStream>>;
}

/// Hook invoked with every new connection after its handshake, before its
/// loops start. The rendition of the original's per-connection context
/// attachment.
pub type ConnObserver = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Send-queue capacity override keyed by remote process name prefix.
#[derive(Debug, Clone)]
pub struct SendBufferSizeOverride {
    pub process_name_prefix: String,
    pub size: usize,
}

const DEFAULT_SEND_BUFFER_SIZE: usize = 512;
const DEFAULT_RELAY_MAX_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_RELAY_MAX_TOMBS: usize = 10_000;

/// Configuration for a [`Channel`](crate::Channel) and its connections.
#[derive(Clone)]
pub struct ChannelConfig {
    pub service_name: String,
    pub process_name: String,

    /// Send-queue capacity per connection.
    pub send_buffer_size: usize,
    /// First matching prefix of the remote process name wins.
    pub send_buffer_size_overrides: Vec<SendBufferSizeOverride>,

    pub checksum_type: ChecksumType,
    /// IP TOS / traffic class applied to sockets.
    pub tos_priority: Option<u32>,

    /// Connections idle longer than this (and with nothing in flight) are
    /// dropped by the idle sweep.
    pub max_idle_time: Option<Duration>,
    pub idle_check_interval: Option<Duration>,

    pub relay_host: Option<Arc<dyn RelayHost>>,
    /// Clamp applied to relayed call TTLs.
    pub relay_max_timeout: Option<Duration>,
    /// Clamp applied to relay dial attempts.
    pub relay_max_connection_timeout: Duration,
    /// Bound on retained tombstones per connection.
    pub relay_max_tombs: usize,
    /// Service names the relay dispatches locally instead of forwarding.
    pub relay_local_handlers: HashSet<String>,
    /// Side-channel hook for inspecting/modifying arg2 on forwarded frames.
    pub relay_frame_fn: Option<FrameFn>,
    /// Enable the relay timer pool's misuse panics.
    pub relay_timer_verify: bool,

    pub dialer: Option<Arc<dyn Dialer>>,
    pub on_conn: Option<ConnObserver>,
    pub on_peer_status_changed: Option<PeerStatusCallback>,
    pub stats: Arc<dyn StatsReporter>,
    pub frame_pool: FramePool,
}

impl ChannelConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            process_name: format!("{service_name}[{}]", std::process::id()),
            service_name,
            send_buffer_size: DEFAULT_SEND_BUFFER_SIZE,
            send_buffer_size_overrides: Vec::new(),
            checksum_type: ChecksumType::Crc32,
            tos_priority: None,
            max_idle_time: None,
            idle_check_interval: None,
            relay_host: None,
            relay_max_timeout: None,
            relay_max_connection_timeout: DEFAULT_RELAY_MAX_CONNECTION_TIMEOUT,
            relay_max_tombs: DEFAULT_RELAY_MAX_TOMBS,
            relay_local_handlers: HashSet::new(),
            relay_frame_fn: None,
            relay_timer_verify: false,
            dialer: None,
            on_conn: None,
            on_peer_status_changed: None,
            stats: noop_stats(),
            frame_pool: FramePool::global().clone(),
        }
    }

    pub fn with_process_name(mut self, process_name: impl Into<String>) -> Self {
        self.process_name = process_name.into();
        self
    }

    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = size;
        self
    }

    pub fn with_send_buffer_size_override(
        mut self,
        process_name_prefix: impl Into<String>,
        size: usize,
    ) -> Self {
        self.send_buffer_size_overrides.push(SendBufferSizeOverride {
            process_name_prefix: process_name_prefix.into(),
            size,
        });
        self
    }

    pub fn with_checksum_type(mut self, checksum_type: ChecksumType) -> Self {
        self.checksum_type = checksum_type;
        self
    }

    pub fn with_tos_priority(mut self, tos: u32) -> Self {
        self.tos_priority = Some(tos);
        self
    }

    pub fn with_idle_sweep(mut self, max_idle_time: Duration, check_interval: Duration) -> Self {
        self.max_idle_time = Some(max_idle_time);
        self.idle_check_interval = Some(check_interval);
        self
    }

    pub fn with_relay_host(mut self, host: Arc<dyn RelayHost>) -> Self {
        self.relay_host = Some(host);
        self
    }

    pub fn with_relay_max_timeout(mut self, d: Duration) -> Self {
        self.relay_max_timeout = Some(d);
        self
    }

    pub fn with_relay_max_connection_timeout(mut self, d: Duration) -> Self {
        self.relay_max_connection_timeout = d;
        self
    }

    pub fn with_relay_max_tombs(mut self, max_tombs: usize) -> Self {
        self.relay_max_tombs = max_tombs;
        self
    }

    pub fn with_relay_local_handler(mut self, service: impl Into<String>) -> Self {
        self.relay_local_handlers.insert(service.into());
        self
    }

    pub fn with_relay_frame_fn(mut self, frame_fn: FrameFn) -> Self {
        self.relay_frame_fn = Some(frame_fn);
        self
    }

    pub fn with_relay_timer_verify(mut self, verify: bool) -> Self {
        self.relay_timer_verify = verify;
        self
    }

    pub fn with_dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    pub fn with_conn_observer(mut self, observer: ConnObserver) -> Self {
        self.on_conn = Some(observer);
        self
    }

    pub fn with_peer_status_callback(mut self, callback: PeerStatusCallback) -> Self {
        self.on_peer_status_changed = Some(callback);
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsReporter>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_frame_pool(mut self, pool: FramePool) -> Self {
        self.frame_pool = pool;
        self
    }

    /// Send-queue capacity for a connection to the named remote process.
    pub(crate) fn send_buffer_size_for(&self, remote_process_name: &str) -> usize {
        for over in &self.send_buffer_size_overrides {
            if remote_process_name.starts_with(&over.process_name_prefix) {
                return over.size;
            }
        }
        self.send_buffer_size
    }
}

/// Per-call options.
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Destination service name.
    pub service: String,
    /// Method name (arg1).
    pub method: String,
    pub ttl: Duration,
    pub arg_scheme: ArgScheme,
    /// Extra transport headers beyond `as`/`cn`.
    pub headers: Vec<(String, String)>,
}

impl CallOptions {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            ttl: Duration::from_secs(1),
            arg_scheme: ArgScheme::Raw,
            headers: Vec::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_arg_scheme(mut self, scheme: ArgScheme) -> Self {
        self.arg_scheme = scheme;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_prefix_wins() {
        let config = ChannelConfig::new("svc")
            .with_send_buffer_size(100)
            .with_send_buffer_size_override("batch-", 4)
            .with_send_buffer_size_override("batch-slow-", 2);

        assert_eq!(config.send_buffer_size_for("api-7"), 100);
        assert_eq!(config.send_buffer_size_for("batch-7"), 4);
        // Both prefixes match; the first listed wins.
        assert_eq!(config.send_buffer_size_for("batch-slow-7"), 4);
    }
}
