//! Counter event contract.
//!
//! The core emits counter increments; aggregation, tags and export live
//! outside. The default reporter drops everything.

use std::sync::Arc;

/// Sink for counter events.
pub trait StatsReporter: Send + Sync {
    fn inc(&self, key: &str, delta: u64);
}

/// Reporter that discards all events.
pub struct NoopStats;

impl StatsReporter for NoopStats {
    fn inc(&self, _key: &str, _delta: u64) {}
}

pub fn noop_stats() -> Arc<dyn StatsReporter> {
    Arc::new(NoopStats)
}

/// Stat keys emitted by the core.
pub mod stat_keys {
    /// A frame was dropped because a connection's send queue was full.
    pub const CONNECTION_SLOW: &str = "connection.slow";
    /// A frame arrived for an unknown message id.
    pub const UNKNOWN_ID: &str = "connection.unknown-id";

    /// The relay host picked no destination and returned no error.
    pub const RELAY_BAD_RELAY_HOST: &str = "relay-bad-relay-host";
    /// The relay declined a call.
    pub const RELAY_DECLINED: &str = "relay-declined";
    /// The relay silently dropped a frame (rate limit or tombstone).
    pub const RELAY_DROPPED: &str = "relay-dropped";
    /// A call-scope frame had neither a relay item nor a local exchange
    /// (typically late traffic for an overflow-evicted item).
    pub const RELAY_NO_ITEM: &str = "relay-no-item";
    /// The caller-facing connection was no longer active.
    pub const RELAY_CLIENT_CONN_INACTIVE: &str = "relay-client-conn-inactive";
    /// The caller-facing connection's send queue overflowed.
    pub const RELAY_SOURCE_CONN_SLOW: &str = "relay-source-conn-slow";
    /// The backend-facing connection's send queue overflowed.
    pub const RELAY_DEST_CONN_SLOW: &str = "relay-dest-conn-slow";
    /// An arg2 inspection or mutation failed.
    pub const RELAY_ARG2_MODIFY_FAILED: &str = "relay-arg2-modify-failed";

    /// Prefix for system-error outcomes from the relay host
    /// (`relay-busy`, `relay-declined`, ...).
    pub const RELAY_PREFIX: &str = "relay-";
}
