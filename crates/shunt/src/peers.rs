//! Peer identities and the per-channel peer registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Identity of one side of a connection, filled from the init handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub host_port: String,
    pub process_name: String,
    /// True for peers that accept no inbound connections (they advertise
    /// `0.0.0.0:0`).
    pub is_ephemeral: bool,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The peer dialed us.
    Inbound,
    /// We dialed the peer.
    Outbound,
}

/// Notification payload for peer status changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatusChange {
    pub host_port: String,
    pub direction: Direction,
    /// True on the 0→1 transition, false on the 1→0 transition.
    pub connected: bool,
}

pub type PeerStatusCallback = Arc<dyn Fn(&PeerStatusChange) + Send + Sync>;

#[derive(Default)]
struct PeerCounts {
    inbound: usize,
    outbound: usize,
}

impl PeerCounts {
    fn slot(&mut self, direction: Direction) -> &mut usize {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

/// Per-channel registry of connection counts by peer and direction.
///
/// The status callback fires exactly on 0↔1 transitions of a peer's count in
/// a given direction.
pub(crate) struct PeerRegistry {
    callback: Option<PeerStatusCallback>,
    counts: Mutex<HashMap<String, PeerCounts>>,
}

impl PeerRegistry {
    pub fn new(callback: Option<PeerStatusCallback>) -> Self {
        Self {
            callback,
            counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn connection_added(&self, host_port: &str, direction: Direction) {
        let fire = {
            let mut counts = self.counts.lock();
            let slot = counts.entry(host_port.to_owned()).or_default().slot(direction);
            *slot += 1;
            *slot == 1
        };
        if fire {
            self.notify(host_port, direction, true);
        }
    }

    pub fn connection_removed(&self, host_port: &str, direction: Direction) {
        let fire = {
            let mut counts = self.counts.lock();
            match counts.get_mut(host_port) {
                Some(entry) => {
                    let slot = entry.slot(direction);
                    debug_assert!(*slot > 0, "peer count underflow for {host_port}");
                    *slot = slot.saturating_sub(1);
                    *slot == 0
                }
                None => false,
            }
        };
        if fire {
            self.notify(host_port, direction, false);
        }
    }

    pub fn connection_count(&self, host_port: &str) -> usize {
        let counts = self.counts.lock();
        counts
            .get(host_port)
            .map(|c| c.inbound + c.outbound)
            .unwrap_or(0)
    }

    fn notify(&self, host_port: &str, direction: Direction, connected: bool) {
        if let Some(callback) = &self.callback {
            callback(&PeerStatusChange {
                host_port: host_port.to_owned(),
                direction,
                connected,
            });
        }
    }
}
