//! Per-connection relay item table.
//!
//! Each relayed call is tracked by two twinned items: one on the
//! caller-facing connection keyed by the caller's id, one on the
//! backend-facing connection keyed by the id the relay allocated there. Each
//! item names the other side's connection and id.
//!
//! A tombstone is a finished item kept briefly so late frames (a response
//! racing a cancel or a timeout) die with a counter instead of an
//! unknown-id error. The tombstone set is bounded; overflow evicts the
//! oldest immediately.
//!
//! Twin references are weak: a closing connection detaches in two phases
//! (tombstone the twin under its own lock, then drop locally), so nothing
//! ever dereferences a freed peer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use shunt_core::{Span, SystemErrCode};

use crate::connection::Connection;

use super::host::RelayCall;
use super::timer::RelayTimer;

/// How long a tombstone absorbs late frames before it is dropped.
pub(crate) const TOMB_TTL: Duration = Duration::from_secs(3);

/// One side of a forwarded call.
pub(crate) struct RelayItem {
    /// The call's id on the twin connection.
    pub remote_id: u32,
    /// The twin connection.
    pub destination: Weak<Connection>,
    pub timer: Option<RelayTimer>,
    pub tomb: bool,
    /// True on the caller-facing side.
    pub is_originator: bool,
    pub call: Option<Arc<dyn RelayCall>>,
}

/// Routing answer for a frame id.
pub(crate) enum RelayRoute {
    Found {
        remote_id: u32,
        destination: Weak<Connection>,
        call: Option<Arc<dyn RelayCall>>,
        is_originator: bool,
    },
    /// The call finished recently; the frame is late.
    Tombstone,
    /// Never relayed (or evicted); fall through to the local paths.
    Missing,
}

/// A removed item, for finishing the twin side.
pub(crate) struct FinishedItem {
    pub remote_id: u32,
    pub destination: Weak<Connection>,
    pub call: Option<Arc<dyn RelayCall>>,
}

struct ItemsInner {
    items: HashMap<u32, RelayItem>,
    /// Tombstone insertion order, for bounded eviction. May hold stale ids;
    /// they are skipped lazily.
    tombs: VecDeque<u32>,
}

/// The relay item table of one connection.
pub struct RelayItems {
    conn: Weak<Connection>,
    max_tombs: usize,
    inner: Mutex<ItemsInner>,
}

impl RelayItems {
    pub(crate) fn new(conn: Weak<Connection>, max_tombs: usize) -> Arc<Self> {
        Arc::new(Self {
            conn,
            max_tombs,
            inner: Mutex::new(ItemsInner {
                items: HashMap::new(),
                tombs: VecDeque::new(),
            }),
        })
    }

    /// Insert a new item. Fails if the id already has one.
    pub(crate) fn add(&self, id: u32, item: RelayItem) -> Result<(), ()> {
        let mut inner = self.inner.lock();
        if inner.items.contains_key(&id) {
            return Err(());
        }
        inner.items.insert(id, item);
        Ok(())
    }

    /// Arm the item's timer for `ttl`.
    pub(crate) fn arm(self: Arc<Self>, id: u32, ttl: Duration) {
        let inner = self.inner.lock();
        if let Some(item) = inner.items.get(&id) {
            if let Some(timer) = &item.timer {
                timer.start(ttl, self.clone(), id, item.is_originator);
            }
        }
    }

    pub(crate) fn route(&self, id: u32) -> RelayRoute {
        let inner = self.inner.lock();
        match inner.items.get(&id) {
            None => RelayRoute::Missing,
            Some(item) if item.tomb => RelayRoute::Tombstone,
            Some(item) => RelayRoute::Found {
                remote_id: item.remote_id,
                destination: item.destination.clone(),
                call: item.call.clone(),
                is_originator: item.is_originator,
            },
        }
    }

    /// Remove an item outright, stopping and releasing its timer.
    pub(crate) fn finish(&self, id: u32) -> Option<FinishedItem> {
        let item = self.inner.lock().items.remove(&id)?;
        if let Some(timer) = &item.timer {
            timer.stop();
            timer.release();
        }
        // A draining connection may be waiting on its last relay item.
        if let Some(conn) = self.conn.upgrade() {
            conn.maybe_advance_close();
        }
        Some(FinishedItem {
            remote_id: item.remote_id,
            destination: item.destination,
            call: item.call,
        })
    }

    /// Turn a live item into a tombstone: late frames for it are dropped
    /// with a counter until the tombstone expires.
    pub(crate) fn entomb(self: Arc<Self>, id: u32) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(item) = inner.items.get_mut(&id) else {
            return;
        };
        if item.tomb {
            return;
        }
        item.tomb = true;
        item.call = None;
        if let Some(timer) = &item.timer {
            timer.stop();
            timer.start(TOMB_TTL, self.clone(), id, item.is_originator);
        }
        inner.tombs.push_back(id);
        self.enforce_tomb_bound(inner);
    }

    fn enforce_tomb_bound(&self, inner: &mut ItemsInner) {
        loop {
            // Skip queue entries whose item is gone or revived.
            while let Some(&front) = inner.tombs.front() {
                match inner.items.get(&front) {
                    Some(item) if item.tomb => break,
                    _ => {
                        inner.tombs.pop_front();
                    }
                }
            }
            let live = inner.items.values().filter(|item| item.tomb).count();
            if live <= self.max_tombs {
                return;
            }
            let Some(front) = inner.tombs.pop_front() else {
                return;
            };
            if let Some(item) = inner.items.remove(&front) {
                warn!(id = front, "Too many tombstones, deleting relay item immediately.");
                if let Some(timer) = &item.timer {
                    timer.stop();
                    timer.release();
                }
            }
        }
    }

    /// Timer callback: a live item timed out, or a tombstone expired.
    pub(crate) fn on_timer_fire(self: Arc<Self>, id: u32, is_originator: bool) {
        enum Action {
            None,
            Expired(RelayItem),
            TimedOut {
                remote_id: u32,
                destination: Weak<Connection>,
                call: Option<Arc<dyn RelayCall>>,
            },
        }

        let action = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let state = inner.items.get(&id).map(|item| {
                let armed = item.timer.as_ref().map_or(false, |t| t.is_armed());
                (item.tomb, armed)
            });
            match state {
                None => Action::None,
                // A fire that raced an entomb: the item was re-armed for its
                // tombstone lifetime and this (stale) fire must not touch it.
                Some((true, true)) => Action::None,
                Some((true, false)) => {
                    let item = inner
                        .items
                        .remove(&id)
                        .expect("present under the same lock");
                    Action::Expired(item)
                }
                Some((false, _)) => {
                    // The call timed out: tombstone this side in place. The
                    // timer just fired, so it is disarmed and can be rearmed
                    // for the tombstone lifetime.
                    let (remote_id, destination, call) = {
                        let item = inner
                            .items
                            .get_mut(&id)
                            .expect("present under the same lock");
                        item.tomb = true;
                        let call = item.call.take();
                        if let Some(timer) = &item.timer {
                            timer.start(TOMB_TTL, self.clone(), id, item.is_originator);
                        }
                        (item.remote_id, item.destination.clone(), call)
                    };
                    inner.tombs.push_back(id);
                    self.enforce_tomb_bound(inner);
                    Action::TimedOut {
                        remote_id,
                        destination,
                        call,
                    }
                }
            }
        };

        match action {
            Action::None => {}
            Action::Expired(item) => {
                debug!(id, "tombstone expired");
                if let Some(timer) = &item.timer {
                    timer.stop();
                    timer.release();
                }
            }
            Action::TimedOut {
                remote_id,
                destination,
                call,
            } => {
                debug!(id, is_originator, "relayed call timed out");
                // Tombstone the twin so the late real response is absorbed
                // there. Only the originator side drives this and answers
                // the caller; the other side's fire is purely local.
                if is_originator {
                    if let Some(dest_conn) = destination.upgrade() {
                        if let Some(dest_items) = &dest_conn.relay_items {
                            dest_items.clone().entomb(remote_id);
                        }
                    }
                    if let Some(conn) = self.conn.upgrade() {
                        conn.send_system_error(
                            id,
                            Span::default(),
                            SystemErrCode::Timeout,
                            "relay timeout",
                        );
                    }
                    if let Some(call) = call {
                        call.failed("timeout");
                        call.end();
                    }
                }
            }
        }
    }

    /// Connection teardown: fail every in-flight item and tombstone the
    /// twins so the peer side never chases a freed connection.
    pub(crate) fn abort_all(&self) {
        let drained: Vec<(u32, RelayItem)> = {
            let mut inner = self.inner.lock();
            inner.tombs.clear();
            inner.items.drain().collect()
        };
        for (id, item) in drained {
            if let Some(timer) = &item.timer {
                timer.stop();
                timer.release();
            }
            if !item.tomb {
                if let Some(call) = item.call {
                    call.failed("relay-conn-closed");
                    call.end();
                }
                if let Some(dest_conn) = item.destination.upgrade() {
                    if let Some(dest_items) = &dest_conn.relay_items {
                        dest_items.clone().entomb(item.remote_id);
                    }
                }
            }
            debug!(id, "relay item aborted");
        }
    }

    /// Live (non-tombstone) items.
    pub fn count(&self) -> usize {
        self.inner
            .lock()
            .items
            .values()
            .filter(|item| !item.tomb)
            .count()
    }

    pub fn tomb_count(&self) -> usize {
        self.inner
            .lock()
            .items
            .values()
            .filter(|item| item.tomb)
            .count()
    }
}
