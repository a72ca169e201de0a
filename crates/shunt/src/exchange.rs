//! Per-connection message-exchange table.
//!
//! One exchange per in-flight call, keyed by message id. The read loop
//! pushes frames onto the exchange's bounded queue; the call object on the
//! other end consumes them. The entry is removed exactly once, by whichever
//! side completes the call.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use shunt_core::{Frame, SystemErrCode};

/// Frames buffered per exchange before the producer is pushed back.
const EXCHANGE_BUFFER: usize = 8;

/// Direction of the call an exchange tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    /// The peer initiated this call.
    Inbound,
    /// We initiated this call.
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeError {
    /// A call with this id is already in flight.
    IdInUse,
    /// No call with this id is in flight.
    Unknown,
    /// The table has shut down; no new exchanges.
    Closed,
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdInUse => write!(f, "message id is already active"),
            Self::Unknown => write!(f, "unknown message id"),
            Self::Closed => write!(f, "exchange table closed"),
        }
    }
}

impl std::error::Error for ExchangeError {}

struct Exchange {
    direction: CallDirection,
    tx: mpsc::Sender<Frame>,
}

struct Inner {
    exchanges: HashMap<u32, Exchange>,
    /// Set once the table shuts down; the code every subsequent waiter sees.
    close_code: Option<SystemErrCode>,
}

/// The per-connection table of in-flight exchanges.
pub struct ExchangeSet {
    inner: Mutex<Inner>,
}

impl ExchangeSet {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                exchanges: HashMap::new(),
                close_code: None,
            }),
        }
    }

    /// Atomically insert a new exchange. The returned receiver yields the
    /// call's subsequent frames.
    pub(crate) fn add(
        &self,
        id: u32,
        direction: CallDirection,
    ) -> Result<mpsc::Receiver<Frame>, ExchangeError> {
        let mut inner = self.inner.lock();
        if inner.close_code.is_some() {
            return Err(ExchangeError::Closed);
        }
        if inner.exchanges.contains_key(&id) {
            return Err(ExchangeError::IdInUse);
        }
        let (tx, rx) = mpsc::channel(EXCHANGE_BUFFER);
        inner.exchanges.insert(id, Exchange { direction, tx });
        Ok(rx)
    }

    /// Sender for routing a received frame to its exchange.
    pub(crate) fn sender(&self, id: u32) -> Result<mpsc::Sender<Frame>, ExchangeError> {
        let inner = self.inner.lock();
        inner
            .exchanges
            .get(&id)
            .map(|ex| ex.tx.clone())
            .ok_or(ExchangeError::Unknown)
    }

    /// Remove a completed exchange. Returns false if it was already gone.
    pub(crate) fn remove(&self, id: u32) -> bool {
        self.inner.lock().exchanges.remove(&id).is_some()
    }

    /// Number of in-flight exchanges, both directions.
    pub fn count(&self) -> usize {
        self.inner.lock().exchanges.len()
    }

    pub(crate) fn count_by(&self, direction: CallDirection) -> usize {
        self.inner
            .lock()
            .exchanges
            .values()
            .filter(|ex| ex.direction == direction)
            .count()
    }

    /// Fail every in-flight exchange with `code` and refuse new ones.
    ///
    /// Dropping the senders wakes every waiting call; they read the close
    /// code to classify the failure.
    pub(crate) fn shutdown(&self, code: SystemErrCode) {
        let mut inner = self.inner.lock();
        if inner.close_code.is_none() {
            inner.close_code = Some(code);
        }
        inner.exchanges.clear();
    }

    /// The code a call should report when its exchange disappeared.
    pub(crate) fn close_code(&self) -> SystemErrCode {
        self.inner
            .lock()
            .close_code
            .unwrap_or(SystemErrCode::Cancelled)
    }
}
