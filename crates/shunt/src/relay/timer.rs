//! Reusable relay timers.
//!
//! Every relay item owns a timer from this pool. The contract is strict so
//! that timer bugs surface as programmer errors instead of leaked items:
//!
//! - `get` returns an unarmed timer,
//! - `start` arms it; arming an armed timer is an error,
//! - `stop` disarms; a timer must be stopped before `release`,
//! - `release` returns it to the pool; any use afterwards is an error.
//!
//! With `verify` set (tests), contract violations panic. Production pools
//! skip the panics and turn misuse into no-ops. A timer fires at most once
//! per start: stop and re-start invalidate any sleep already in flight via a
//! generation counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::items::RelayItems;

/// Invoked when a timer fires: `(items, id, is_originator)`.
pub(crate) type TimerTrigger = Arc<dyn Fn(Arc<RelayItems>, u32, bool) + Send + Sync>;

#[derive(Default)]
struct TimerState {
    armed: bool,
    released: bool,
    generation: u64,
    task: Option<tokio::task::AbortHandle>,
}

struct TimerCell {
    /// Bumped on every reuse so stale handles are detectable.
    epoch: AtomicU64,
    state: Mutex<TimerState>,
}

/// Pool of reusable relay timers.
pub struct RelayTimerPool {
    trigger: TimerTrigger,
    verify: bool,
    free: Mutex<Vec<Arc<TimerCell>>>,
}

impl RelayTimerPool {
    pub(crate) fn new(trigger: TimerTrigger, verify: bool) -> Arc<Self> {
        Arc::new(Self {
            trigger,
            verify,
            free: Mutex::new(Vec::new()),
        })
    }

    /// Get an unarmed timer, reusing a released one when available.
    pub fn get(self: Arc<Self>) -> RelayTimer {
        let cell = self.free.lock().pop().unwrap_or_else(|| {
            Arc::new(TimerCell {
                epoch: AtomicU64::new(0),
                state: Mutex::new(TimerState::default()),
            })
        });
        let epoch = cell.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut st = cell.state.lock();
            st.armed = false;
            st.released = false;
            st.task = None;
        }
        RelayTimer {
            pool: self,
            cell,
            epoch,
        }
    }

    /// Drop all pooled timers. Test hook.
    pub fn drain(&self) {
        self.free.lock().clear();
    }

    #[cfg(test)]
    fn free_len(&self) -> usize {
        self.free.lock().len()
    }
}

/// A timer leased from a [`RelayTimerPool`].
pub struct RelayTimer {
    pool: Arc<RelayTimerPool>,
    cell: Arc<TimerCell>,
    epoch: u64,
}

impl RelayTimer {
    fn is_stale(&self, st: &TimerState) -> bool {
        st.released || self.epoch != self.cell.epoch.load(Ordering::Acquire)
    }

    /// Arm the timer: after `d`, the pool's trigger runs with
    /// `(items, id, is_originator)`.
    pub(crate) fn start(&self, d: Duration, items: Arc<RelayItems>, id: u32, is_originator: bool) {
        let mut st = self.cell.state.lock();
        if self.is_stale(&st) {
            if self.pool.verify {
                panic!("relay timer started after release");
            }
            return;
        }
        if st.armed {
            if self.pool.verify {
                panic!("relay timer started while already armed");
            }
            return;
        }
        if st.task.is_some() {
            if self.pool.verify {
                panic!("relay timer's underlying task is already active");
            }
            return;
        }

        st.generation += 1;
        let generation = st.generation;
        st.armed = true;

        let cell = self.cell.clone();
        let pool = self.pool.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(d).await;
            let fire = {
                let mut st = cell.state.lock();
                if st.generation == generation && st.armed {
                    st.armed = false;
                    st.task = None;
                    true
                } else {
                    false
                }
            };
            if fire {
                (pool.trigger)(items, id, is_originator);
            }
        });
        st.task = Some(handle.abort_handle());
    }

    /// Disarm. A fire already racing this stop loses via the generation
    /// counter, so the timer fires at most once per start.
    pub(crate) fn stop(&self) {
        let mut st = self.cell.state.lock();
        if self.is_stale(&st) {
            if self.pool.verify {
                panic!("relay timer stopped after release");
            }
            return;
        }
        st.generation += 1;
        st.armed = false;
        if let Some(task) = st.task.take() {
            task.abort();
        }
    }

    /// Return the timer to the pool. Must be stopped (or fired) first.
    pub(crate) fn release(&self) {
        {
            let mut st = self.cell.state.lock();
            if self.is_stale(&st) {
                if self.pool.verify {
                    panic!("relay timer released twice");
                }
                return;
            }
            if st.armed {
                if self.pool.verify {
                    panic!("relay timer released without a stop");
                }
                return;
            }
            st.released = true;
            st.task = None;
        }
        self.pool.free.lock().push(self.cell.clone());
    }

    /// Whether the timer is currently armed.
    pub(crate) fn is_armed(&self) -> bool {
        self.cell.state.lock().armed
    }

    /// Simulate the underlying task being armed out-of-band.
    #[cfg(test)]
    fn debug_mark_task_live(&self) {
        let handle = tokio::spawn(async {});
        self.cell.state.lock().task = Some(handle.abort_handle());
    }
}
