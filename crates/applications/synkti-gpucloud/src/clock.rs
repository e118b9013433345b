//! Simulation clock
//!
//! Single source of "now" and of delayed callbacks for every component.
//!
//! ## Modes
//!
//! - **Manual**: time only moves when [`SimClock::advance`] is called. Due
//!   callbacks fire in `(fire time, schedule order)` order on the caller's
//!   thread, with `now()` set to each callback's fire time. Tests drive the
//!   whole state machine this way.
//! - **Realtime**: simulated time tracks the tokio clock scaled by a speedup
//!   factor, and callbacks run on spawned tokio tasks.
//!
//! Callbacks never run while the clock's own lock is held, so they may
//! schedule or cancel further timers.

use crate::error::{Result, SimError};
use crate::types::SimTime;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Deferred work run when a timer fires
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a scheduled callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

enum Mode {
    Manual,
    Realtime {
        origin: tokio::time::Instant,
        speedup: f64,
        runtime: Handle,
    },
}

#[derive(Default)]
struct TimerTable {
    /// Manual mode only
    now: SimTime,
    next_id: u64,
    queue: BinaryHeap<Reverse<(SimTime, TimerId)>>,
    callbacks: HashMap<TimerId, TimerCallback>,
    tasks: HashMap<TimerId, AbortHandle>,
}

struct ClockInner {
    epoch: DateTime<Utc>,
    mode: Mode,
    timers: Mutex<TimerTable>,
}

/// Shared simulation clock (cheap to clone)
#[derive(Clone)]
pub struct SimClock {
    inner: Arc<ClockInner>,
}

impl SimClock {
    /// Manual clock starting at time zero
    pub fn manual() -> Self {
        Self::build(Mode::Manual, Utc::now())
    }

    /// Manual clock whose time zero maps to `epoch`
    pub fn manual_at(epoch: DateTime<Utc>) -> Self {
        Self::build(Mode::Manual, epoch)
    }

    /// Realtime clock; one wall second is `speedup` simulated seconds.
    ///
    /// Must be called from within a tokio runtime.
    pub fn realtime(speedup: f64) -> Result<Self> {
        if !speedup.is_finite() || speedup <= 0.0 {
            return Err(SimError::config(format!("clock speedup must be positive, got {}", speedup)));
        }
        let runtime = Handle::try_current()
            .map_err(|e| SimError::config(format!("realtime clock needs a tokio runtime: {}", e)))?;

        Ok(Self::build(
            Mode::Realtime {
                origin: tokio::time::Instant::now(),
                speedup,
                runtime,
            },
            Utc::now(),
        ))
    }

    fn build(mode: Mode, epoch: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(ClockInner {
                epoch,
                mode,
                timers: Mutex::new(TimerTable::default()),
            }),
        }
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.inner.mode, Mode::Manual)
    }

    /// Current simulated time
    pub fn now(&self) -> SimTime {
        match &self.inner.mode {
            Mode::Manual => self.inner.timers.lock().now,
            Mode::Realtime { origin, speedup, .. } => {
                let elapsed = origin.elapsed().as_secs_f64() * speedup;
                SimTime::from_millis((elapsed * 1000.0) as u64)
            }
        }
    }

    /// Wall-clock rendering of a simulated instant
    pub fn to_datetime(&self, t: SimTime) -> DateTime<Utc> {
        let ms = i64::try_from(t.as_millis()).unwrap_or(i64::MAX);
        self.inner.epoch + chrono::Duration::milliseconds(ms)
    }

    /// Run `callback` once `delay` of simulated time has passed
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + Send + 'static) -> TimerId {
        let callback: TimerCallback = Box::new(callback);

        match &self.inner.mode {
            Mode::Manual => {
                let mut timers = self.inner.timers.lock();
                let id = TimerId(timers.next_id);
                timers.next_id += 1;
                let fire_at = timers.now + delay;
                timers.queue.push(Reverse((fire_at, id)));
                timers.callbacks.insert(id, callback);
                id
            }
            Mode::Realtime { speedup, runtime, .. } => {
                let mut timers = self.inner.timers.lock();
                let id = TimerId(timers.next_id);
                timers.next_id += 1;
                timers.callbacks.insert(id, callback);

                let wall_delay = delay.div_f64(*speedup);
                let inner = Arc::clone(&self.inner);
                let task = runtime.spawn(async move {
                    tokio::time::sleep(wall_delay).await;
                    let due = {
                        let mut timers = inner.timers.lock();
                        timers.tasks.remove(&id);
                        timers.callbacks.remove(&id)
                    };
                    if let Some(callback) = due {
                        callback();
                    }
                });
                timers.tasks.insert(id, task.abort_handle());
                id
            }
        }
    }

    /// Cancel a pending callback. Returns `false` if it already fired or was
    /// cancelled before.
    pub fn cancel(&self, id: TimerId) -> bool {
        let mut timers = self.inner.timers.lock();
        if let Some(task) = timers.tasks.remove(&id) {
            task.abort();
        }
        let cancelled = timers.callbacks.remove(&id).is_some();
        if cancelled {
            debug!(timer = %id, "Timer cancelled");
        }
        cancelled
    }

    /// Number of callbacks not yet fired
    pub fn pending(&self) -> usize {
        self.inner.timers.lock().callbacks.len()
    }

    /// Fire time of the earliest pending callback (manual mode)
    pub fn next_fire_time(&self) -> Option<SimTime> {
        let mut timers = self.inner.timers.lock();
        while let Some(Reverse((at, id))) = timers.queue.peek().copied() {
            if timers.callbacks.contains_key(&id) {
                return Some(at);
            }
            timers.queue.pop();
        }
        None
    }

    /// Move manual time forward by `by`, firing every callback that falls
    /// due, including ones scheduled by callbacks along the way. Returns the
    /// number of callbacks fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.now() + by;
        self.advance_to(target)
    }

    /// Move manual time forward to `target` (never backwards)
    pub fn advance_to(&self, target: SimTime) -> usize {
        if !self.is_manual() {
            warn!("advance() ignored on a realtime clock");
            return 0;
        }

        let mut fired = 0;
        loop {
            let due = {
                let mut timers = self.inner.timers.lock();
                let mut due = None;
                while let Some(Reverse((at, id))) = timers.queue.peek().copied() {
                    if at > target {
                        break;
                    }
                    timers.queue.pop();
                    if let Some(callback) = timers.callbacks.remove(&id) {
                        timers.now = timers.now.max(at);
                        due = Some(callback);
                        break;
                    }
                }
                due
            };

            match due {
                Some(callback) => {
                    callback();
                    fired += 1;
                }
                None => break,
            }
        }

        let mut timers = self.inner.timers.lock();
        timers.now = timers.now.max(target);
        fired
    }

    /// Fire pending callbacks in order until none remain or `max_callbacks`
    /// have fired. Returns the number fired.
    pub fn run_until_idle(&self, max_callbacks: usize) -> usize {
        let mut fired = 0;
        while fired < max_callbacks {
            match self.next_fire_time() {
                Some(at) => fired += self.advance_to(at),
                None => break,
            }
        }
        fired
    }
}

impl fmt::Debug for SimClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimClock")
            .field("manual", &self.is_manual())
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}
