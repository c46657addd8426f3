//! Injectable time source
//!
//! Everything time-dependent in the crate goes through [`Clock`]: reading the
//! current timestamp and arming one-shot timers. Two implementations:
//!
//! - [`TokioClock`]: wall clock anchored at construction and advanced by
//!   `tokio::time`, so paused test runtimes drive it deterministically.
//! - [`ManualClock`]: simulated time that only moves on [`ManualClock::advance`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Unix timestamp in milliseconds.
pub type Timestamp = u64;

/// One-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle returned by [`Clock::schedule_once`], used to cancel the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Time source and timer facility.
pub trait Clock: Send + Sync + 'static {
    /// Current time as unix milliseconds.
    fn now(&self) -> Timestamp;

    /// Run `callback` once after `delay`.
    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a pending timer. Unknown or already fired handles are ignored.
    fn cancel(&self, handle: TimerHandle);
}

/// Convert a duration to whole milliseconds, saturating.
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Live clock backed by tokio timers.
///
/// `now()` is the wall-clock reading taken at construction plus the tokio
/// time elapsed since, which keeps timestamps and timers on the same
/// timeline (including under `tokio::time::pause`). Timers are spawned tasks,
/// so `schedule_once` must be called from within a tokio runtime.
pub struct TokioClock {
    epoch_ms: Timestamp,
    anchor: tokio::time::Instant,
    next_id: AtomicU64,
    timers: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl TokioClock {
    /// Clock anchored at the current system time.
    pub fn new() -> Self {
        let epoch_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self::with_epoch(epoch_ms)
    }

    /// Clock whose `now()` starts at `epoch_ms`.
    pub fn with_epoch(epoch_ms: Timestamp) -> Self {
        Self {
            epoch_ms,
            anchor: tokio::time::Instant::now(),
            next_id: AtomicU64::new(0),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.timers.lock().len()
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.epoch_ms + duration_ms(self.anchor.elapsed())
    }

    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = tokio::time::Instant::now() + delay;
        let timers = Arc::clone(&self.timers);

        // Hold the lock across spawn so the task cannot deregister before it is registered.
        let mut guard = self.timers.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if timers.lock().remove(&id).is_some() {
                callback();
            }
        });
        guard.insert(id, task);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self.timers.lock().remove(&handle.0) {
            task.abort();
        }
    }
}

impl Drop for TokioClock {
    fn drop(&mut self) {
        for (_, task) in self.timers.lock().drain() {
            task.abort();
        }
    }
}

/// Simulated clock for tests.
///
/// Timers fire only inside [`advance`](ManualClock::advance), in deadline
/// order, with ties broken by scheduling order. Callbacks run without the
/// clock's lock held, so they may schedule or cancel further timers.
pub struct ManualClock {
    inner: Mutex<ManualInner>,
}

struct ManualInner {
    now: Timestamp,
    next_id: u64,
    timers: BTreeMap<(Timestamp, u64), TimerCallback>,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            inner: Mutex::new(ManualInner {
                now: start,
                next_id: 0,
                timers: BTreeMap::new(),
            }),
        }
    }

    /// Move time forward by `by`, firing every timer that comes due.
    pub fn advance(&self, by: Duration) {
        let target = {
            let inner = self.inner.lock();
            inner.now.saturating_add(duration_ms(by))
        };

        loop {
            let due = {
                let mut inner = self.inner.lock();
                match inner.timers.first_key_value() {
                    Some((&(deadline, _), _)) if deadline <= target => {
                        inner.now = inner.now.max(deadline);
                        inner.timers.pop_first()
                    }
                    _ => {
                        inner.now = target;
                        None
                    }
                }
            };
            match due {
                Some((_, callback)) => callback(),
                None => break,
            }
        }
    }

    /// Number of armed timers.
    pub fn pending(&self) -> usize {
        self.inner.lock().timers.len()
    }

    /// Deadline of the earliest armed timer.
    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.inner
            .lock()
            .timers
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.inner.lock().now
    }

    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let deadline = inner.now.saturating_add(duration_ms(delay));
        inner.timers.insert((deadline, id), callback);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        self.inner
            .lock()
            .timers
            .retain(|&(_, id), _| id != handle.0);
    }
}
