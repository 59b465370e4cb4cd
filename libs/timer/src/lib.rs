//! Ordered timers with monotonic-clock semantics and rollback detection.
//!
//! Mirrors `Mordor::TimerManager`/`Mordor::Timer` (see
//! `mordor/timer.cpp`/`timer.h` in the retrieved original sources): an ordered set
//! of one-shot or recurring timers keyed by absolute fire time, with a coalesced
//! "tickled" flag for front-inserts and detection of backward clock jumps.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

/// Default threshold (microseconds) beyond which a backward clock jump is
/// treated as a rollback rather than ordinary drift. Matches the 5s default
/// named in spec.md §6 / §4.2.
pub const DEFAULT_ROLLBACK_THRESHOLD_US: u64 = 5_000_000;

/// Source of the monotonic microsecond clock `TimerManager` uses.
///
/// Production code uses [`SystemClock`]; tests substitute a fake so that
/// rollback and expiry can be driven deterministically (see spec.md §4.2:
/// "A test hook replaces the clock function").
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Wall clock backed by a monotonic [`Instant`], used outside of tests.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Hook invoked when a timer is inserted (or reset) ahead of every other
/// timer currently registered. `reactor::IOManager` implements this to tickle
/// its blocked idle fiber; see spec.md §4.2 and §B.3 of SPEC_FULL.md.
pub trait Tickler: Send + Sync {
    fn on_front_insert(&self);
}

/// Callback handed back by [`TimerManager::process_timers`]. Stored as an
/// `Arc<dyn Fn>` rather than `FnOnce` so recurring timers can fire the same
/// callback across multiple rounds (mirrors `boost::function<void()>` being
/// copyable in the original `mordor/timer.cpp`).
type Callback = Arc<dyn Fn() + Send + Sync>;
type Key = (u64, u64);

struct TimerState {
    key: Key,
    duration_us: u64,
    recurring: bool,
    callback: Option<Callback>,
    armed: bool,
}

struct TimerInner {
    seq: u64,
    state: Mutex<TimerState>,
}

struct Inner {
    timers: BTreeMap<Key, Arc<TimerInner>>,
    next_seq: u64,
    tickled: bool,
    previous_now: Option<u64>,
    rollback_threshold_us: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    clock: Box<dyn Clock>,
    tickler: Option<Arc<dyn Tickler>>,
}

/// Ordered set of timers plus the bookkeeping (clock sampling, rollback
/// detection, front-insert tickling) described in spec.md §4.2.
pub struct TimerManager {
    shared: Arc<Shared>,
}

impl TimerManager {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self::with_tickler(clock, None)
    }

    pub fn with_tickler(clock: impl Clock + 'static, tickler: Option<Arc<dyn Tickler>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    timers: BTreeMap::new(),
                    next_seq: 0,
                    tickled: false,
                    previous_now: None,
                    rollback_threshold_us: DEFAULT_ROLLBACK_THRESHOLD_US,
                }),
                clock: Box::new(clock),
                tickler,
            }),
        }
    }

    pub fn set_rollback_threshold_us(&self, threshold_us: u64) {
        self.shared.inner.lock().unwrap().rollback_threshold_us = threshold_us;
    }

    fn now(&self) -> u64 {
        self.shared.clock.now_us()
    }

    /// Registers a one-shot or recurring timer firing `duration_us` from now.
    pub fn register_timer(
        &self,
        duration_us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> Timer {
        self.register_timer_at(self.now(), duration_us, Arc::new(callback), recurring)
    }

    /// Registers a timer that only fires while `guard` is still alive;
    /// otherwise the firing is silently skipped (spec.md §4.2).
    pub fn register_condition_timer<T: Send + Sync + 'static>(
        &self,
        duration_us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        guard: Weak<T>,
        recurring: bool,
    ) -> Timer {
        let wrapped: Callback = Arc::new(move || {
            if guard.upgrade().is_some() {
                callback();
            }
        });
        self.register_timer_at(self.now(), duration_us, wrapped, recurring)
    }

    fn register_timer_at(
        &self,
        now: u64,
        duration_us: u64,
        callback: Callback,
        recurring: bool,
    ) -> Timer {
        let mut inner = self.shared.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        let key = (now.saturating_add(duration_us), seq);
        let was_front = inner.timers.keys().next().is_none_or(|front| key < *front);
        let entry = Arc::new(TimerInner {
            seq,
            state: Mutex::new(TimerState {
                key,
                duration_us,
                recurring,
                callback: Some(callback),
                armed: true,
            }),
        });
        inner.timers.insert(key, entry.clone());
        if was_front {
            inner.tickled = true;
            drop(inner);
            if let Some(tickler) = &self.shared.tickler {
                tickler.on_front_insert();
            }
        }
        Timer {
            shared: self.shared.clone(),
            inner: entry,
        }
    }

    /// Duration until the earliest timer fires, clearing the coalesced
    /// "tickled" flag (spec.md §4.2).
    pub fn next_timer(&self) -> Option<u64> {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.tickled = false;
        let front = *inner.timers.keys().next()?;
        drop(inner);
        let now = self.now();
        Some(front.0.saturating_sub(now))
    }

    /// Whether a registration since the last [`Self::next_timer`] call would
    /// otherwise have been missed by a waiter already blocked on the old
    /// timeout.
    pub fn tickled(&self) -> bool {
        self.shared.inner.lock().unwrap().tickled
    }

    /// Removes and returns every callback whose fire time is `<= now`,
    /// re-arming recurring timers. A clock rollback beyond the threshold
    /// expires every pending timer (spec.md §4.2, §8 scenario 4).
    pub fn process_timers(&self) -> Vec<Callback> {
        let mut inner = self.shared.inner.lock().unwrap();
        let now = self.now();
        let rollback = inner
            .previous_now
            .is_some_and(|prev| now.saturating_add(inner.rollback_threshold_us) < prev);
        inner.previous_now = Some(now);

        if rollback {
            tracing::warn!(now, "clock rollback detected, expiring all timers");
        }

        let mut expired_keys = Vec::new();
        for (&key, _) in &inner.timers {
            if rollback || key.0 <= now {
                expired_keys.push(key);
            } else {
                break;
            }
        }

        let mut callbacks = Vec::with_capacity(expired_keys.len());
        let mut rearm = Vec::new();
        for key in expired_keys {
            let Some(entry) = inner.timers.remove(&key) else {
                continue;
            };
            let mut state = entry.state.lock().unwrap();
            state.armed = false;
            if let Some(cb) = state.callback.clone() {
                callbacks.push(cb);
            }
            if state.recurring {
                rearm.push((entry.clone(), state.duration_us));
            }
            drop(state);
        }

        for (entry, duration_us) in rearm {
            let new_key = (now.saturating_add(duration_us), entry.seq);
            let mut state = entry.state.lock().unwrap();
            state.key = new_key;
            state.armed = true;
            drop(state);
            inner.timers.insert(new_key, entry);
        }

        callbacks
    }
}

/// Handle to a registered timer. Cloning a [`Timer`] is not supported: each
/// `register_*` call returns the sole handle, matching Mordor's `Timer::ptr`
/// being privately owned by the caller that registered it.
pub struct Timer {
    shared: Arc<Shared>,
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Cancels the timer if it has not yet fired. Idempotent: a second call
    /// returns `false` (spec.md §8 round-trip law).
    pub fn cancel(&self) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if !state.armed {
            return false;
        }
        inner.timers.remove(&state.key);
        state.armed = false;
        state.callback = None;
        true
    }

    /// Resets the timer to fire `duration_us` from now, using its original
    /// interval. Returns whether it was refreshed before firing.
    pub fn refresh(&self) -> bool {
        let duration = self.inner.state.lock().unwrap().duration_us;
        self.reset(duration, true)
    }

    /// Resets the timer to a new delay, either relative to now or relative
    /// to its original start time.
    pub fn reset(&self, duration_us: u64, from_now: bool) -> bool {
        let mut inner = self.shared.inner.lock().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if !state.armed {
            return false;
        }
        inner.timers.remove(&state.key);
        let now = self.shared.clock.now_us();
        let new_next = if from_now {
            now.saturating_add(duration_us)
        } else {
            let old_next = state.key.0;
            old_next
                .saturating_sub(state.duration_us)
                .saturating_add(duration_us)
        };
        state.duration_us = duration_us;
        let new_key = (new_next, self.inner.seq);
        state.key = new_key;
        let was_front = inner.timers.keys().next().is_none_or(|front| new_key < *front);
        inner.timers.insert(new_key, self.inner.clone());
        if was_front {
            inner.tickled = true;
            drop(state);
            drop(inner);
            if let Some(tickler) = &self.shared.tickler {
                tickler.on_front_insert();
            }
            return true;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeClock(AtomicU64);
    impl Clock for Arc<FakeClock> {
        fn now_us(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn zero_duration_timer_fires_next_tick() {
        let clock = Arc::new(FakeClock(AtomicU64::new(0)));
        let mgr = TimerManager::new(clock.clone());
        let fired = Arc::new(Mutex::new(false));
        let f = fired.clone();
        mgr.register_timer(0, move || *f.lock().unwrap() = true, false);
        let cbs = mgr.process_timers();
        assert_eq!(cbs.len(), 1);
        cbs.into_iter().for_each(|cb| cb());
        assert!(*fired.lock().unwrap());
    }

    #[test]
    fn cancel_is_idempotent() {
        let clock = Arc::new(FakeClock(AtomicU64::new(0)));
        let mgr = TimerManager::new(clock);
        let t = mgr.register_timer(1_000, || {}, false);
        assert!(t.cancel());
        assert!(!t.cancel());
    }

    #[test]
    fn rollback_expires_everything_in_one_batch() {
        // spec.md §8 scenario 4: three timers at +100us/+200us/+10s, then a
        // clock value 6s earlier than the last sample expires all three.
        let clock = Arc::new(FakeClock(AtomicU64::new(20_000_000)));
        let mgr = TimerManager::new(clock.clone());
        let count = Arc::new(Mutex::new(0usize));
        for delay in [100, 200, 10_000_000] {
            let c = count.clone();
            mgr.register_timer(delay, move || *c.lock().unwrap() += 1, false);
        }
        // establish a previous_now sample
        mgr.process_timers();
        clock.0.store(20_000_000 - 6_000_000, Ordering::SeqCst);
        let cbs = mgr.process_timers();
        assert_eq!(cbs.len(), 3);
    }

    #[test]
    fn condition_timer_skips_when_guard_dropped() {
        let clock = Arc::new(FakeClock(AtomicU64::new(0)));
        let mgr = TimerManager::new(clock);
        let guard = Arc::new(());
        let fired = Arc::new(Mutex::new(false));
        let f = fired.clone();
        mgr.register_condition_timer(0, move || *f.lock().unwrap() = true, Arc::downgrade(&guard), false);
        drop(guard);
        let cbs = mgr.process_timers();
        cbs.into_iter().for_each(|cb| cb());
        assert!(!*fired.lock().unwrap());
    }

    #[test]
    fn recurring_timer_rearms() {
        let clock = Arc::new(FakeClock(AtomicU64::new(0)));
        let mgr = TimerManager::new(clock.clone());
        let count = Arc::new(Mutex::new(0usize));
        let c = count.clone();
        mgr.register_timer(100, move || *c.lock().unwrap() += 1, true);
        clock.0.store(100, Ordering::SeqCst);
        let cbs = mgr.process_timers();
        assert_eq!(cbs.len(), 1);
        cbs.into_iter().for_each(|cb| cb());
        // still armed for the next round
        clock.0.store(250, Ordering::SeqCst);
        assert_eq!(mgr.process_timers().len(), 1);
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
