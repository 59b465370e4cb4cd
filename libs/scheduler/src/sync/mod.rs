// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber-suspending synchronization primitives.
//!
//! A plain [`std::sync::Mutex`] blocks the whole OS thread while contended,
//! which would starve every other fiber sharing that worker. These
//! primitives suspend only the calling *fiber* (via [`crate::yield_now`]),
//! letting the scheduler run other ready work while waiting.

use crate::yield_now;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A mutex whose contended `lock()` suspends the current fiber instead of
/// blocking the OS thread.
pub struct FiberMutex<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

// Safety: access to `value` is only ever granted to the single fiber holding
// `locked`, established with an acquire/release pair on `locked`.
unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, suspending the current fiber while contended.
    ///
    /// # Panics
    ///
    /// Panics if called outside a fiber running under a scheduler.
    pub fn lock(&self) -> FiberMutexGuard<'_, T> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            yield_now();
        }
        FiberMutexGuard { mutex: self }
    }
}

pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
}

impl<T> Deref for FiberMutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // Safety: we hold `locked`.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: we hold `locked`.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.locked.store(false, Ordering::Release);
    }
}

/// A condition variable whose `wait` suspends the current fiber instead of
/// blocking the OS thread. `notify_*` just bumps a generation counter;
/// waiters poll it, trading a little busy-work for not needing a per-waiter
/// wake list.
pub struct FiberCondition {
    generation: AtomicUsize,
}

impl Default for FiberCondition {
    fn default() -> Self {
        Self::new()
    }
}

impl FiberCondition {
    pub fn new() -> Self {
        Self {
            generation: AtomicUsize::new(0),
        }
    }

    /// Releases `guard`'s lock, suspends the current fiber until the next
    /// `notify_*`, then re-acquires it.
    pub fn wait<'a, T>(&self, guard: FiberMutexGuard<'a, T>) -> FiberMutexGuard<'a, T> {
        let mutex = guard.mutex;
        let seen = self.generation.load(Ordering::Acquire);
        drop(guard);
        while self.generation.load(Ordering::Acquire) == seen {
            yield_now();
        }
        mutex.lock()
    }

    pub fn notify_one(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn notify_all(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// A one-shot countdown latch used to wait for a fixed number of concurrent
/// fibers to finish, suspending the calling fiber rather than its thread.
pub struct FiberCondvar {
    remaining: AtomicUsize,
}

impl FiberCondvar {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
        }
    }

    pub fn count_down(&self) {
        self.remaining.fetch_sub(1, Ordering::AcqRel);
    }

    /// Suspends the current fiber until the count reaches zero.
    pub fn wait_for_zero(&self) {
        while self.remaining.load(Ordering::Acquire) != 0 {
            yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Scheduler};
    use std::sync::Arc;

    #[test]
    fn mutex_serializes_concurrent_fibers() {
        let sched = Scheduler::new(&Config { worker_threads: 0 });
        let mutex = Arc::new(FiberMutex::new(0));
        let sched2 = sched.clone();

        sched.schedule_fn(move || {
            let sched = Scheduler::current().unwrap();
            let latch = Arc::new(FiberCondvar::new(10));
            for _ in 0..10 {
                let mutex = mutex.clone();
                let latch = latch.clone();
                sched.schedule_fn(move || {
                    let mut guard = mutex.lock();
                    *guard += 1;
                    latch.count_down();
                });
            }
            latch.wait_for_zero();
            assert_eq!(*mutex.lock(), 10);
            sched2.stop();
        });
        sched.dispatch();
    }
}
