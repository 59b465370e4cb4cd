// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperative, multi-thread-capable scheduler of [`fiber::Fiber`]s.
//!
//! A [`Scheduler`] owns a FIFO ready queue of `(fiber_or_closure,
//! target_worker_or_any)` entries and a pool of worker threads, each
//! repeatedly popping an entry it's allowed to run and `call()`ing it until
//! it either re-schedules itself (via [`yield_now`]) or finishes. Most work
//! is scheduled untargeted and picked up by whichever worker is free;
//! [`Scheduler::schedule_on`] and [`switch_to_on`] pin an entry to one
//! specific [`WorkerId`] instead. A scheduler can also run using the thread
//! that constructs it instead of (or in addition to) dedicated workers —
//! see [`Scheduler::dispatch`].

pub mod sync;

use fiber::{Fiber, FiberError};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

/// Tunables for a [`Scheduler`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of dedicated worker threads to spawn in addition to whatever
    /// thread calls [`Scheduler::dispatch`].
    pub worker_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { worker_threads: 1 }
    }
}

/// Identifies one of a scheduler's dedicated worker threads, stable for the
/// lifetime of the scheduler. Returned by [`Scheduler::worker_ids`] and
/// [`Scheduler::current_worker`]; pass one to [`Scheduler::schedule_on`] or
/// [`switch_to_on`] to pin work to that specific worker rather than letting
/// any idle worker pick it up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(usize);

/// Which worker a ready-queue entry is allowed to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Any,
    Worker(WorkerId),
}

enum Work {
    Fiber(Fiber),
    Fn(Box<dyn FnOnce() + Send + 'static>),
}

struct Entry {
    work: Work,
    target: Target,
}

struct Inner {
    ready: Mutex<VecDeque<Entry>>,
    cv: Condvar,
    stopping: AtomicBool,
    active: AtomicUsize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Number of dedicated workers spawned in `Scheduler::new`, i.e. the ids
    /// handed out up front as `WorkerId(0..dedicated_workers)`.
    dedicated_workers: usize,
    /// Source of ids for threads that join the dispatch loop later via
    /// `Scheduler::dispatch` ("use-caller" mode), seeded past the dedicated
    /// range so the two never collide.
    next_worker_id: AtomicUsize,
}

/// A handle to a scheduler. Cheap to clone; all clones share the same ready
/// queue and worker pool.
#[derive(Clone)]
pub struct Scheduler(Arc<Inner>);

impl PartialEq for Scheduler {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

thread_local! {
    static CURRENT: RefCell<Option<(Scheduler, WorkerId)>> = const { RefCell::new(None) };
}

impl Scheduler {
    /// Creates a scheduler and spawns `config.worker_threads` dedicated
    /// worker threads for it. With `worker_threads: 0` no threads are
    /// spawned and the constructing thread must call [`Scheduler::dispatch`]
    /// itself to drive the scheduler ("use-caller" mode).
    pub fn new(config: &Config) -> Self {
        let sched = Self(Arc::new(Inner {
            ready: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            stopping: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            workers: Mutex::new(Vec::with_capacity(config.worker_threads)),
            dedicated_workers: config.worker_threads,
            next_worker_id: AtomicUsize::new(config.worker_threads),
        }));

        let mut workers = sched.0.workers.lock().unwrap();
        for i in 0..config.worker_threads {
            let worker_sched = sched.clone();
            let id = WorkerId(i);
            workers.push(
                std::thread::Builder::new()
                    .name(format!("scheduler-worker-{i}"))
                    .spawn(move || worker_sched.dispatch_as(id))
                    .expect("failed to spawn scheduler worker thread"),
            );
        }
        drop(workers);

        sched
    }

    /// The scheduler running on this thread, if any.
    pub fn current() -> Option<Scheduler> {
        CURRENT.with(|c| c.borrow().as_ref().map(|(sched, _)| sched.clone()))
    }

    /// The id of the worker driving this thread's dispatch loop, if any.
    pub fn current_worker() -> Option<WorkerId> {
        CURRENT.with(|c| c.borrow().as_ref().map(|(_, id)| *id))
    }

    /// The ids of this scheduler's dedicated worker threads (not including
    /// any thread running [`Scheduler::dispatch`] in "use-caller" mode).
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.0.dedicated_workers).map(WorkerId).collect()
    }

    /// Schedules an existing, suspended fiber to be `call()`ed on some
    /// worker of this scheduler.
    pub fn schedule(&self, fiber: Fiber) {
        self.push(Work::Fiber(fiber), Target::Any);
    }

    /// Schedules an existing, suspended fiber to be `call()`ed on `worker`
    /// specifically, not any other worker of this scheduler.
    pub fn schedule_on(&self, fiber: Fiber, worker: WorkerId) {
        self.push(Work::Fiber(fiber), Target::Worker(worker));
    }

    /// Wraps `f` in a fresh fiber and schedules it.
    pub fn schedule_fn(&self, f: impl FnOnce() + Send + 'static) {
        self.push(Work::Fn(Box::new(f)), Target::Any);
    }

    /// Wraps `f` in a fresh fiber and schedules it on `worker` specifically.
    pub fn schedule_fn_on(&self, f: impl FnOnce() + Send + 'static, worker: WorkerId) {
        self.push(Work::Fn(Box::new(f)), Target::Worker(worker));
    }

    fn push(&self, work: Work, target: Target) {
        let mut ready = self.0.ready.lock().unwrap();
        ready.push_back(Entry { work, target });
        // A pinned entry can only be taken by one specific worker, so every
        // idle worker needs to wake up and re-check the queue rather than
        // just the one `notify_one` happens to pick.
        self.0.cv.notify_all();
    }

    /// Pops the first entry in `ready` that `worker` is allowed to run,
    /// re-queueing (at the back, preserving order) any pinned entries it
    /// scans past that target a different worker.
    fn take_matching(ready: &mut VecDeque<Entry>, worker: WorkerId) -> Option<Entry> {
        let scan = ready.len();
        for _ in 0..scan {
            let entry = ready.pop_front().expect("scanned within the queue's length");
            match entry.target {
                Target::Any => return Some(entry),
                Target::Worker(w) if w == worker => return Some(entry),
                Target::Worker(_) => ready.push_back(entry),
            }
        }
        None
    }

    /// Runs the scheduler's dispatch loop on the calling thread until
    /// [`Scheduler::stop`] is called and the ready queue drains. Draws a
    /// fresh [`WorkerId`] for the calling thread from beyond the dedicated
    /// worker range.
    pub fn dispatch(&self) {
        let id = WorkerId(self.0.next_worker_id.fetch_add(1, Ordering::Relaxed));
        self.dispatch_as(id);
    }

    fn dispatch_as(&self, id: WorkerId) {
        CURRENT.with(|c| *c.borrow_mut() = Some((self.clone(), id)));
        self.0.active.fetch_add(1, Ordering::AcqRel);

        loop {
            let entry = {
                let mut ready = self.0.ready.lock().unwrap();
                loop {
                    if let Some(entry) = Self::take_matching(&mut ready, id) {
                        break Some(entry);
                    }
                    if self.0.stopping.load(Ordering::Acquire) {
                        break None;
                    }
                    ready = self.0.cv.wait(ready).unwrap();
                }
            };

            let Some(entry) = entry else { break };

            let fiber = match entry.work {
                Work::Fiber(fiber) => fiber,
                Work::Fn(f) => Fiber::new(f),
            };

            trace!(state = ?fiber.state(), "resuming scheduled fiber");
            if let Err(err) = fiber.call() {
                warn!(error = %err, "fiber terminated with an error");
            }
        }

        self.0.active.fetch_sub(1, Ordering::AcqRel);
        CURRENT.with(|c| *c.borrow_mut() = None);
    }

    /// Stops the scheduler: dispatch loops drain their remaining ready work
    /// and then return. Already-running fibers are not interrupted. Joins
    /// every dedicated worker thread before returning. Idempotent — a second
    /// call is a no-op once the workers have already been joined.
    ///
    /// Call this from the thread that constructed the scheduler (or some
    /// other thread outside its worker pool), not from a fiber running on
    /// one of the workers being joined — that would deadlock the same way
    /// joining your own thread would.
    pub fn stop(&self) {
        self.0.stopping.store(true, Ordering::Release);
        self.0.cv.notify_all();
        for handle in self.0.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}

/// Suspends the current fiber and re-enqueues it on its own scheduler,
/// letting other ready fibers run before this one is resumed.
///
/// # Panics
///
/// Panics if called outside a fiber running under a scheduler's dispatch
/// loop.
pub fn yield_now() {
    let sched = Scheduler::current().expect("yield_now called outside a scheduler's dispatch loop");
    let fiber = Fiber::current().expect("yield_now called outside a fiber");
    sched.schedule(fiber);
    // Propagate errors injected while we were queued (e.g. scheduler
    // shutdown) as a panic: callers that care should use
    // `fiber::yield_current` directly and handle it themselves.
    fiber::yield_current().expect("fiber resumed with an unexpected injected error");
}

/// Moves the current fiber onto `target`, suspending it on whichever
/// scheduler it is currently running under. Equivalent to
/// `switch_to_on(target, None)` — any of `target`'s workers may pick it up.
///
/// # Panics
///
/// Panics if called outside a fiber running under a scheduler.
pub fn switch_to(target: &Scheduler) {
    switch_to_on(target, None);
}

/// Like [`switch_to`], but pins the fiber to a specific worker of `target`
/// when `worker` is `Some`.
///
/// # Panics
///
/// Panics if called outside a fiber running under a scheduler.
pub fn switch_to_on(target: &Scheduler, worker: Option<WorkerId>) {
    let from = Scheduler::current().expect("switch_to called outside a scheduler's dispatch loop");
    if from == *target && worker.is_none() {
        return;
    }
    let fiber = Fiber::current().expect("switch_to called outside a fiber");
    match worker {
        Some(worker) => target.schedule_on(fiber, worker),
        None => target.schedule(fiber),
    }
    fiber::yield_current().expect("fiber resumed with an unexpected injected error");
}

/// RAII guard that moves the current fiber onto a scheduler for the
/// duration of the guard, and back to the original scheduler on drop.
pub struct SchedulerSwitcher {
    previous: Option<Scheduler>,
}

impl SchedulerSwitcher {
    /// Switches the current fiber onto `target`.
    pub fn new(target: &Scheduler) -> Self {
        let previous = Scheduler::current();
        switch_to(target);
        Self { previous }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(prev) = &self.previous {
            switch_to(prev);
        }
    }
}

/// Runs `jobs` concurrently on the current scheduler, one fiber per job, and
/// waits for all of them to finish. Errors are collected in completion order
/// and the first one is returned to the caller; later ones are discarded,
/// same as Mordor's `Scheduler::parallelDo`.
pub fn parallel_do(jobs: Vec<Box<dyn FnOnce() -> Result<(), FiberError> + Send>>) -> Option<FiberError> {
    let sched = Scheduler::current().expect("parallel_do requires a scheduler");
    let remaining = Arc::new(sync::FiberCondvar::new(jobs.len()));
    let errors: Arc<Mutex<Vec<FiberError>>> = Arc::new(Mutex::new(Vec::new()));

    for job in jobs {
        let remaining = remaining.clone();
        let errors = errors.clone();
        sched.schedule_fn(move || {
            if let Err(err) = job() {
                errors.lock().unwrap().push(err);
            }
            remaining.count_down();
        });
    }

    remaining.wait_for_zero();
    errors.lock().unwrap().drain(..).next()
}

/// Runs `f` over `items` using up to `parallelism` concurrent fibers on the
/// current scheduler, stopping as soon as `f` returns `Ok(false)` or `Err` for
/// some item. Items already dispatched to other workers when the stop
/// happens may still run to completion. An error has the same stopping
/// effect as `Ok(false)` and is propagated to the caller (the first one, by
/// completion order) once every in-flight call has finished; otherwise
/// returns the item that stopped iteration, if any.
pub fn parallel_foreach<T, I, F>(items: I, parallelism: usize, f: F) -> Result<Option<T>, FiberError>
where
    T: Send + 'static,
    I: IntoIterator<Item = T>,
    I::IntoIter: Send + 'static,
    F: Fn(&T) -> Result<bool, FiberError> + Send + Sync + 'static,
{
    let sched = Scheduler::current().expect("parallel_foreach requires a scheduler");
    let items = Arc::new(Mutex::new(items.into_iter()));
    let stop = Arc::new(AtomicBool::new(false));
    let found: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let errors: Arc<Mutex<Vec<FiberError>>> = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);
    let remaining = Arc::new(sync::FiberCondvar::new(parallelism));

    for _ in 0..parallelism {
        let items = items.clone();
        let stop = stop.clone();
        let found = found.clone();
        let errors = errors.clone();
        let f = f.clone();
        let remaining = remaining.clone();
        sched.schedule_fn(move || {
            loop {
                if stop.load(Ordering::Acquire) {
                    break;
                }
                let item = items.lock().unwrap().next();
                let Some(item) = item else { break };
                match f(&item) {
                    Ok(true) => {}
                    Ok(false) => {
                        stop.store(true, Ordering::Release);
                        *found.lock().unwrap() = Some(item);
                        break;
                    }
                    Err(err) => {
                        stop.store(true, Ordering::Release);
                        errors.lock().unwrap().push(err);
                        break;
                    }
                }
            }
            remaining.count_down();
        });
    }

    remaining.wait_for_zero();
    debug!("parallel_foreach finished");
    if let Some(err) = errors.lock().unwrap().drain(..).next() {
        return Err(err);
    }
    Ok(found.lock().unwrap().take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn run_to_completion(config: Config, body: impl FnOnce() + Send + 'static) {
        let sched = Scheduler::new(&config);
        let sched2 = sched.clone();
        sched.schedule_fn(move || {
            body();
            sched2.stop();
        });
        sched.dispatch();
    }

    #[test]
    fn schedules_and_runs_a_fiber() {
        let (tx, rx) = mpsc::channel();
        run_to_completion(Config { worker_threads: 0 }, move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 42);
    }

    #[test]
    fn yield_now_lets_other_fibers_run() {
        let log: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let log_a = log.clone();
        let log_b = log.clone();

        run_to_completion(Config { worker_threads: 0 }, move || {
            let sched = Scheduler::current().unwrap();
            sched.schedule_fn(move || {
                log_a.lock().unwrap().push(1);
                yield_now();
                log_a.lock().unwrap().push(3);
            });
            sched.schedule_fn(move || {
                log_b.lock().unwrap().push(2);
            });
        });

        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn parallel_foreach_stops_early_without_overrunning() {
        let visited = Arc::new(Mutex::new(Vec::new()));
        let visited2 = visited.clone();
        let seen_count = Arc::new(AtomicUsize::new(0));
        let seen_count2 = seen_count.clone();

        run_to_completion(Config { worker_threads: 0 }, move || {
            let stopped_at = parallel_foreach(1..=10, 4, move |&x| {
                seen_count2.fetch_add(1, Ordering::SeqCst);
                visited2.lock().unwrap().push(x);
                Ok(x != 5)
            });
            assert_eq!(stopped_at.unwrap(), Some(5));
        });

        let visited = visited.lock().unwrap();
        assert!(visited.contains(&5));
        assert!(!visited.contains(&9) && !visited.contains(&10));
    }

    #[test]
    fn parallel_foreach_propagates_an_error() {
        run_to_completion(Config { worker_threads: 0 }, move || {
            let result = parallel_foreach(1..=10, 4, |&x| {
                if x == 5 {
                    Err("bad item".into())
                } else {
                    Ok(true)
                }
            });
            assert_eq!(result.unwrap_err().to_string(), "bad item");
        });
    }

    #[test]
    fn parallel_do_propagates_the_first_error() {
        run_to_completion(Config { worker_threads: 0 }, || {
            let jobs: Vec<Box<dyn FnOnce() -> Result<(), FiberError> + Send>> = vec![
                Box::new(|| Ok(())),
                Box::new(|| Err("job failed".into())),
            ];
            let err = parallel_do(jobs);
            assert!(err.is_some());
            assert_eq!(err.unwrap().to_string(), "job failed");
        });
    }

    #[test]
    fn parallel_do_returns_none_when_every_job_succeeds() {
        run_to_completion(Config { worker_threads: 0 }, || {
            let jobs: Vec<Box<dyn FnOnce() -> Result<(), FiberError> + Send>> =
                vec![Box::new(|| Ok(())), Box::new(|| Ok(()))];
            assert!(parallel_do(jobs).is_none());
        });
    }

    #[test]
    fn schedule_on_pins_work_to_the_requested_worker() {
        let sched = Scheduler::new(&Config { worker_threads: 2 });
        let ids = sched.worker_ids();
        assert_eq!(ids.len(), 2);
        let target = ids[1];

        let (tx, rx) = mpsc::channel();
        sched.schedule_fn_on(
            move || {
                tx.send(Scheduler::current_worker()).unwrap();
            },
            target,
        );

        assert_eq!(rx.recv().unwrap(), Some(target));
        sched.stop();
    }

    #[test]
    fn switch_to_on_moves_a_fiber_to_a_specific_worker() {
        let sched = Scheduler::new(&Config { worker_threads: 2 });
        let ids = sched.worker_ids();
        let target = ids[1];
        let sched2 = sched.clone();

        let (tx, rx) = mpsc::channel();
        sched.schedule_fn(move || {
            switch_to_on(&Scheduler::current().unwrap(), Some(target));
            tx.send(Scheduler::current_worker()).unwrap();
            sched2.stop();
        });

        assert_eq!(rx.recv().unwrap(), Some(target));
    }
}
