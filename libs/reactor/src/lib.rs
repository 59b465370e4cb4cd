// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An epoll-backed reactor that wakes fibers suspended on file descriptor
//! readiness or timer expiry.
//!
//! Unlike `Scheduler`, which only knows about ready work, `IOManager` also
//! knows how to *wait* for work to become ready. It runs its own poller
//! thread (rather than a virtual `idle()` hook the way Mordor's C++
//! `IOManagerEPoll` overrides `Scheduler::idle`, since Rust's `Scheduler` is
//! a concrete type, not a base class) that calls `epoll_wait`, expires due
//! timers, and reschedules whichever fiber was waiting back onto the
//! scheduler it registered from.

use fiber::Fiber;
use scheduler::Scheduler;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use timer::{SystemClock, Tickler, TimerManager};
use tracing::{trace, warn};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

/// Encodes a fd into an `epoll_event`'s `u64` data field and back. Fds are
/// always non-negative in practice, so round-tripping through `u32` loses
/// nothing.
fn fd_to_data(fd: RawFd) -> u64 {
    u64::from(u32::try_from(fd).expect("negative file descriptor"))
}

#[allow(clippy::cast_possible_wrap, reason = "epoll data was encoded by fd_to_data from a RawFd")]
fn data_to_fd(data: u64) -> RawFd {
    u32::try_from(data).expect("epoll data out of fd range") as RawFd
}

// libc's epoll_event flags are typed as `c_int`; epoll's `events` field is a
// `u32` bitmask, so every flag gets re-typed once here instead of at each
// use site.
#[allow(clippy::cast_sign_loss, reason = "epoll flag constants are always small and non-negative")]
mod flags {
    pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
    pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;
    pub const EPOLLERR: u32 = libc::EPOLLERR as u32;
    pub const EPOLLHUP: u32 = libc::EPOLLHUP as u32;
}

impl Interest {
    fn to_epoll_bits(self) -> u32 {
        let mut bits = 0;
        if self.contains(Interest::READ) {
            bits |= flags::EPOLLIN;
        }
        if self.contains(Interest::WRITE) {
            bits |= flags::EPOLLOUT;
        }
        bits
    }
}

/// Re-exported so callers matching on a cancelled wait don't need a direct
/// dependency on `stream` just to name [`Error::OperationAborted`].
pub use stream::Error;

struct Waiter {
    fiber: Fiber,
    scheduler: Scheduler,
}

#[derive(Default)]
struct PendingEvent {
    epoll_bits: u32,
    read: Option<Waiter>,
    write: Option<Waiter>,
}

struct PipeTickler {
    write_fd: RawFd,
}

impl Tickler for PipeTickler {
    fn on_front_insert(&self) {
        let byte = b'T';
        // Safety: `write_fd` is the write end of a pipe kept open for the
        // lifetime of the owning `IOManager`; a short write to a pipe is
        // always either 1 byte or EAGAIN, both harmless to ignore here.
        unsafe {
            libc::write(self.write_fd, std::ptr::from_ref(&byte).cast(), 1);
        }
    }
}

struct Shared {
    epoll_fd: RawFd,
    tickle_r: RawFd,
    tickle_w: RawFd,
    pending: Mutex<HashMap<RawFd, PendingEvent>>,
    timers: TimerManager,
    stopping: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Safety: all three fds are owned exclusively by this `Shared` and
        // opened once in `IOManager::new`.
        unsafe {
            libc::close(self.epoll_fd);
            libc::close(self.tickle_r);
            libc::close(self.tickle_w);
        }
    }
}

/// A handle to the reactor. Cheap to clone; clones share the same epoll
/// instance, pending-event table, and timer wheel.
#[derive(Clone)]
pub struct IOManager {
    shared: Arc<Shared>,
}

impl IOManager {
    /// Creates an `IOManager` and spawns its poller thread. Expired timers
    /// and ready fibers are scheduled back onto whatever [`Scheduler`] each
    /// caller registered from.
    pub fn new() -> std::io::Result<(Self, JoinHandle<()>)> {
        // Safety: `epoll_create1` has no preconditions beyond a valid flags
        // argument; 0 requests no special behavior.
        let epoll_fd = unsafe { libc::epoll_create1(0) };
        if epoll_fd < 0 {
            return Err(std::io::Error::last_os_error());
        }

        let mut fds = [0; 2];
        // Safety: `fds` is a valid, correctly-sized out-pointer for `pipe2`.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) };
        if rc != 0 {
            // Safety: `epoll_fd` was just opened above and nothing else owns it yet.
            unsafe {
                libc::close(epoll_fd);
            }
            return Err(std::io::Error::last_os_error());
        }
        let (tickle_r, tickle_w) = (fds[0], fds[1]);

        let mut ev = libc::epoll_event {
            events: flags::EPOLLIN,
            u64: fd_to_data(tickle_r),
        };
        // Safety: `epoll_fd` and `tickle_r` are both freshly created valid fds
        // and `ev` is a properly initialized `epoll_event`.
        let rc = unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, tickle_r, &mut ev) };
        if rc != 0 {
            // Safety: all three fds were just opened above and nothing else owns them yet.
            unsafe {
                libc::close(epoll_fd);
                libc::close(tickle_r);
                libc::close(tickle_w);
            }
            return Err(std::io::Error::last_os_error());
        }

        let tickler: Arc<dyn Tickler> = Arc::new(PipeTickler { write_fd: tickle_w });
        let shared = Arc::new(Shared {
            epoll_fd,
            tickle_r,
            tickle_w,
            pending: Mutex::new(HashMap::new()),
            timers: TimerManager::with_tickler(SystemClock::default(), Some(tickler)),
            stopping: AtomicBool::new(false),
        });

        let poller = shared.clone();
        let handle = std::thread::Builder::new()
            .name("io-manager".into())
            .spawn(move || poll_loop(&poller))
            .expect("failed to spawn io-manager poller thread");

        Ok((Self { shared }, handle))
    }

    /// Registers the current fiber to be woken when `fd` becomes ready for
    /// any of `interest`'s directions. Does not itself suspend the fiber —
    /// callers pair this with [`fiber::yield_current`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a fiber, or outside a scheduler's dispatch
    /// loop.
    pub fn register_event(&self, fd: RawFd, interest: Interest) -> std::io::Result<()> {
        let fiber = Fiber::current().expect("register_event called outside a fiber");
        let scheduler =
            Scheduler::current().expect("register_event called outside a scheduler's dispatch loop");

        let mut pending = self.shared.pending.lock().unwrap();
        let entry = pending.entry(fd).or_default();
        let op = if entry.epoll_bits == 0 {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        entry.epoll_bits |= interest.to_epoll_bits();
        if interest.contains(Interest::READ) {
            entry.read = Some(Waiter {
                fiber: fiber.clone(),
                scheduler: scheduler.clone(),
            });
        }
        if interest.contains(Interest::WRITE) {
            entry.write = Some(Waiter { fiber, scheduler });
        }

        let mut ev = libc::epoll_event {
            events: entry.epoll_bits,
            u64: fd_to_data(fd),
        };
        drop(pending);

        // Safety: `self.shared.epoll_fd` is a live epoll instance and `ev` is
        // a properly initialized event describing `fd`.
        let rc = unsafe { libc::epoll_ctl(self.shared.epoll_fd, op, fd, &mut ev) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    /// Removes `interest` for `fd` without waking any waiter, e.g. because
    /// the caller already knows there isn't one (the fd is about to be
    /// closed).
    pub fn unregister_event(&self, fd: RawFd, interest: Interest) -> bool {
        let mut pending = self.shared.pending.lock().unwrap();
        let Some(entry) = pending.get_mut(&fd) else {
            return false;
        };
        let bits = interest.to_epoll_bits();
        if entry.epoll_bits & bits == 0 {
            return false;
        }
        if interest.contains(Interest::READ) {
            entry.read = None;
        }
        if interest.contains(Interest::WRITE) {
            entry.write = None;
        }
        entry.epoll_bits &= !bits;
        apply_epoll_update(&self.shared, &mut pending, fd);
        true
    }

    /// Cancels a pending registration, waking the waiting fiber immediately
    /// with [`Error::OperationAborted`] instead of real readiness.
    pub fn cancel_event(&self, fd: RawFd, interest: Interest) -> bool {
        let mut pending = self.shared.pending.lock().unwrap();
        let Some(entry) = pending.get_mut(&fd) else {
            return false;
        };
        let bits = interest.to_epoll_bits();
        if entry.epoll_bits & bits == 0 {
            return false;
        }
        let mut woke = false;
        if interest.contains(Interest::READ) {
            if let Some(waiter) = entry.read.take() {
                abort_waiter(waiter);
                woke = true;
            }
        }
        if interest.contains(Interest::WRITE) {
            if let Some(waiter) = entry.write.take() {
                abort_waiter(waiter);
                woke = true;
            }
        }
        entry.epoll_bits &= !bits;
        apply_epoll_update(&self.shared, &mut pending, fd);
        woke
    }

    /// Registers a one-shot timer, waking up the poller if it's now the
    /// earliest pending deadline.
    pub fn register_timer(
        &self,
        duration_us: u64,
        callback: impl Fn() + Send + Sync + 'static,
        recurring: bool,
    ) -> timer::Timer {
        self.shared.timers.register_timer(duration_us, callback, recurring)
    }

    /// Stops the poller thread once every pending event has been delivered.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        let byte = b'T';
        // Safety: see `PipeTickler::on_front_insert`.
        unsafe {
            libc::write(self.shared.tickle_w, std::ptr::from_ref(&byte).cast(), 1);
        }
    }
}

fn abort_waiter(waiter: Waiter) {
    waiter.fiber.inject(Box::new(Error::OperationAborted));
    waiter.scheduler.schedule(waiter.fiber);
}

fn apply_epoll_update(shared: &Shared, pending: &mut HashMap<RawFd, PendingEvent>, fd: RawFd) {
    let bits = pending.get(&fd).map(|e| e.epoll_bits).unwrap_or(0);
    let op = if bits == 0 {
        libc::EPOLL_CTL_DEL
    } else {
        libc::EPOLL_CTL_MOD
    };
    let mut ev = libc::epoll_event {
        events: bits,
        u64: fd_to_data(fd),
    };
    // Safety: `shared.epoll_fd` is a live epoll instance; `ev` is valid for
    // both MOD and DEL (DEL ignores its `events` field on modern kernels).
    let rc = unsafe { libc::epoll_ctl(shared.epoll_fd, op, fd, &mut ev) };
    if rc != 0 {
        warn!(fd, error = %std::io::Error::last_os_error(), "epoll_ctl failed");
    }
    if bits == 0 {
        pending.remove(&fd);
    }
}

fn poll_loop(shared: &Arc<Shared>) {
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 64];
    loop {
        if shared.stopping.load(Ordering::Acquire)
            && shared.pending.lock().unwrap().is_empty()
            && shared.timers.next_timer().is_none()
        {
            return;
        }

        let callbacks = shared.timers.process_timers();
        for cb in callbacks {
            cb();
        }

        let timeout_ms = match shared.timers.next_timer() {
            None => -1,
            Some(us) => i32::try_from(us / 1000 + 1).unwrap_or(i32::MAX),
        };

        let max_events = i32::try_from(events.len()).unwrap_or(i32::MAX);
        // Safety: `events` is a correctly-sized buffer and `shared.epoll_fd`
        // is a live epoll instance for the lifetime of `shared`.
        let rc = unsafe { libc::epoll_wait(shared.epoll_fd, events.as_mut_ptr(), max_events, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            warn!(error = %err, "epoll_wait failed");
            continue;
        }
        let ready = usize::try_from(rc).unwrap_or(0);

        for ev in &events[..ready] {
            let fd = data_to_fd(ev.u64);
            if fd == shared.tickle_r {
                let mut buf = [0u8; 16];
                // Safety: `tickle_r` is a valid, open, non-blocking read end
                // and `buf` is a correctly-sized stack buffer.
                unsafe {
                    libc::read(shared.tickle_r, buf.as_mut_ptr().cast(), buf.len());
                }
                trace!("poller received tickle");
                continue;
            }

            let mut pending = shared.pending.lock().unwrap();
            let Some(entry) = pending.get_mut(&fd) else {
                continue;
            };
            let err = ev.events & (flags::EPOLLERR | flags::EPOLLHUP) != 0;
            let readable = err || ev.events & flags::EPOLLIN != 0;
            let writable = err || ev.events & flags::EPOLLOUT != 0;

            if readable {
                if let Some(waiter) = entry.read.take() {
                    entry.epoll_bits &= !flags::EPOLLIN;
                    waiter.scheduler.schedule(waiter.fiber);
                }
            }
            if writable {
                if let Some(waiter) = entry.write.take() {
                    entry.epoll_bits &= !flags::EPOLLOUT;
                    waiter.scheduler.schedule(waiter.fiber);
                }
            }
            apply_epoll_update(shared, &mut pending, fd);
        }
    }
}
