// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An in-process, bounded byte pipe connecting two fibers: a pair of
//! cross-linked endpoints sharing one mutex. A write on one endpoint becomes
//! readable on the other. A full inbound buffer suspends the writer; an
//! empty, still-open one suspends the reader — both via the scheduler's
//! fiber-suspending [`FiberCondition`], never by blocking the OS thread.

use crate::{Buffer, Caps, CloseDirection, Error, Stream};
use scheduler::sync::{FiberCondition, FiberMutex};
use std::sync::Arc;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Mask: u8 {
        const READ = 0b01;
        const WRITE = 0b10;
    }
}

#[derive(Debug, Default)]
struct EndpointState {
    closed: Mask,
    cancelled: Mask,
}

impl Default for Mask {
    fn default() -> Self {
        Mask::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

impl Side {
    fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

struct State {
    /// Bytes B has written, waiting for A to read.
    buf_a: Buffer,
    /// Bytes A has written, waiting for B to read.
    buf_b: Buffer,
    a: EndpointState,
    b: EndpointState,
}

impl State {
    fn endpoint(&self, side: Side) -> &EndpointState {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }

    fn endpoint_mut(&mut self, side: Side) -> &mut EndpointState {
        match side {
            Side::A => &mut self.a,
            Side::B => &mut self.b,
        }
    }

    /// Buffer holding bytes addressed to `owner`, i.e. `owner`'s inbound
    /// buffer.
    fn buf_mut(&mut self, owner: Side) -> &mut Buffer {
        match owner {
            Side::A => &mut self.buf_a,
            Side::B => &mut self.buf_b,
        }
    }
}

struct Shared {
    state: FiberMutex<State>,
    /// Signaled when bytes are added to `owner`'s inbound buffer.
    not_empty_a: FiberCondition,
    not_empty_b: FiberCondition,
    /// Signaled when `owner`'s inbound buffer drains.
    not_full_a: FiberCondition,
    not_full_b: FiberCondition,
    capacity: usize,
}

impl Shared {
    fn not_empty(&self, owner: Side) -> &FiberCondition {
        match owner {
            Side::A => &self.not_empty_a,
            Side::B => &self.not_empty_b,
        }
    }

    fn not_full(&self, owner: Side) -> &FiberCondition {
        match owner {
            Side::A => &self.not_full_a,
            Side::B => &self.not_full_b,
        }
    }
}

/// One side of a [`pipe`]. Both sides are independently read- and
/// write-capable: writes on this endpoint surface as reads on the other and
/// vice versa. Cheap to clone — a clone is useful for calling
/// [`Stream::cancel_read`]/[`Stream::cancel_write`] from a fiber other than
/// the one suspended in `read`/`write`, which is exactly what those
/// operations are for.
#[derive(Clone)]
pub struct PipeEndpoint {
    shared: Arc<Shared>,
    side: Side,
}

/// Creates a bidirectional, bounded pipe: two endpoints sharing one mutex,
/// each with its own `capacity`-bounded inbound buffer. At most one fiber
/// may be suspended reading and one writing on each endpoint at a time;
/// concurrent readers or writers on the same endpoint is a precondition
/// violation this type does not defend against.
pub fn pipe(capacity: usize) -> (PipeEndpoint, PipeEndpoint) {
    let shared = Arc::new(Shared {
        state: FiberMutex::new(State {
            buf_a: Buffer::new(),
            buf_b: Buffer::new(),
            a: EndpointState::default(),
            b: EndpointState::default(),
        }),
        not_empty_a: FiberCondition::new(),
        not_empty_b: FiberCondition::new(),
        not_full_a: FiberCondition::new(),
        not_full_b: FiberCondition::new(),
        capacity,
    });
    (
        PipeEndpoint {
            shared: shared.clone(),
            side: Side::A,
        },
        PipeEndpoint {
            shared,
            side: Side::B,
        },
    )
}

impl Stream for PipeEndpoint {
    fn caps(&self) -> Caps {
        Caps::READ | Caps::WRITE | Caps::CANCEL
    }

    fn read(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        loop {
            let mut guard = self.shared.state.lock();
            if guard.endpoint(self.side).cancelled.contains(Mask::READ) {
                return Err(Error::OperationAborted);
            }
            let buf = guard.buf_mut(self.side);
            if !buf.is_empty() {
                let out = buf.consume(len);
                self.shared.not_full(self.side).notify_all();
                return Ok(out);
            }
            if guard.endpoint(self.side.peer()).closed.contains(Mask::WRITE) {
                return Ok(Vec::new());
            }
            self.shared.not_empty(self.side).wait(guard);
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        let target = self.side.peer();
        loop {
            let mut guard = self.shared.state.lock();
            if guard.endpoint(self.side).cancelled.contains(Mask::WRITE) {
                return Err(Error::OperationAborted);
            }
            if guard.endpoint(self.side).closed.contains(Mask::WRITE)
                || guard.endpoint(target).closed.contains(Mask::READ)
            {
                return Err(Error::BrokenPipe);
            }
            let buf = guard.buf_mut(target);
            let available = self.shared.capacity.saturating_sub(buf.len());
            if available == 0 {
                self.shared.not_full(target).wait(guard);
                continue;
            }
            let n = available.min(data.len());
            buf.extend(&data[..n]);
            self.shared.not_empty(target).notify_all();
            return Ok(n);
        }
    }

    fn close(&mut self, direction: CloseDirection) -> Result<(), Error> {
        let mut guard = self.shared.state.lock();
        if matches!(direction, CloseDirection::Read | CloseDirection::Both) {
            let endpoint = guard.endpoint_mut(self.side);
            endpoint.closed.insert(Mask::READ);
            endpoint.cancelled.remove(Mask::READ);
            guard.buf_mut(self.side).consume(usize::MAX);
            self.shared.not_full(self.side).notify_all();
        }
        if matches!(direction, CloseDirection::Write | CloseDirection::Both) {
            let endpoint = guard.endpoint_mut(self.side);
            endpoint.closed.insert(Mask::WRITE);
            endpoint.cancelled.remove(Mask::WRITE);
            self.shared.not_empty(self.side.peer()).notify_all();
        }
        Ok(())
    }

    fn cancel_read(&self) {
        let mut guard = self.shared.state.lock();
        guard.endpoint_mut(self.side).cancelled.insert(Mask::READ);
        drop(guard);
        tracing::trace!(side = ?self.side, "pipe read cancelled");
        self.shared.not_empty(self.side).notify_all();
    }

    fn cancel_write(&self) {
        let mut guard = self.shared.state.lock();
        guard.endpoint_mut(self.side).cancelled.insert(Mask::WRITE);
        drop(guard);
        tracing::trace!(side = ?self.side, "pipe write cancelled");
        self.shared.not_full(self.side.peer()).notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler::{Config, Scheduler};

    #[test]
    fn backpressure_limits_buffered_bytes() {
        let sched = Scheduler::new(&Config { worker_threads: 0 });
        let sched2 = sched.clone();
        sched.schedule_fn(move || {
            let (mut a, mut b) = pipe(16);
            let sched3 = Scheduler::current().unwrap();
            sched3.schedule_fn(move || {
                for _ in 0..4 {
                    let n = a.write(&[0xAB; 8]).unwrap();
                    assert!(n > 0);
                }
                a.close(CloseDirection::Write).unwrap();
            });

            let mut total = 0;
            loop {
                let chunk = b.read(8).unwrap();
                if chunk.is_empty() {
                    break;
                }
                total += chunk.len();
            }
            assert_eq!(total, 32);
            sched2.stop();
        });
        sched.dispatch();
    }

    #[test]
    fn each_endpoint_both_reads_and_writes() {
        let sched = Scheduler::new(&Config { worker_threads: 0 });
        let sched2 = sched.clone();
        sched.schedule_fn(move || {
            let (mut a, mut b) = pipe(64);
            assert_eq!(a.write(b"ping").unwrap(), 4);
            assert_eq!(b.read(4).unwrap(), b"ping");
            assert_eq!(b.write(b"pong").unwrap(), 4);
            assert_eq!(a.read(4).unwrap(), b"pong");
            sched2.stop();
        });
        sched.dispatch();
    }

    #[test]
    fn closing_write_side_eofs_peer_after_drain() {
        let sched = Scheduler::new(&Config { worker_threads: 0 });
        let sched2 = sched.clone();
        sched.schedule_fn(move || {
            let (mut a, mut b) = pipe(64);
            a.write(b"last").unwrap();
            a.close(CloseDirection::Write).unwrap();
            assert_eq!(b.read(4).unwrap(), b"last");
            assert_eq!(b.read(4).unwrap(), Vec::<u8>::new());
            sched2.stop();
        });
        sched.dispatch();
    }

    #[test]
    fn closing_read_side_fails_peer_write() {
        let sched = Scheduler::new(&Config { worker_threads: 0 });
        let sched2 = sched.clone();
        sched.schedule_fn(move || {
            let (mut a, mut b) = pipe(64);
            b.close(CloseDirection::Read).unwrap();
            let err = a.write(b"x").unwrap_err();
            assert!(matches!(err, Error::BrokenPipe));
            sched2.stop();
        });
        sched.dispatch();
    }

    #[test]
    fn cancel_read_aborts_a_suspended_reader() {
        let sched = Scheduler::new(&Config { worker_threads: 0 });
        let sched2 = sched.clone();
        sched.schedule_fn(move || {
            let (_a, mut b) = pipe(64);
            let canceller = b.clone();
            let sched3 = Scheduler::current().unwrap();
            sched3.schedule_fn(move || {
                canceller.cancel_read();
            });
            let err = b.read(4).unwrap_err();
            assert!(matches!(err, Error::OperationAborted));
            sched2.stop();
        });
        sched.dispatch();
    }
}
