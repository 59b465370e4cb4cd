// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Stackful fibers: cooperatively-scheduled contexts that can suspend and
//! resume anywhere in their call stack, not just at the top level.
//!
//! Unlike a plain generator, a [`Fiber`] does not merely yield back to
//! whoever called [`Fiber::call`] — [`Fiber::yield_to`] lets it hand control
//! to an arbitrary other fiber, and static [`yield_current`] lets it hand
//! control back to the fiber that originally `call()`ed it, however deep the
//! intervening call chain got. A scheduler builds cooperative multitasking
//! on top of this primitive.

mod arch;
mod stack;

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

pub use stack::{DefaultFiberStack, FiberStack, MIN_STACK_SIZE, StackPointer};

/// Tunables for fiber creation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Size in bytes of a fresh fiber's stack, excluding the guard page.
    pub stack_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack_size: 1024 * 1024,
        }
    }
}

/// An error raised or propagated across a fiber switch.
pub type FiberError = Box<dyn std::error::Error + Send + Sync>;

/// A fiber's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Constructed, or reset, but never resumed.
    Init,
    /// Currently running on some thread.
    Exec,
    /// Suspended; may be resumed with [`Fiber::call`] or [`Fiber::yield_to`].
    Hold,
    /// Its entry function returned normally. Terminal.
    Term,
    /// Its entry function unwound. Terminal; see [`Fiber::call`]'s return
    /// value for the propagated error.
    Except,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Init => "init",
            State::Exec => "exec",
            State::Hold => "hold",
            State::Term => "term",
            State::Except => "except",
        };
        f.write_str(s)
    }
}

struct FiberInner {
    /// Saved stack pointer; meaningless while `state == Exec`.
    sp: Cell<usize>,
    /// `None` for the pseudo-fiber representing a plain OS thread.
    stack: Option<DefaultFiberStack>,
    state: Cell<State>,
    /// Set iff this fiber was entered through [`Fiber::call`] rather than
    /// [`Fiber::yield_to`].
    outer: RefCell<Option<Arc<FiberInner>>>,
    /// Mailbox: set by whoever is about to switch into this fiber with a
    /// "yield" (not "call") switch. Read once by whoever next gains control
    /// on this fiber's stack, to learn which state to apply to the fiber
    /// that yielded control away.
    yielder: RefCell<Option<Arc<FiberInner>>>,
    yielder_next_state: Cell<State>,
    /// Set by the trampoline when the fiber's entry function unwinds.
    /// Consumed by whoever resumes this fiber and observes it terminate.
    termination_error: RefCell<Option<FiberError>>,
    /// Set by [`Fiber::inject`]. Consumed by this fiber itself the next time
    /// one of its own suspension points resumes.
    injected_error: RefCell<Option<FiberError>>,
    entry: RefCell<Option<Box<dyn FnOnce() + 'static>>>,
    fls: RefCell<Vec<usize>>,
}

// Safety: a `FiberInner` is only ever touched by whichever single thread is
// currently running it, or is about to switch it to another thread while
// `state == Hold`; the scheduler's run queue provides the happens-before
// edge for that handoff, the same way it would for any other `Send` task.
unsafe impl Send for FiberInner {}
unsafe impl Sync for FiberInner {}

impl FiberInner {
    fn root() -> Self {
        Self {
            sp: Cell::new(0),
            stack: None,
            state: Cell::new(State::Exec),
            outer: RefCell::new(None),
            yielder: RefCell::new(None),
            yielder_next_state: Cell::new(State::Hold),
            termination_error: RefCell::new(None),
            injected_error: RefCell::new(None),
            entry: RefCell::new(None),
            fls: RefCell::new(Vec::new()),
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Arc<FiberInner>> = RefCell::new(Arc::new(FiberInner::root()));
}

/// A stackful fiber.
///
/// Cloning a `Fiber` shares the same underlying context; there is exactly
/// one logical fiber per allocation, referenced by however many handles
/// point at it.
#[derive(Clone)]
pub struct Fiber(Arc<FiberInner>);

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("state", &self.0.state.get()).finish()
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Injected into a fiber that is being dropped while still suspended, so
/// its stack unwinds and any `Drop` types it holds (a `FiberMutexGuard`, a
/// stream, ...) run their destructors before the fiber's own allocation is
/// freed.
#[derive(Debug)]
struct DroppedWhileSuspended;

impl fmt::Display for DroppedWhileSuspended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("fiber dropped while suspended")
    }
}

impl std::error::Error for DroppedWhileSuspended {}

impl Drop for Fiber {
    fn drop(&mut self) {
        // `strong_count == 1` means this is the last live handle — the Arc's
        // own refcount hasn't been decremented yet at this point in `drop`,
        // so this check runs before the drop that's about to bring it to 0.
        // A fiber recorded as some other fiber's `outer` stays `Exec`, not
        // `Hold`, for as long as that other fiber is its caller, so this
        // can't mistake a fiber merely parked mid-call for an abandoned one.
        if Arc::strong_count(&self.0) == 1 && self.0.state.get() == State::Hold {
            self.inject(Box::new(DroppedWhileSuspended));
            let _ = self.call();
        }
    }
}

impl Fiber {
    /// Creates a new fiber with the default [`Config`].
    pub fn new(entry: impl FnOnce() + 'static) -> Self {
        Self::with_config(entry, &Config::default())
    }

    /// Creates a new fiber with an explicit [`Config`].
    pub fn with_config(entry: impl FnOnce() + 'static, config: &Config) -> Self {
        let stack =
            DefaultFiberStack::new(config.stack_size).expect("failed to allocate fiber stack");
        let top = stack.top();

        let inner = Arc::new(FiberInner {
            sp: Cell::new(0),
            stack: Some(stack),
            state: Cell::new(State::Init),
            outer: RefCell::new(None),
            yielder: RefCell::new(None),
            yielder_next_state: Cell::new(State::Hold),
            termination_error: RefCell::new(None),
            injected_error: RefCell::new(None),
            entry: RefCell::new(Some(Box::new(entry))),
            fls: RefCell::new(Vec::new()),
        });

        // Safety: `top` is freshly mmap'd and not aliased by anything else.
        let sp = unsafe { arch::init_stack(top, trampoline) };
        inner.sp.set(sp.get());

        Self(inner)
    }

    /// The fiber's current state.
    pub fn state(&self) -> State {
        self.0.state.get()
    }

    /// The fiber currently running on this thread, or `None` if the calling
    /// context is a plain OS thread that has never entered a fiber.
    pub fn current() -> Option<Fiber> {
        CURRENT.with(|c| {
            let inner = c.borrow();
            if inner.stack.is_none() {
                None
            } else {
                Some(Fiber(Arc::clone(&inner)))
            }
        })
    }

    /// Resumes this fiber, switching into it from whatever is currently
    /// running on this thread, and returns once the fiber either suspends
    /// back to us via [`yield_current`] or terminates.
    ///
    /// # Panics
    ///
    /// Panics if this fiber is not `Init` or `Hold`.
    pub fn call(&self) -> Result<(), FiberError> {
        assert!(
            matches!(self.0.state.get(), State::Init | State::Hold),
            "cannot call a fiber in state {}",
            self.0.state.get()
        );

        let caller = CURRENT.with(|c| Arc::clone(&c.borrow()));
        *self.0.outer.borrow_mut() = Some(Arc::clone(&caller));
        self.0.state.set(State::Exec);
        CURRENT.with(|c| *c.borrow_mut() = Arc::clone(&self.0));

        // Safety: `caller` is the context currently executing (it owns this
        // native stack); `self.0` was constructed by `init_stack` or has
        // suspended cleanly before.
        unsafe { switch_into(&caller, &self.0, None) };

        CURRENT.with(|c| *c.borrow_mut() = caller);

        if let Some(err) = self.0.termination_error.borrow_mut().take() {
            return Err(err);
        }
        Ok(())
    }

    /// Switches directly to this fiber from whatever is currently running,
    /// arranging for the current fiber to become `state_on_return` once
    /// *it* is next resumed.
    ///
    /// # Panics
    ///
    /// Panics if this fiber is not `Init` or `Hold`, if called outside a
    /// fiber, or if `state_on_return` is not one of `Hold`, `Term`, or
    /// `Except`.
    pub fn yield_to(&self, state_on_return: State) -> Result<(), FiberError> {
        assert!(
            matches!(state_on_return, State::Hold | State::Term | State::Except),
            "state_on_return must be Hold, Term, or Except"
        );
        assert!(
            matches!(self.0.state.get(), State::Init | State::Hold),
            "cannot yield_to a fiber in state {}",
            self.0.state.get()
        );

        let cur = CURRENT.with(|c| Arc::clone(&c.borrow()));
        assert!(cur.stack.is_some(), "yield_to called outside a fiber");

        self.0.state.set(State::Exec);
        CURRENT.with(|c| *c.borrow_mut() = Arc::clone(&self.0));

        // Safety: see `call`.
        unsafe { switch_into(&cur, &self.0, Some(state_on_return)) };

        CURRENT.with(|c| *c.borrow_mut() = Arc::clone(&cur));

        if let Some(err) = cur.injected_error.borrow_mut().take() {
            return Err(err);
        }
        Ok(())
    }

    /// Schedules `err` to be returned from the current fiber's own next
    /// suspension point, the next time it resumes. Used by a reactor or
    /// scheduler to unwind a fiber blocked on an operation that was
    /// cancelled out from under it.
    ///
    /// # Panics
    ///
    /// Panics if this fiber is not `Hold`.
    pub fn inject(&self, err: FiberError) {
        assert_eq!(
            self.0.state.get(),
            State::Hold,
            "can only inject into a suspended fiber"
        );
        *self.0.injected_error.borrow_mut() = Some(err);
    }

    /// Re-initializes a terminated fiber with a new entry function, reusing
    /// its stack allocation.
    ///
    /// # Panics
    ///
    /// Panics if this fiber is not `Term` or `Except`.
    pub fn reset(&self, entry: impl FnOnce() + 'static) {
        assert!(
            matches!(self.0.state.get(), State::Term | State::Except),
            "cannot reset a fiber in state {}",
            self.0.state.get()
        );
        let top = self
            .0
            .stack
            .as_ref()
            .expect("root pseudo-fiber cannot be reset")
            .top();
        // Safety: the fiber is terminal, nothing references its old stack
        // contents anymore.
        let sp = unsafe { arch::init_stack(top, trampoline) };
        self.0.sp.set(sp.get());
        *self.0.outer.borrow_mut() = None;
        *self.0.yielder.borrow_mut() = None;
        self.0.termination_error.borrow_mut().take();
        self.0.injected_error.borrow_mut().take();
        *self.0.entry.borrow_mut() = Some(Box::new(entry));
        self.0.state.set(State::Init);
    }

    /// Reads this fiber's slot for `key`, or `0` if never set.
    pub fn fls_get(&self, key: FlsKey) -> usize {
        self.0.fls.borrow().get(key.0).copied().unwrap_or(0)
    }

    /// Writes this fiber's slot for `key`.
    pub fn fls_set(&self, key: FlsKey, value: usize) {
        let mut fls = self.0.fls.borrow_mut();
        if fls.len() <= key.0 {
            fls.resize(key.0 + 1, 0);
        }
        fls[key.0] = value;
    }
}

/// Suspends the current fiber, switching back to whichever fiber `call()`ed
/// it. Every fiber that reaches here must have been entered via
/// [`Fiber::call`] at some point in its ancestry.
///
/// # Panics
///
/// Panics if called outside a fiber, or if the current fiber has no outer
/// (it was only ever entered via [`Fiber::yield_to`]).
pub fn yield_current() -> Result<(), FiberError> {
    let cur = CURRENT.with(|c| Arc::clone(&c.borrow()));
    assert!(cur.stack.is_some(), "yield_current called outside a fiber");
    let outer = cur
        .outer
        .borrow()
        .clone()
        .expect("yield_current requires the fiber to have been call()ed");

    CURRENT.with(|c| *c.borrow_mut() = Arc::clone(&outer));

    // Safety: see `Fiber::call`.
    unsafe { switch_into(&cur, &outer, Some(State::Hold)) };

    CURRENT.with(|c| *c.borrow_mut() = Arc::clone(&cur));

    if let Some(err) = cur.injected_error.borrow_mut().take() {
        return Err(err);
    }
    Ok(())
}

/// Opaque key for a fiber-local storage slot, see [`fls_alloc`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlsKey(usize);

static FLS_SLOTS: Mutex<Vec<bool>> = Mutex::new(Vec::new());

/// Allocates a process-wide fiber-local storage slot. Every [`Fiber`] gets
/// its own independent value for this slot, initially `0`.
pub fn fls_alloc() -> FlsKey {
    let mut slots = FLS_SLOTS.lock().unwrap();
    if let Some(idx) = slots.iter().position(|used| !used) {
        slots[idx] = true;
        FlsKey(idx)
    } else {
        slots.push(true);
        FlsKey(slots.len() - 1)
    }
}

/// Releases a slot allocated by [`fls_alloc`] for reuse.
pub fn fls_free(key: FlsKey) {
    let mut slots = FLS_SLOTS.lock().unwrap();
    if let Some(used) = slots.get_mut(key.0) {
        *used = false;
    }
}

/// Switches the currently executing context (`me`) into `target`.
///
/// If `mailbox` is `Some(state)`, records on `target` that `me` wants to
/// become `state` once `me` is itself next resumed; `target` (or whoever
/// eventually regains control on `target`'s stack) is responsible for
/// applying it. `call()` passes `None` since it sets the target's state
/// directly instead.
///
/// Passes `Arc::as_ptr(target)` as `fiber_switch`'s `arg`. A fiber resuming
/// mid-function ignores it; a fiber starting fresh from `init_stack` lands
/// in `trampoline`, which needs exactly this pointer to find its own
/// `FiberInner`.
///
/// # Safety
///
/// `target` must be a fiber that has never run (fresh from `init_stack`) or
/// is cleanly suspended (`Hold`), and must not be concurrently switched into
/// from anywhere else.
unsafe fn switch_into(me: &Arc<FiberInner>, target: &Arc<FiberInner>, mailbox: Option<State>) {
    if let Some(state) = mailbox {
        *target.yielder.borrow_mut() = Some(Arc::clone(me));
        target.yielder_next_state.set(state);
    }

    let new_sp = target.sp.get();
    let arg = Arc::as_ptr(target) as usize;
    let mut old_sp: usize = 0;
    // Safety: forwarded from the caller.
    unsafe {
        arch::fiber_switch(&mut old_sp, new_sp, arg);
    }
    me.sp.set(old_sp);
    apply_mailbox(me);
}

/// Applies any pending state handoff `me` is carrying for whoever last
/// switched into it with a "yield"-style switch.
fn apply_mailbox(me: &FiberInner) {
    if let Some(who) = me.yielder.borrow_mut().take() {
        who.state.set(me.yielder_next_state.get());
    }
}

unsafe extern "C" fn trampoline(arg: usize) -> ! {
    // Safety: `arg` is `Arc::as_ptr(target)` from `switch_into`; the `Fiber`
    // handle that owns it is kept alive by whoever called `call`/`yield_to`
    // into us (it is sitting on its own suspended stack).
    unsafe {
        let inner_ptr = arg as *const FiberInner;
        let inner = &*inner_ptr;

        apply_mailbox(inner);

        let entry = inner.entry.borrow_mut().take();
        let result = entry.map(|f| std::panic::catch_unwind(AssertUnwindSafe(f)));

        match result {
            None | Some(Ok(())) => inner.state.set(State::Term),
            Some(Err(payload)) => {
                inner.state.set(State::Except);
                *inner.termination_error.borrow_mut() = Some(panic_payload_to_error(payload));
            }
        }

        let outer = inner
            .outer
            .borrow_mut()
            .take()
            .expect("fiber terminated with no outer to return control to");

        let mut discard: usize = 0;
        arch::fiber_switch(&mut discard, outer.sp.get(), 0);
        unreachable!("a terminated fiber was resumed");
    }
}

fn panic_payload_to_error(payload: Box<dyn Any + Send>) -> FiberError {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "fiber panicked with a non-string payload".to_string()
    };
    msg.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn call_and_return() {
        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let fiber = Fiber::new(move || {
            ran2.set(true);
        });
        fiber.call().unwrap();
        assert!(ran.get());
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn call_yield_call_round_trip() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        let fiber = Fiber::new(move || {
            log2.borrow_mut().push(1);
            yield_current().unwrap();
            log2.borrow_mut().push(2);
        });

        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Hold);
        assert_eq!(*log.borrow(), vec![1]);

        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Term);
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn panicking_fiber_propagates_error() {
        let fiber = Fiber::new(|| panic!("boom"));
        let err = fiber.call().unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(fiber.state(), State::Except);
    }

    #[test]
    fn ping_pong_via_yield_to() {
        // Mirrors the fiber ping-pong scenario: two fibers yield_to each
        // other four times and both end up Term.
        let log = Rc::new(RefCell::new(Vec::new()));

        let b_cell: Rc<RefCell<Option<Fiber>>> = Rc::new(RefCell::new(None));
        let b_cell_a = b_cell.clone();
        let a_log = log.clone();
        let fiber_a = Fiber::new(move || {
            let b = b_cell_a.borrow().clone().unwrap();
            for _ in 0..4 {
                a_log.borrow_mut().push('A');
                b.yield_to(State::Hold).unwrap();
            }
        });

        let b_log = log.clone();
        let fiber_b = Fiber::new(move || {
            for _ in 0..4 {
                b_log.borrow_mut().push('B');
                yield_current().unwrap();
            }
        });
        *b_cell.borrow_mut() = Some(fiber_b.clone());

        fiber_a.call().unwrap();
        assert_eq!(*log.borrow(), vec!['A', 'B', 'A', 'B', 'A', 'B', 'A', 'B']);
        assert_eq!(fiber_a.state(), State::Term);
        assert_eq!(fiber_b.state(), State::Term);
    }

    #[test]
    fn reset_reuses_stack() {
        let fiber = Fiber::new(|| {});
        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Term);

        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        fiber.reset(move || ran2.set(true));
        assert_eq!(fiber.state(), State::Init);
        fiber.call().unwrap();
        assert!(ran.get());
    }

    #[test]
    fn fiber_local_storage_is_per_fiber() {
        let key = fls_alloc();
        let fiber1 = Fiber::new(move || {
            Fiber::current().unwrap().fls_set(key, 1);
        });
        let fiber2 = Fiber::new(move || {
            Fiber::current().unwrap().fls_set(key, 2);
        });
        fiber1.call().unwrap();
        fiber2.call().unwrap();
        assert_eq!(fiber1.fls_get(key), 1);
        assert_eq!(fiber2.fls_get(key), 2);
        fls_free(key);
    }

    #[test]
    fn inject_unwinds_suspended_fiber() {
        let result: Rc<RefCell<Option<Result<(), String>>>> = Rc::new(RefCell::new(None));
        let result2 = result.clone();
        let fiber = Fiber::new(move || {
            let r = yield_current().map_err(|e| e.to_string());
            *result2.borrow_mut() = Some(r);
        });
        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Hold);
        fiber.inject("cancelled".into());
        fiber.call().unwrap();
        assert_eq!(
            result.borrow().as_ref().unwrap().as_ref().unwrap_err(),
            "cancelled"
        );
    }

    #[test]
    fn dropping_a_suspended_fiber_runs_its_drop_guards() {
        struct Guard(Rc<Cell<bool>>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let ran = Rc::new(Cell::new(false));
        let ran2 = ran.clone();
        let fiber = Fiber::new(move || {
            let _guard = Guard(ran2);
            let _ = yield_current();
        });
        fiber.call().unwrap();
        assert_eq!(fiber.state(), State::Hold);
        assert!(!ran.get());

        drop(fiber);
        assert!(ran.get());
    }
}
