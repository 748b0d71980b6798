//! The single-assignment completion cell everything else is built on.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::error::Error;
use crate::port::{Callback, LoopHandle, LoopId};
use crate::suspend::Awaited;

/// Identity of a registered done-callback, returned by
/// [`Future::add_done_callback`]. Rust closures have no equality, so removal
/// goes by this token.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CallbackId(u64);

type DoneCallback<T> = Box<dyn FnOnce(Future<T>)>;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum State {
    Pending,
    Finished,
    Cancelled,
}

struct Inner<T> {
    lp: LoopHandle,
    state: State,
    value: Option<T>,
    error: Option<Error>,
    /// Cleared the first time the stored error is observed through
    /// `result()` or `exception()`; a never-observed error warns on drop.
    observed: bool,
    next_callback: u64,
    callbacks: SmallVec<[(CallbackId, DoneCallback<T>); 2]>,
    /// Installed by `Task` and `gather` so that `cancel()` requests
    /// cancellation of what produces this cell instead of transitioning the
    /// cell directly.
    cancel_hook: Option<Rc<dyn Fn() -> bool>>,
}

/// A single-assignment completion cell with callback fan-out.
///
/// A future is created `Pending` on one loop and moves exactly once, to
/// `Finished` (carrying a value or an [`Error`]) or to `Cancelled`. Terminal
/// states are absorbing. Completion callbacks fire once each, in
/// registration order, and always through the loop's `call_soon` queue,
/// never inline from the setter, so user code only ever observes its own
/// stack.
///
/// Handles are cheap clones of the same cell; the cell lives as long as its
/// longest holder. Awaiting a handle inside a coroutine suspends the running
/// task until the cell is terminal:
///
/// ```no_run
/// # use gyre::{Error, Future, LoopHandle};
/// # async fn demo() -> Result<(), Error> {
/// let cell: Future<u32> = Future::new(&LoopHandle::current());
/// // ... hand a clone to a producer ...
/// let value = cell.clone().await?;
/// # let _ = value; Ok(())
/// # }
/// ```
///
/// Futures are not thread-safe; every operation must happen on the owning
/// loop's thread.
pub struct Future<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> Future<T> {
    /// Creates a pending future tied to `lp`.
    pub fn new(lp: &LoopHandle) -> Self {
        Self::construct(lp, None)
    }

    pub(crate) fn with_cancel_hook(lp: &LoopHandle, hook: Rc<dyn Fn() -> bool>) -> Self {
        Self::construct(lp, Some(hook))
    }

    fn construct(lp: &LoopHandle, cancel_hook: Option<Rc<dyn Fn() -> bool>>) -> Self {
        Future {
            inner: Rc::new(RefCell::new(Inner {
                lp: lp.clone(),
                state: State::Pending,
                value: None,
                error: None,
                observed: true,
                next_callback: 0,
                callbacks: SmallVec::new(),
                cancel_hook,
            })),
        }
    }

    /// True once the future is terminal (finished or cancelled).
    pub fn done(&self) -> bool {
        self.inner.borrow().state != State::Pending
    }

    /// True iff the future was cancelled.
    pub fn cancelled(&self) -> bool {
        self.inner.borrow().state == State::Cancelled
    }

    /// The loop this future is tied to.
    pub fn loop_handle(&self) -> LoopHandle {
        self.inner.borrow().lp.clone()
    }

    pub(crate) fn loop_id(&self) -> LoopId {
        self.inner.borrow().lp.id()
    }

    /// True when both handles refer to the same cell. This is the identity
    /// the combinators de-duplicate on.
    pub fn ptr_eq(a: &Future<T>, b: &Future<T>) -> bool {
        Rc::ptr_eq(&a.inner, &b.inner)
    }

    /// Requests cancellation.
    ///
    /// On a terminal future this is a no-op returning `false`. On a plain
    /// pending future the cell transitions to `Cancelled` and its callbacks
    /// are scheduled, returning `true`. On a cell produced by a task or
    /// `gather`, the request is forwarded to the producer instead (which may
    /// decline or defer it) and the return value reports whether the request
    /// was delivered.
    pub fn cancel(&self) -> bool {
        let hook = {
            let inner = self.inner.borrow();
            if inner.state != State::Pending {
                return false;
            }
            inner.cancel_hook.clone()
        };
        match hook {
            Some(hook) => hook(),
            None => {
                self.transition(State::Cancelled);
                true
            }
        }
    }

    /// Transitions to `Cancelled` without consulting the cancel hook. This is
    /// how a task marks itself cancelled once its coroutine terminates with
    /// `Error::Cancelled`.
    pub(crate) fn cancel_raw(&self) -> bool {
        if self.done() {
            return false;
        }
        self.transition(State::Cancelled);
        true
    }

    /// Completes the future with `value` and schedules its callbacks.
    ///
    /// Fails with [`Error::InvalidState`] if the future is already terminal.
    pub fn set_result(&self, value: T) -> Result<(), Error> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Pending {
                return Err(Error::InvalidState("future is already completed"));
            }
            inner.value = Some(value);
        }
        self.transition(State::Finished);
        Ok(())
    }

    /// Completes the future with `error` and schedules its callbacks.
    ///
    /// Fails with [`Error::InvalidState`] if the future is already terminal.
    /// The stored error counts as unobserved until `result()` or
    /// `exception()` reads it.
    pub fn set_exception(&self, error: Error) -> Result<(), Error> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Pending {
                return Err(Error::InvalidState("future is already completed"));
            }
            inner.error = Some(error);
            inner.observed = false;
        }
        self.transition(State::Finished);
        Ok(())
    }

    /// The stored value.
    ///
    /// Pending → `Err(InvalidState)`; cancelled → `Err(Cancelled)`; finished
    /// with an error → that error. Reading marks a stored error observed.
    pub fn result(&self) -> Result<T, Error>
    where
        T: Clone,
    {
        let mut inner = self.inner.borrow_mut();
        match inner.state {
            State::Pending => Err(Error::InvalidState("result is not ready")),
            State::Cancelled => Err(Error::Cancelled),
            State::Finished => {
                inner.observed = true;
                match &inner.error {
                    Some(error) => Err(error.clone()),
                    None => Ok(inner
                        .value
                        .clone()
                        .expect("finished future holds neither value nor error")),
                }
            }
        }
    }

    /// The stored error, `None` after a successful completion.
    ///
    /// Pending → `Err(InvalidState)`; cancelled → `Err(Cancelled)`. Reading
    /// marks a stored error observed.
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        let mut inner = self.inner.borrow_mut();
        match inner.state {
            State::Pending => Err(Error::InvalidState("exception is not set")),
            State::Cancelled => Err(Error::Cancelled),
            State::Finished => {
                inner.observed = true;
                Ok(inner.error.clone())
            }
        }
    }

    /// Registers `cb` to run once the future is terminal. If it already is,
    /// `cb` is scheduled on the loop right away; it is never invoked from
    /// inside this call.
    pub fn add_done_callback(&self, cb: impl FnOnce(Future<T>) + 'static) -> CallbackId {
        let mut inner = self.inner.borrow_mut();
        let id = CallbackId(inner.next_callback);
        inner.next_callback += 1;
        if inner.state == State::Pending {
            inner.callbacks.push((id, Box::new(cb)));
        } else {
            let lp = inner.lp.clone();
            drop(inner);
            let fut = self.clone();
            lp.call_soon(Box::new(move || cb(fut)));
        }
        id
    }

    /// Removes the callback registered under `id`; returns how many entries
    /// were dropped (0 or 1). Callbacks already handed to the loop are not
    /// recalled.
    pub fn remove_done_callback(&self, id: CallbackId) -> usize {
        let mut inner = self.inner.borrow_mut();
        let before = inner.callbacks.len();
        inner.callbacks.retain(|(cid, _)| *cid != id);
        before - inner.callbacks.len()
    }

    fn transition(&self, state: State) {
        let (lp, callbacks) = {
            let mut inner = self.inner.borrow_mut();
            debug_assert_eq!(inner.state, State::Pending);
            inner.state = state;
            (inner.lp.clone(), std::mem::take(&mut inner.callbacks))
        };
        for (_id, cb) in callbacks {
            let fut = self.clone();
            lp.call_soon(Box::new(move || cb(fut)));
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if self.state == State::Finished && !self.observed {
            if let Some(error) = &self.error {
                log::warn!("future dropped with a never-observed error: {error}");
            }
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inner.try_borrow() {
            Ok(inner) => f
                .debug_struct("Future")
                .field("state", &inner.state)
                .field("loop", &inner.lp.id())
                .field("callbacks", &inner.callbacks.len())
                .finish(),
            Err(_) => f.write_str("Future { <borrowed> }"),
        }
    }
}

impl<T: Clone + 'static> IntoFuture for Future<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Awaited<T>;

    fn into_future(self) -> Awaited<T> {
        Awaited::new(self)
    }
}

/// The type-erased view a task keeps of whatever its coroutine awaits.
/// `cancel` goes through the cell's hook, so cancelling an erased task cell
/// requests task cancellation rather than flipping the cell.
pub(crate) trait RawFuture {
    fn done(&self) -> bool;
    fn cancel(&self) -> bool;
    fn loop_id(&self) -> LoopId;
    fn on_done(&self, cb: Callback);
}

impl<T: 'static> RawFuture for Future<T> {
    fn done(&self) -> bool {
        Future::done(self)
    }

    fn cancel(&self) -> bool {
        Future::cancel(self)
    }

    fn loop_id(&self) -> LoopId {
        Future::loop_id(self)
    }

    fn on_done(&self, cb: Callback) {
        self.add_done_callback(move |_| cb());
    }
}
