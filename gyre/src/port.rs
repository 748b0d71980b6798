//! The interface the core requires of a host event loop.
//!
//! The core never runs user callbacks inline: every completion callback,
//! task wakeup and timer goes through [`EventLoop::call_soon`] or
//! [`EventLoop::call_later`] of the loop a future is tied to. `gyre-loop`
//! ships a reference implementation; anything that can provide these three
//! operations can host the runtime.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

/// A scheduled callback.
pub type Callback = Box<dyn FnOnce()>;

/// The operations the core consumes from a host loop.
pub trait EventLoop {
    /// Enqueues `cb` to run on an upcoming loop turn, FIFO with respect to
    /// other `call_soon` callbacks.
    fn call_soon(&self, cb: Callback) -> Handle;

    /// Schedules `cb` to run once `delay` has elapsed.
    fn call_later(&self, delay: Duration, cb: Callback) -> Handle;

    /// The loop's monotonic clock.
    fn current_time(&self) -> Instant;
}

/// Cancel token for a scheduled callback.
///
/// Cancellation is idempotent; the loop skips a cancelled entry when it
/// reaches it instead of running it.
#[derive(Clone, Debug, Default)]
pub struct Handle {
    cancelled: Rc<Cell<bool>>,
}

impl Handle {
    /// Creates a live handle. Loop implementations create one per scheduled
    /// callback and keep a clone next to the entry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the scheduled callback as not-to-be-run.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// True once [`cancel`](Handle::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Identity of one event loop. Futures and tasks tied to different ids never
/// compose; mixing them is a programming error and panics.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct LoopId(usize);

/// A cheap, cloneable reference to an [`EventLoop`].
///
/// The loop is held weakly so that long-lived futures do not keep a dropped
/// loop alive; scheduling through a handle whose loop is gone panics.
#[derive(Clone, Debug)]
pub struct LoopHandle {
    ev: Weak<dyn EventLoop>,
    id: LoopId,
}

impl LoopHandle {
    /// Wraps a loop. The id derives from the allocation, so every handle to
    /// the same loop reports the same [`LoopId`].
    pub fn new(ev: Rc<dyn EventLoop>) -> Self {
        let id = LoopId(Rc::as_ptr(&ev) as *const () as usize);
        Self {
            ev: Rc::downgrade(&ev),
            id,
        }
    }

    /// The identity of the underlying loop.
    pub fn id(&self) -> LoopId {
        self.id
    }

    fn upgrade(&self) -> Rc<dyn EventLoop> {
        self.ev
            .upgrade()
            .expect("event loop dropped while futures tied to it were still in use")
    }

    /// See [`EventLoop::call_soon`].
    pub fn call_soon(&self, cb: Callback) -> Handle {
        self.upgrade().call_soon(cb)
    }

    /// See [`EventLoop::call_later`].
    pub fn call_later(&self, delay: Duration, cb: Callback) -> Handle {
        self.upgrade().call_later(delay, cb)
    }

    /// See [`EventLoop::current_time`].
    pub fn current_time(&self) -> Instant {
        self.upgrade().current_time()
    }

    /// The loop currently running on this thread.
    ///
    /// This is what `loop`-less constructors (`spawn`, `sleep`, `gather`,
    /// ...) resolve to. Panics when no loop context is entered; see
    /// [`in_loop_context`].
    pub fn current() -> LoopHandle {
        CURRENT_LOOP.with_borrow(|slot| {
            slot.clone()
                .expect("no event loop is running on this thread")
        })
    }

    /// Like [`current`](LoopHandle::current), but `None` instead of
    /// panicking.
    pub fn try_current() -> Option<LoopHandle> {
        CURRENT_LOOP.with_borrow(Clone::clone)
    }
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<LoopHandle>> = RefCell::default();
}

/// Runs `f` with `handle` installed as the thread's current loop.
///
/// Loop implementations wrap their run methods in this. Panics if a loop
/// context is already entered; loop runs do not nest.
pub fn in_loop_context<R>(handle: &LoopHandle, f: impl FnOnce() -> R) -> R {
    let _guard = ContextGuard::new(handle.clone());
    f()
}

struct ContextGuard(());

impl ContextGuard {
    fn new(handle: LoopHandle) -> Self {
        CURRENT_LOOP.with_borrow_mut(|slot| {
            assert!(
                slot.is_none(),
                "in_loop_context called within an existing loop context"
            );
            *slot = Some(handle);
        });
        Self(())
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT_LOOP.with_borrow_mut(|slot| *slot = None);
    }
}
