//! The suspension protocol between a task and what its coroutine awaits.
//!
//! Rust coroutines are polled rather than resumed with values, so the
//! "suspend with an awaitable, resume with its outcome" contract runs
//! through two thread-local cells. When an awaitable adapter is polled and
//! its target is not terminal, it deposits the erased target here and
//! returns `Pending`; the driving task picks it up, registers its wakeup and
//! records the target as its waiter. Before resuming, the task may deposit
//! an error to inject; that is how cancellation reaches the coroutine at
//! its suspension point, where it can be caught or let propagate.
//!
//! A coroutine whose poll returns `Pending` without depositing anything has
//! awaited a foreign future that the loop knows nothing about; its task
//! diagnoses a bad yield.

use std::cell::Cell;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use crate::error::Error;
use crate::future::{Future, RawFuture};

pub(crate) enum Suspension {
    /// The coroutine awaits this future.
    Wait(Rc<dyn RawFuture>),
    /// The coroutine relinquishes one loop turn.
    Tick,
}

thread_local! {
    static SUSPENSION: Cell<Option<Suspension>> = const { Cell::new(None) };
    static INJECTED: Cell<Option<Error>> = const { Cell::new(None) };
}

pub(crate) fn deposit(suspension: Suspension) {
    SUSPENSION.set(Some(suspension));
}

pub(crate) fn take_suspension() -> Option<Suspension> {
    SUSPENSION.take()
}

pub(crate) fn inject(error: Option<Error>) {
    INJECTED.set(error);
}

pub(crate) fn take_injected() -> Option<Error> {
    INJECTED.take()
}

/// Adapter that suspends the running task on a [`Future`]. Produced by
/// awaiting a future or task.
#[derive(Debug)]
pub struct Awaited<T> {
    fut: Future<T>,
}

impl<T> Awaited<T> {
    pub(crate) fn new(fut: Future<T>) -> Self {
        Self { fut }
    }
}

impl<T: Clone + 'static> std::future::Future for Awaited<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // An injected cancellation wins over the target's actual outcome.
        if let Some(error) = take_injected() {
            return Poll::Ready(Err(error));
        }
        if self.fut.done() {
            return Poll::Ready(self.fut.result());
        }
        deposit(Suspension::Wait(Rc::new(self.fut.clone())));
        Poll::Pending
    }
}

/// Voluntarily relinquishes one loop turn.
///
/// The step resumes on the very next `call_soon` batch; any deferred
/// cancellation is delivered at this point like at any other suspension.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
pub struct YieldNow {
    yielded: bool,
}

impl std::future::Future for YieldNow {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(error) = take_injected() {
            return Poll::Ready(Err(error));
        }
        if self.yielded {
            Poll::Ready(Ok(()))
        } else {
            self.yielded = true;
            deposit(Suspension::Tick);
            Poll::Pending
        }
    }
}
