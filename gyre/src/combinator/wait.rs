//! `wait` and `wait_for`: awaiting groups of awaitables with deadlines.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::future::{CallbackId, Future};
use crate::port::LoopHandle;
use crate::task::IntoAwaitable;

/// Release condition for [`wait`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WaitMode {
    /// Release once every child is terminal.
    AllCompleted,
    /// Release as soon as any child is terminal.
    FirstCompleted,
    /// Release when a child finishes with a non-cancellation error, or once
    /// every child is terminal. A cancelled child does not trigger early
    /// release.
    FirstException,
}

/// Waits for the given awaitables to complete, lifting coroutines into
/// tasks, and returns the `(done, pending)` partition.
///
/// `wait` never reports a timeout as an error: children that are still
/// pending when the deadline elapses are simply returned in the second list,
/// uncancelled. Duplicate futures (same cell) collapse into one child.
///
/// Panics when `fs` is empty.
pub async fn wait<T, I, A>(
    fs: I,
    timeout: Option<Duration>,
    mode: WaitMode,
) -> Result<(Vec<Future<T>>, Vec<Future<T>>), Error>
where
    T: Clone + 'static,
    I: IntoIterator<Item = A>,
    A: IntoAwaitable<T>,
{
    let lp = LoopHandle::current();
    let mut children: Vec<Future<T>> = Vec::new();
    for aw in fs {
        let f = aw.into_awaitable(&lp);
        if !children.iter().any(|c| Future::ptr_eq(c, &f)) {
            children.push(f);
        }
    }
    assert!(!children.is_empty(), "wait() got an empty set of awaitables");

    let waiter: Future<()> = Future::new(&lp);
    let timeout_handle = timeout.map(|delay| {
        let waiter = waiter.clone();
        lp.call_later(
            delay,
            Box::new(move || {
                if !waiter.done() {
                    let _ = waiter.set_result(());
                }
            }),
        )
    });

    let counter = Rc::new(Cell::new(children.len()));
    let callback_ids: Vec<CallbackId> = children
        .iter()
        .map(|child| {
            let counter = counter.clone();
            let waiter = waiter.clone();
            let timeout_handle = timeout_handle.clone();
            child.add_done_callback(move |child| {
                counter.set(counter.get() - 1);
                let release = counter.get() == 0
                    || mode == WaitMode::FirstCompleted
                    || (mode == WaitMode::FirstException
                        && !child.cancelled()
                        && matches!(child.exception(), Ok(Some(_))));
                if release {
                    if let Some(handle) = &timeout_handle {
                        handle.cancel();
                    }
                    if !waiter.done() {
                        let _ = waiter.set_result(());
                    }
                }
            })
        })
        .collect();

    let released = waiter.await;
    if let Some(handle) = &timeout_handle {
        handle.cancel();
    }
    released?;

    let mut done = Vec::new();
    let mut pending = Vec::new();
    for (child, id) in children.into_iter().zip(callback_ids) {
        child.remove_done_callback(id);
        if child.done() {
            done.push(child);
        } else {
            pending.push(child);
        }
    }
    Ok((done, pending))
}

/// Awaits one awaitable with a deadline.
///
/// With `None` as the timeout this is plain awaiting. Otherwise the
/// awaitable is lifted (a coroutine becomes a task) and raced against a
/// timer: if the timer fires first the lifted child is cancelled and
/// `Error::Timeout` is returned. Cancelling the caller cancels the child as
/// well.
pub async fn wait_for<T, A>(aw: A, timeout: Option<Duration>) -> Result<T, Error>
where
    T: Clone + 'static,
    A: IntoAwaitable<T>,
{
    let lp = LoopHandle::current();
    let fut = aw.into_awaitable(&lp);
    let Some(timeout) = timeout else {
        return fut.await;
    };

    let waiter: Future<()> = Future::new(&lp);
    let timeout_handle = {
        let waiter = waiter.clone();
        lp.call_later(
            timeout,
            Box::new(move || {
                if !waiter.done() {
                    let _ = waiter.set_result(());
                }
            }),
        )
    };
    let release_id = {
        let waiter = waiter.clone();
        fut.add_done_callback(move |_| {
            if !waiter.done() {
                let _ = waiter.set_result(());
            }
        })
    };

    let released = waiter.await;
    timeout_handle.cancel();
    match released {
        Ok(()) => {
            if fut.done() {
                fut.result()
            } else {
                fut.remove_done_callback(release_id);
                fut.cancel();
                Err(Error::Timeout)
            }
        }
        Err(error) => {
            // The caller itself was cancelled; take the child down too.
            fut.remove_done_callback(release_id);
            fut.cancel();
            Err(error)
        }
    }
}
