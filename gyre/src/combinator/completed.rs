//! `as_completed`: consuming a group of awaitables in completion order.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crate::error::Error;
use crate::future::Future;
use crate::port::{Handle, LoopHandle};
use crate::task::IntoAwaitable;

// The mediator between child completions and the returned awaitables: a
// FIFO of completed children, plus one waiter per awaiter that arrived
// before anything was ready. A `None` in the queue is the timeout sentinel.
struct Mediator<T> {
    ready: VecDeque<Option<Future<T>>>,
    waiters: VecDeque<Future<()>>,
    outstanding: usize,
    timed_out: bool,
    timeout_handle: Option<Handle>,
}

/// Lifts the given awaitables onto the current loop and returns one
/// awaitable per (de-duplicated) child; awaiting the i-th yields the i-th
/// child to complete, in completion order.
///
/// The yielded futures are the lifted children, which for coroutine inputs
/// are freshly spawned task cells rather than anything in `fs`. If `timeout`
/// elapses first, every remaining element resolves to `Err(Error::Timeout)`.
pub fn as_completed<T, I, A>(
    fs: I,
    timeout: Option<Duration>,
) -> Vec<impl std::future::Future<Output = Result<Future<T>, Error>>>
where
    T: Clone + 'static,
    I: IntoIterator<Item = A>,
    A: IntoAwaitable<T>,
{
    let lp = LoopHandle::current();
    let mut todo: Vec<Future<T>> = Vec::new();
    for aw in fs {
        let f = aw.into_awaitable(&lp);
        if !todo.iter().any(|c| Future::ptr_eq(c, &f)) {
            todo.push(f);
        }
    }

    let mediator = Rc::new(RefCell::new(Mediator {
        ready: VecDeque::new(),
        waiters: VecDeque::new(),
        outstanding: todo.len(),
        timed_out: false,
        timeout_handle: None,
    }));

    for child in &todo {
        let mediator = mediator.clone();
        child.add_done_callback(move |child| {
            let mut m = mediator.borrow_mut();
            if m.timed_out {
                return;
            }
            m.outstanding -= 1;
            if m.outstanding == 0 {
                if let Some(handle) = &m.timeout_handle {
                    handle.cancel();
                }
            }
            m.ready.push_back(Some(child));
            if let Some(waiter) = m.waiters.pop_front() {
                let _ = waiter.set_result(());
            }
        });
    }

    if let Some(delay) = timeout {
        if !todo.is_empty() {
            let deadline_mediator = mediator.clone();
            let handle = lp.call_later(
                delay,
                Box::new(move || {
                    let mut m = deadline_mediator.borrow_mut();
                    m.timed_out = true;
                    for _ in 0..m.outstanding {
                        m.ready.push_back(None);
                    }
                    while let Some(waiter) = m.waiters.pop_front() {
                        if !waiter.done() {
                            let _ = waiter.set_result(());
                        }
                    }
                }),
            );
            mediator.borrow_mut().timeout_handle = Some(handle);
        }
    }

    (0..todo.len())
        .map(|_| {
            let mediator = mediator.clone();
            let lp = lp.clone();
            async move {
                loop {
                    let waiter = {
                        let mut m = mediator.borrow_mut();
                        match m.ready.pop_front() {
                            Some(Some(child)) => return Ok(child),
                            Some(None) => return Err(Error::Timeout),
                            None => {
                                let waiter: Future<()> = Future::new(&lp);
                                m.waiters.push_back(waiter.clone());
                                waiter
                            }
                        }
                    };
                    waiter.await?;
                }
            }
        })
        .collect()
}
