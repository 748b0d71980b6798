//! Tasks: coroutines driven to completion on an event loop.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use crate::error::Error;
use crate::future::{CallbackId, Future, RawFuture};
use crate::port::LoopHandle;
use crate::registry::{self, AnyTask, CurrentTaskGuard, TaskId, TaskRef};
use crate::suspend::{self, Awaited, Suspension};

type Coro<T> = Pin<Box<dyn std::future::Future<Output = Result<T, Error>>>>;

// An invariant maintained while a task is not terminal: either `fut_waiter`
// is `None` and a step is enqueued on the loop, or `fut_waiter` is some
// future carrying a registered wakeup and no step is enqueued. The only
// transition from the latter to the former is through the wakeup.
struct TaskState<T> {
    coro: Option<Coro<T>>,
    fut_waiter: Option<Rc<dyn RawFuture>>,
    /// Set when `cancel()` arrives while a step is already enqueued; the
    /// step observes it and injects `Error::Cancelled`.
    must_cancel: bool,
    started: bool,
}

struct TaskShared<T: 'static> {
    fut: Future<T>,
    state: RefCell<TaskState<T>>,
    id: Cell<TaskId>,
}

/// A [`Future`] that drives a coroutine to completion on one event loop.
///
/// A coroutine is any `std::future::Future<Output = Result<T, Error>>`. The
/// task steps it to its next suspension point, registers a wakeup on the
/// awaitable it suspended on, and goes back to sleep; awaitables resolve
/// through the loop, other tasks or timers. The task's own cell completes
/// with the coroutine's return value, its error, or `Cancelled` if the
/// coroutine let a cancellation propagate out.
///
/// Cancellation is a request, not a verdict: [`cancel`](Task::cancel)
/// arranges for `Error::Cancelled` to surface at the coroutine's next
/// suspension point, where it may be caught and suppressed. A task counts as
/// cancelled only once its coroutine terminates with `Error::Cancelled`.
pub struct Task<T: 'static> {
    shared: Rc<TaskShared<T>>,
}

impl<T: 'static> Clone for Task<T> {
    fn clone(&self) -> Self {
        Task {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T: 'static> Task<T> {
    /// Spawns `coro` on `lp` and enqueues its first step.
    pub fn spawn_on(
        lp: &LoopHandle,
        coro: impl std::future::Future<Output = Result<T, Error>> + 'static,
    ) -> Task<T> {
        let shared = Rc::new_cyclic(|weak: &Weak<TaskShared<T>>| {
            let hook = {
                let weak = weak.clone();
                Rc::new(move || match weak.upgrade() {
                    Some(shared) => Self::request_cancel(&shared),
                    None => false,
                })
            };
            TaskShared {
                fut: Future::with_cancel_hook(lp, hook),
                state: RefCell::new(TaskState {
                    coro: Some(Box::pin(coro)),
                    fut_waiter: None,
                    must_cancel: false,
                    started: false,
                }),
                id: Cell::new(TaskId::default()),
            }
        });
        let weak: Weak<TaskShared<T>> = Rc::downgrade(&shared);
        let weak: Weak<dyn AnyTask> = weak;
        let id = registry::enroll(weak);
        shared.id.set(id);
        Self::schedule_step(shared.clone(), None);
        Task { shared }
    }

    /// The task's registry identity.
    pub fn id(&self) -> TaskId {
        self.shared.id.get()
    }

    /// True once the task is terminal.
    pub fn done(&self) -> bool {
        self.shared.fut.done()
    }

    /// True if the coroutine terminated with a cancellation.
    pub fn cancelled(&self) -> bool {
        self.shared.fut.cancelled()
    }

    /// The loop this task runs on.
    pub fn loop_handle(&self) -> LoopHandle {
        self.shared.fut.loop_handle()
    }

    /// The task's completion cell. Awaiting the task and awaiting this cell
    /// are the same thing, and cancelling the cell routes back through
    /// [`cancel`](Task::cancel).
    pub fn as_future(&self) -> Future<T> {
        self.shared.fut.clone()
    }

    /// Requests cooperative cancellation; returns whether the request was
    /// delivered.
    ///
    /// If the task is suspended on a cancellable awaitable, that awaitable
    /// is cancelled and the cancellation reaches the coroutine through its
    /// await. Otherwise the already-enqueued step delivers it. A `true`
    /// return does not mean the task ends up cancelled: the coroutine may
    /// catch the error and carry on, in which case `cancel()` can be called
    /// again later.
    pub fn cancel(&self) -> bool {
        self.shared.fut.cancel()
    }

    /// See [`Future::add_done_callback`].
    pub fn add_done_callback(&self, cb: impl FnOnce(Future<T>) + 'static) -> CallbackId {
        self.shared.fut.add_done_callback(cb)
    }

    /// See [`Future::remove_done_callback`].
    pub fn remove_done_callback(&self, id: CallbackId) -> usize {
        self.shared.fut.remove_done_callback(id)
    }

    // The task-flavoured cancel, reached through the cell's cancel hook (the
    // cell itself stays pending until the coroutine reacts).
    fn request_cancel(shared: &TaskShared<T>) -> bool {
        let waiter = shared.state.borrow().fut_waiter.clone();
        if let Some(waiter) = waiter {
            if waiter.cancel() {
                // Leave the waiter in place: it may be a task that catches
                // and ignores the cancellation, and a later cancel() must be
                // able to reach it again.
                return true;
            }
        }
        // A step must already be enqueued; it will observe the flag.
        shared.state.borrow_mut().must_cancel = true;
        true
    }

    fn schedule_step(shared: Rc<TaskShared<T>>, injected: Option<Error>) {
        let lp = shared.fut.loop_handle();
        lp.call_soon(Box::new(move || Self::step(shared, injected)));
    }

    fn step(shared: Rc<TaskShared<T>>, mut injected: Option<Error>) {
        assert!(!shared.fut.done(), "task stepped after completion");
        let (mut coro, started) = {
            let mut state = shared.state.borrow_mut();
            if state.must_cancel {
                if !matches!(injected, Some(Error::Cancelled)) {
                    injected = Some(Error::Cancelled);
                }
                state.must_cancel = false;
            }
            state.fut_waiter = None;
            let started = state.started;
            state.started = true;
            (
                state.coro.take().expect("task stepped without a coroutine"),
                started,
            )
        };

        // A cancellation that lands before the coroutine ever ran terminates
        // the task without polling the body, mirroring an exception thrown
        // into a not-yet-started coroutine.
        if !started {
            if let Some(error) = injected.take() {
                Self::finish(&shared, Err(error));
                return;
            }
        }

        let current: TaskRef = shared.clone();
        let guard = CurrentTaskGuard::new(current);
        let _ = suspend::take_suspension();
        suspend::inject(injected);
        let mut cx = Context::from_waker(Waker::noop());
        let poll = catch_unwind(AssertUnwindSafe(|| coro.as_mut().poll(&mut cx)));
        suspend::inject(None);
        let suspension = suspend::take_suspension();
        drop(guard);

        match poll {
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let _ = shared.fut.set_exception(Error::Panicked(message.into()));
                registry::withdraw(shared.id.get());
                resume_unwind(payload);
            }
            Ok(Poll::Ready(outcome)) => Self::finish(&shared, outcome),
            Ok(Poll::Pending) => {
                shared.state.borrow_mut().coro = Some(coro);
                match suspension {
                    Some(Suspension::Wait(waiter)) => {
                        if waiter.loop_id() != shared.fut.loop_id() {
                            panic!("task awaited a future attached to a different event loop");
                        }
                        let wake_target = shared.clone();
                        waiter.on_done(Box::new(move || Self::wakeup(wake_target)));
                        let retry_cancel = {
                            let mut state = shared.state.borrow_mut();
                            state.fut_waiter = Some(waiter.clone());
                            state.must_cancel
                        };
                        // cancel() ran while the coroutine held the stack;
                        // try to push it through the fresh waiter.
                        if retry_cancel && waiter.cancel() {
                            shared.state.borrow_mut().must_cancel = false;
                        }
                    }
                    Some(Suspension::Tick) => Self::schedule_step(shared, None),
                    None => {
                        // Suspended outside the protocol; nothing will ever
                        // wake it, so diagnose on the next tick.
                        let lp = shared.fut.loop_handle();
                        let offender = shared.clone();
                        lp.call_soon(Box::new(move || {
                            if !offender.fut.done() {
                                let message = format!(
                                    "task {:?} suspended on a foreign awaitable; only runtime \
                                     futures and yield_now() may be awaited",
                                    offender.id.get()
                                );
                                offender.state.borrow_mut().coro = None;
                                Self::finish(&offender, Err(Error::BadYield(message)));
                            }
                        }));
                    }
                }
            }
        }
    }

    // The wakeup only turns a waiter's completion into a step; the awaiting
    // adapter reads the waiter's outcome itself when the coroutine resumes.
    // Runs as a loop callback, so stepping inline preserves FIFO order.
    fn wakeup(shared: Rc<TaskShared<T>>) {
        Self::step(shared, None);
    }

    fn finish(shared: &Rc<TaskShared<T>>, outcome: Result<T, Error>) {
        match outcome {
            Ok(value) => shared
                .fut
                .set_result(value)
                .expect("task completed more than once"),
            Err(Error::Cancelled) => {
                shared.fut.cancel_raw();
            }
            Err(error) => shared
                .fut
                .set_exception(error)
                .expect("task completed more than once"),
        }
        registry::withdraw(shared.id.get());
    }
}

impl<T: Clone + 'static> Task<T> {
    /// See [`Future::result`].
    pub fn result(&self) -> Result<T, Error> {
        self.shared.fut.result()
    }

    /// See [`Future::exception`].
    pub fn exception(&self) -> Result<Option<Error>, Error> {
        self.shared.fut.exception()
    }
}

impl<T: 'static> Drop for TaskShared<T> {
    fn drop(&mut self) {
        if !self.fut.done() {
            log::warn!("task {:?} dropped while still pending", self.id.get());
        }
        registry::withdraw(self.id.get());
    }
}

impl<T: 'static> AnyTask for TaskShared<T> {
    fn id(&self) -> TaskId {
        self.id.get()
    }

    fn loop_id(&self) -> crate::port::LoopId {
        self.fut.loop_id()
    }

    fn done(&self) -> bool {
        self.fut.done()
    }

    fn cancelled(&self) -> bool {
        self.fut.cancelled()
    }

    fn cancel(&self) -> bool {
        self.fut.cancel()
    }
}

impl<T: 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.shared.id.get())
            .field("future", &self.shared.fut)
            .finish()
    }
}

impl<T: Clone + 'static> IntoFuture for Task<T> {
    type Output = Result<T, Error>;
    type IntoFuture = Awaited<T>;

    fn into_future(self) -> Awaited<T> {
        Awaited::new(self.shared.fut.clone())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_owned()
    }
}

/// Spawns `coro` as a task on the thread's current loop.
///
/// Panics outside a loop context; use [`spawn_on`] to pin a task to a
/// specific loop.
pub fn spawn<T: 'static>(
    coro: impl std::future::Future<Output = Result<T, Error>> + 'static,
) -> Task<T> {
    Task::spawn_on(&LoopHandle::current(), coro)
}

/// Spawns `coro` as a task on `lp`.
pub fn spawn_on<T: 'static>(
    lp: &LoopHandle,
    coro: impl std::future::Future<Output = Result<T, Error>> + 'static,
) -> Task<T> {
    Task::spawn_on(lp, coro)
}

/// Conversion into a runtime awaitable tied to a specific loop: futures and
/// tasks pass through, bare coroutines get wrapped in a task.
pub trait IntoAwaitable<T> {
    /// Lifts `self` onto `lp`, spawning a task when `self` is a bare
    /// coroutine. Panics if `self` is already tied to a different loop.
    fn into_awaitable(self, lp: &LoopHandle) -> Future<T>;
}

impl<T: 'static> IntoAwaitable<T> for Future<T> {
    fn into_awaitable(self, lp: &LoopHandle) -> Future<T> {
        assert!(
            self.loop_id() == lp.id(),
            "loop argument must agree with the future's loop"
        );
        self
    }
}

impl<T: 'static> IntoAwaitable<T> for Task<T> {
    fn into_awaitable(self, lp: &LoopHandle) -> Future<T> {
        self.as_future().into_awaitable(lp)
    }
}

impl<T, C> IntoAwaitable<T> for C
where
    T: 'static,
    C: std::future::Future<Output = Result<T, Error>> + 'static,
{
    fn into_awaitable(self, lp: &LoopHandle) -> Future<T> {
        Task::spawn_on(lp, self).as_future()
    }
}

/// Idempotent lifting on the thread's current loop: a future or task passes
/// through unchanged (same cell), a coroutine is wrapped in a new task.
pub fn ensure_task<T: 'static>(aw: impl IntoAwaitable<T>) -> Future<T> {
    ensure_task_on(&LoopHandle::current(), aw)
}

/// Idempotent lifting onto `lp`; see [`ensure_task`].
pub fn ensure_task_on<T: 'static>(lp: &LoopHandle, aw: impl IntoAwaitable<T>) -> Future<T> {
    aw.into_awaitable(lp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{all_tasks, current_task};
    use crate::suspend::yield_now;
    use crate::test_loop::with_loop;

    #[test]
    fn runs_a_plain_coroutine_to_completion() {
        with_loop(|lp, _h| {
            let task = spawn(async { Ok(21 * 2) });
            assert!(!task.done());
            lp.run_ready();
            assert_eq!(task.result().unwrap(), 42);
            assert!(!task.cancelled());
        });
    }

    #[test]
    fn resumes_with_the_waited_futures_value() {
        with_loop(|lp, h| {
            let gate: Future<u32> = Future::new(h);
            let task = {
                let gate = gate.clone();
                spawn(async move { Ok(gate.await? + 1) })
            };
            lp.run_ready();
            assert!(!task.done());
            gate.set_result(9).unwrap();
            lp.run_ready();
            assert_eq!(task.result().unwrap(), 10);
        });
    }

    #[test]
    fn propagates_a_waited_futures_error() {
        with_loop(|lp, h| {
            let gate: Future<u32> = Future::new(h);
            let task = {
                let gate = gate.clone();
                spawn(async move { Ok(gate.await? + 1) })
            };
            lp.run_ready();
            gate.set_exception(Error::msg("producer failed")).unwrap();
            lp.run_ready();
            assert!(matches!(task.exception(), Ok(Some(Error::Other(_)))));
        });
    }

    #[test]
    fn cancel_before_first_step_skips_the_body() {
        with_loop(|lp, _h| {
            let ran = Rc::new(Cell::new(false));
            let task = {
                let ran = ran.clone();
                spawn(async move {
                    ran.set(true);
                    Ok(())
                })
            };
            assert!(task.cancel());
            lp.run_ready();
            assert!(task.cancelled());
            assert!(!ran.get());
        });
    }

    #[test]
    fn cancel_while_suspended_cancels_the_waiter() {
        with_loop(|lp, h| {
            let gate: Future<u32> = Future::new(h);
            let task = {
                let gate = gate.clone();
                spawn(async move { gate.await })
            };
            lp.run_ready();
            assert!(task.cancel());
            lp.run_ready();
            assert!(task.cancelled());
            assert!(gate.cancelled());
        });
    }

    #[test]
    fn coroutine_may_suppress_cancellation() {
        with_loop(|lp, h| {
            let gate: Future<u32> = Future::new(h);
            let task = {
                let gate = gate.clone();
                spawn(async move {
                    match gate.await {
                        Err(Error::Cancelled) => Ok(0),
                        other => other,
                    }
                })
            };
            lp.run_ready();
            assert!(task.cancel());
            lp.run_ready();
            assert!(task.done());
            assert!(!task.cancelled());
            assert_eq!(task.result().unwrap(), 0);
        });
    }

    #[test]
    fn cancel_on_a_terminal_task_returns_false() {
        with_loop(|lp, _h| {
            let task = spawn(async { Ok(1) });
            lp.run_ready();
            assert!(task.done());
            assert!(!task.cancel());
        });
    }

    #[test]
    fn yield_now_relinquishes_exactly_one_turn() {
        with_loop(|lp, _h| {
            let task = spawn(async {
                yield_now().await?;
                Ok(5)
            });
            lp.run_ready_once_batch();
            assert!(!task.done());
            lp.run_ready();
            assert_eq!(task.result().unwrap(), 5);
        });
    }

    #[test]
    fn foreign_awaitables_are_diagnosed_as_bad_yields() {
        with_loop(|lp, _h| {
            let task = spawn(async {
                futures::future::pending::<()>().await;
                Ok(())
            });
            lp.run_ready();
            assert!(task.done());
            match task.exception().unwrap() {
                Some(Error::BadYield(message)) => assert!(message.contains("foreign")),
                other => panic!("expected a bad-yield error, got {other:?}"),
            }
        });
    }

    #[test]
    fn current_task_is_set_only_during_a_step() {
        with_loop(|lp, h| {
            assert!(current_task(h).is_none());
            let h2 = h.clone();
            let task = spawn(async move {
                let current = current_task(&h2).expect("stepping task not installed");
                Ok(current.id())
            });
            lp.run_ready();
            assert_eq!(task.result().unwrap(), task.id());
            assert!(current_task(h).is_none());
        });
    }

    #[test]
    fn registry_lists_live_tasks_and_forgets_finished_ones() {
        with_loop(|lp, h| {
            let gate: Future<u32> = Future::new(h);
            let task = {
                let gate = gate.clone();
                spawn(async move { gate.await })
            };
            lp.run_ready();
            let listed = all_tasks(h);
            assert_eq!(listed.len(), 1);
            assert_eq!(listed[0].id(), task.id());
            gate.set_result(1).unwrap();
            lp.run_ready();
            assert!(all_tasks(h).is_empty());
        });
    }

    #[test]
    fn ensure_task_passes_futures_through_by_identity() {
        with_loop(|_lp, h| {
            let fut: Future<u32> = Future::new(h);
            let lifted = ensure_task(fut.clone());
            assert!(Future::ptr_eq(&fut, &lifted));
        });
    }

    #[test]
    fn ensure_task_wraps_coroutines_in_tasks() {
        with_loop(|lp, h| {
            let lifted = ensure_task(async { Ok(3) });
            assert!(!all_tasks(h).is_empty());
            lp.run_ready();
            assert_eq!(lifted.result().unwrap(), 3);
        });
    }

    #[test]
    #[should_panic(expected = "loop argument must agree")]
    fn lifting_a_foreign_loop_future_panics() {
        use crate::test_loop::TestLoop;
        let other = TestLoop::new();
        let foreign: Future<u32> = Future::new(&other.handle());
        with_loop(|_lp, h| {
            let _ = ensure_task_on(h, foreign.clone());
        });
    }

    #[test]
    fn second_cancel_reaches_a_task_that_suppressed_the_first() {
        with_loop(|lp, h| {
            let first: Future<()> = Future::new(h);
            let second: Future<()> = Future::new(h);
            let task = {
                let first = first.clone();
                let second = second.clone();
                spawn(async move {
                    if let Err(error) = first.await {
                        assert!(error.is_cancelled());
                    }
                    second.await?;
                    Ok("survived")
                })
            };
            lp.run_ready();
            assert!(task.cancel());
            lp.run_ready();
            // Suppressed: the task moved on to the second gate.
            assert!(!task.done());
            assert!(task.cancel());
            lp.run_ready();
            assert!(task.cancelled());
            assert!(second.cancelled());
        });
    }
}
