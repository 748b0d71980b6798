//! A manual-drain loop with a virtual clock, for tick-precise unit tests.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::port::{Callback, EventLoop, Handle, LoopHandle, in_loop_context};

pub(crate) struct TestLoop {
    ready: RefCell<VecDeque<(Handle, Callback)>>,
    timers: RefCell<Vec<(Instant, Handle, Callback)>>,
    now: Cell<Instant>,
}

impl TestLoop {
    pub(crate) fn new() -> Rc<TestLoop> {
        Rc::new(TestLoop {
            ready: RefCell::default(),
            timers: RefCell::default(),
            now: Cell::new(Instant::now()),
        })
    }

    pub(crate) fn handle(self: &Rc<Self>) -> LoopHandle {
        LoopHandle::new(self.clone())
    }

    /// Runs ready callbacks until the queue is empty, including callbacks
    /// enqueued while draining.
    pub(crate) fn run_ready(&self) {
        loop {
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some((handle, cb)) => {
                    if !handle.is_cancelled() {
                        cb();
                    }
                }
                None => break,
            }
        }
    }

    /// Runs only the callbacks that were already enqueued when called.
    pub(crate) fn run_ready_once_batch(&self) {
        let mut remaining = self.ready.borrow().len();
        while remaining > 0 {
            remaining -= 1;
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some((handle, cb)) => {
                    if !handle.is_cancelled() {
                        cb();
                    }
                }
                None => break,
            }
        }
    }

    /// Advances the virtual clock, moves due timers into the ready queue in
    /// deadline order, and drains it.
    pub(crate) fn advance(&self, delta: Duration) {
        let now = self.now.get() + delta;
        self.now.set(now);
        let mut due = {
            let mut timers = self.timers.borrow_mut();
            let mut due = Vec::new();
            let mut index = 0;
            while index < timers.len() {
                if timers[index].0 <= now {
                    due.push(timers.remove(index));
                } else {
                    index += 1;
                }
            }
            due
        };
        due.sort_by_key(|(when, _, _)| *when);
        {
            let mut ready = self.ready.borrow_mut();
            for (_when, handle, cb) in due {
                ready.push_back((handle, cb));
            }
        }
        self.run_ready();
    }
}

impl EventLoop for TestLoop {
    fn call_soon(&self, cb: Callback) -> Handle {
        let handle = Handle::new();
        self.ready.borrow_mut().push_back((handle.clone(), cb));
        handle
    }

    fn call_later(&self, delay: Duration, cb: Callback) -> Handle {
        let handle = Handle::new();
        self.timers
            .borrow_mut()
            .push((self.now.get() + delay, handle.clone(), cb));
        handle
    }

    fn current_time(&self) -> Instant {
        self.now.get()
    }
}

/// Runs `f` with a fresh test loop entered as the thread's current loop.
pub(crate) fn with_loop<R>(f: impl FnOnce(&Rc<TestLoop>, &LoopHandle) -> R) -> R {
    let lp = TestLoop::new();
    let handle = lp.handle();
    in_loop_context(&handle, || f(&lp, &handle))
}
