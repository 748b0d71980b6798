//! A reference single-threaded event loop for the `gyre` runtime core.
//!
//! [`LocalLoop`] implements the [`EventLoop`] port with a FIFO ready queue
//! and a binary-heap timer queue, and drives tasks until a target
//! completes:
//!
//! ```rust
//! use std::time::Duration;
//! use gyre::{Error, sleep_with};
//! use gyre_loop::LocalLoop;
//!
//! let lp = LocalLoop::new();
//! let greeting = lp
//!     .run_until_complete(async {
//!         let word = sleep_with(Duration::from_millis(5), "hello").await?;
//!         Ok::<_, Error>(word)
//!     })
//!     .unwrap();
//! assert_eq!(greeting, "hello");
//! ```
//!
//! The loop is deliberately small: no I/O readiness, no signals, no
//! executors. It is just enough of a scheduler to host the core. When the ready
//! queue is empty it sleeps the thread until the next live timer is due.

#![warn(
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs
)]

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use gyre::{Callback, Error, EventLoop, Handle, IntoAwaitable, LoopHandle, ensure_task_on, in_loop_context};

struct Scheduled {
    handle: Handle,
    callback: Callback,
}

struct Timer {
    when: Instant,
    seq: u64,
    entry: Scheduled,
}

// Timers are sorted such that x > y if x should fire _before_ y (BinaryHeap
// is a max-heap); seq breaks ties so equal deadlines fire in scheduling
// order.

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.when, self.seq).cmp(&(other.when, other.seq)).reverse()
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for Timer {}

/// A single-threaded cooperative event loop.
///
/// Constructed behind `Rc` because futures hold their loop weakly; keep the
/// `Rc` alive for as long as anything is tied to the loop.
pub struct LocalLoop {
    ready: RefCell<VecDeque<Scheduled>>,
    timers: RefCell<BinaryHeap<Timer>>,
    next_seq: Cell<u64>,
}

impl LocalLoop {
    /// Creates an empty loop.
    pub fn new() -> Rc<LocalLoop> {
        Rc::new(LocalLoop {
            ready: RefCell::default(),
            timers: RefCell::default(),
            next_seq: Cell::new(0),
        })
    }

    /// A port handle for tying futures and tasks to this loop.
    pub fn handle(self: &Rc<Self>) -> LoopHandle {
        LoopHandle::new(self.clone())
    }

    /// Runs the loop until `aw` (lifted onto this loop, so a coroutine is
    /// spawned as a task) completes, and returns its outcome.
    ///
    /// Enters the thread's loop context for the duration, so `spawn`,
    /// `sleep`, `gather` and friends inside coroutines resolve to this loop.
    ///
    /// # Panics
    ///
    /// Panics if a loop context is already entered on this thread, or if the
    /// ready queue and timer heap both empty out while the target is still
    /// pending, since at that point nothing could ever complete it.
    pub fn run_until_complete<T, A>(self: &Rc<Self>, aw: A) -> Result<T, Error>
    where
        T: Clone + 'static,
        A: IntoAwaitable<T>,
    {
        let handle = self.handle();
        in_loop_context(&handle, || {
            let target = ensure_task_on(&handle, aw);
            loop {
                self.run_ready();
                if target.done() {
                    break;
                }
                self.advance_timers();
            }
            target.result()
        })
    }

    /// Moves due timers over and runs every callback that is ready right
    /// now, without sleeping. Useful for driving the loop manually in
    /// tests.
    pub fn run_once(&self) {
        self.collect_due_timers();
        self.run_ready();
    }

    fn run_ready(&self) {
        // Pop one entry at a time so a callback can schedule more work
        // without re-entering the queue borrow.
        loop {
            let next = self.ready.borrow_mut().pop_front();
            match next {
                Some(scheduled) => {
                    if !scheduled.handle.is_cancelled() {
                        (scheduled.callback)();
                    }
                }
                None => break,
            }
        }
    }

    fn collect_due_timers(&self) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            while let Some(timer) = timers.peek() {
                if timer.when > now {
                    break;
                }
                let timer = timers.pop().expect("peeked timer vanished");
                if !timer.entry.handle.is_cancelled() {
                    due.push(timer.entry);
                }
            }
        }
        self.ready.borrow_mut().extend(due);
    }

    /// Sleeps until the next live timer is due and moves it (and anything
    /// due with it) into the ready queue.
    fn advance_timers(&self) {
        let deadline = {
            let mut timers = self.timers.borrow_mut();
            // Cancelled timers at the head must not dictate the sleep.
            while let Some(timer) = timers.peek() {
                if timer.entry.handle.is_cancelled() {
                    timers.pop();
                } else {
                    break;
                }
            }
            timers.peek().map(|timer| timer.when)
        };
        let Some(deadline) = deadline else {
            panic!("event loop ran out of work before the target completed");
        };
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        }
        self.collect_due_timers();
    }
}

impl EventLoop for LocalLoop {
    fn call_soon(&self, callback: Callback) -> Handle {
        let handle = Handle::new();
        self.ready.borrow_mut().push_back(Scheduled {
            handle: handle.clone(),
            callback,
        });
        handle
    }

    fn call_later(&self, delay: Duration, callback: Callback) -> Handle {
        let handle = Handle::new();
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.timers.borrow_mut().push(Timer {
            when: Instant::now() + delay,
            seq,
            entry: Scheduled {
                handle: handle.clone(),
                callback,
            },
        });
        handle
    }

    fn current_time(&self) -> Instant {
        Instant::now()
    }
}

impl fmt::Debug for LocalLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalLoop")
            .field("ready", &self.ready.borrow().len())
            .field("timers", &self.timers.borrow().len())
            .finish()
    }
}
