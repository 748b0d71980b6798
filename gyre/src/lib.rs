//! Futures, tasks and combinators for single-threaded cooperative event
//! loops.
//!
//! `gyre` is the core of a cooperative task runtime: it turns coroutines
//! (any `std::future::Future<Output = Result<T, Error>>`) into schedulable,
//! cancellable [`Task`]s driven one suspension point at a time, synchronized
//! through callback-bearing completion cells ([`Future`]). The crate does
//! not contain an event loop; it consumes the small [`EventLoop`] port
//! (`call_soon`, `call_later`, `current_time`) from a host such as
//! `gyre-loop`.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use gyre::{Error, gather, sleep_with, spawn};
//!
//! # fn demo() -> Result<(), Error> {
//! // Inside a running loop context:
//! let task = spawn(async {
//!     let pair = gather(vec![
//!         sleep_with(Duration::from_millis(20), "a"),
//!         sleep_with(Duration::from_millis(10), "b"),
//!     ])
//!     .await?;
//!     Ok::<_, Error>(pair)
//! });
//! # let _ = task; Ok(())
//! # }
//! ```
//!
//! # Cancellation
//!
//! Cancellation is cooperative. [`Task::cancel`] arranges for
//! [`Error::Cancelled`] to surface at the coroutine's next suspension point;
//! the coroutine may let it propagate with `?` (the task then counts as
//! cancelled) or match on it and carry on. [`shield`] blocks cancellation
//! from propagating inward, [`gather`] keeps one child's cancellation from
//! cascading into its siblings.
//!
//! # Threading
//!
//! Everything here is single-threaded: futures and tasks are tied to one
//! loop and must only be touched from its thread. Loops on different
//! threads (or the same one) are fully isolated; composing futures of two
//! loops is a programming error and panics.

#![warn(
    elided_lifetimes_in_paths,
    missing_debug_implementations,
    missing_docs
)]

mod combinator;
mod error;
mod future;
mod port;
mod registry;
mod suspend;
mod task;

#[cfg(test)]
pub(crate) mod test_loop;

pub use combinator::{WaitMode, as_completed, gather, gather_results, shield, sleep, sleep_with, wait, wait_for};
pub use error::Error;
pub use future::{CallbackId, Future};
pub use port::{Callback, EventLoop, Handle, LoopHandle, LoopId, in_loop_context};
pub use registry::{AnyTask, TaskId, TaskRef, all_tasks, current_task};
pub use suspend::{Awaited, YieldNow, yield_now};
pub use task::{IntoAwaitable, Task, ensure_task, ensure_task_on, spawn, spawn_on};
