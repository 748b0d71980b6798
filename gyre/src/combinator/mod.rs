//! Combinators composing futures and tasks while preserving the core's
//! cancellation and ordering guarantees.

mod completed;
mod gather;
mod wait;

pub use completed::as_completed;
pub use gather::{gather, gather_results, shield};
pub use wait::{WaitMode, wait, wait_for};

use std::time::Duration;

use crate::future::Future;
use crate::port::LoopHandle;

/// A future that resolves to `()` once `delay` has elapsed on the current
/// loop.
pub fn sleep(delay: Duration) -> Future<()> {
    sleep_with(delay, ())
}

/// A future that resolves to `result` once `delay` has elapsed on the
/// current loop.
///
/// Completing the future early, in particular cancelling it, cancels the
/// underlying timer.
pub fn sleep_with<T: 'static>(delay: Duration, result: T) -> Future<T> {
    let lp = LoopHandle::current();
    let fut = Future::new(&lp);
    let timer = {
        let fut = fut.clone();
        lp.call_later(
            delay,
            Box::new(move || {
                if !fut.done() {
                    let _ = fut.set_result(result);
                }
            }),
        )
    };
    fut.add_done_callback(move |_| timer.cancel());
    fut
}
