//! `gather` and `shield`: aggregation and cancellation barriers.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::Error;
use crate::future::Future;
use crate::port::LoopHandle;
use crate::task::IntoAwaitable;

/// Aggregates the given awaitables into one future whose result preserves
/// argument order, regardless of completion order.
///
/// The first child to finish with an error (a cancelled child counts as
/// `Error::Cancelled` here) resolves the aggregate with that error
/// immediately; remaining children keep running. The aggregate itself is
/// never put into the cancelled state by a child: one child's cancellation
/// must not cascade into its siblings. Cancelling the aggregate cancels all
/// unfinished children and the aggregate then resolves by their reported
/// outcomes.
///
/// Duplicate futures share one child but occupy their own result slots. No
/// arguments at all yield an immediately-resolved empty list.
pub fn gather<T, I, A>(fs: I) -> Future<Vec<T>>
where
    T: Clone + 'static,
    I: IntoIterator<Item = A>,
    A: IntoAwaitable<T>,
{
    gather_core(fs, false, |outcomes| {
        outcomes
            .into_iter()
            .map(|outcome| outcome.expect("fail-fast gather stored an error outcome"))
            .collect()
    })
}

/// Like [`gather`], but every child outcome (value, error or cancellation)
/// is recorded positionally and the aggregate always resolves successfully
/// once all children are terminal.
pub fn gather_results<T, I, A>(fs: I) -> Future<Vec<Result<T, Error>>>
where
    T: Clone + 'static,
    I: IntoIterator<Item = A>,
    A: IntoAwaitable<T>,
{
    gather_core(fs, true, |outcomes| outcomes)
}

fn gather_core<T, R, I, A, F>(fs: I, return_exceptions: bool, assemble: F) -> Future<R>
where
    T: Clone + 'static,
    R: 'static,
    I: IntoIterator<Item = A>,
    A: IntoAwaitable<T>,
    F: Fn(Vec<Result<T, Error>>) -> R + 'static,
{
    let lp = LoopHandle::current();
    let mut unique: Vec<Future<T>> = Vec::new();
    let mut children: Vec<Future<T>> = Vec::new();
    for aw in fs {
        let f = aw.into_awaitable(&lp);
        match unique.iter().find(|c| Future::ptr_eq(c, &f)) {
            Some(existing) => children.push(existing.clone()),
            None => {
                unique.push(f.clone());
                children.push(f);
            }
        }
    }

    let n = children.len();
    if n == 0 {
        let outer = Future::new(&lp);
        outer
            .set_result(assemble(Vec::new()))
            .expect("freshly created future already completed");
        return outer;
    }

    // Cancelling the aggregate forwards the request to the children; the
    // aggregate resolves through their completion callbacks rather than
    // flipping to cancelled itself.
    let hook_children = unique.clone();
    let outer: Future<R> = Future::with_cancel_hook(
        &lp,
        Rc::new(move || {
            let mut delivered = false;
            for child in &hook_children {
                if child.cancel() {
                    delivered = true;
                }
            }
            delivered
        }),
    );

    let results: Rc<RefCell<Vec<Option<Result<T, Error>>>>> =
        Rc::new(RefCell::new((0..n).map(|_| None).collect()));
    let finished = Rc::new(Cell::new(0usize));
    let assemble = Rc::new(assemble);
    for (slot, child) in children.iter().enumerate() {
        let outer = outer.clone();
        let results = results.clone();
        let finished = finished.clone();
        let assemble = assemble.clone();
        child.add_done_callback(move |child| {
            if outer.done() {
                // A late loser; observe its error so it does not warn.
                if !child.cancelled() {
                    let _ = child.exception();
                }
                return;
            }
            let outcome = if child.cancelled() {
                Err(Error::Cancelled)
            } else if let Ok(Some(error)) = child.exception() {
                Err(error)
            } else {
                child.result()
            };
            if !return_exceptions {
                if let Err(error) = &outcome {
                    let _ = outer.set_exception(error.clone());
                    return;
                }
            }
            results.borrow_mut()[slot] = Some(outcome);
            finished.set(finished.get() + 1);
            if finished.get() == n {
                let outcomes: Vec<Result<T, Error>> = results
                    .borrow_mut()
                    .iter_mut()
                    .map(|slot| slot.take().expect("child finished without an outcome"))
                    .collect();
                let _ = outer.set_result(assemble(outcomes));
            }
        });
    }
    outer
}

/// Mirrors an awaitable while blocking cancellation from propagating inward.
///
/// The returned outer future completes exactly like the (lifted) inner one,
/// but cancelling the outer leaves the inner running; the awaiter sees
/// `Error::Cancelled` while the inner computation proceeds undisturbed. The
/// inner being cancelled by other means still cancels the outer. An
/// already-terminal inner is returned as-is.
pub fn shield<T, A>(aw: A) -> Future<T>
where
    T: Clone + 'static,
    A: IntoAwaitable<T>,
{
    let lp = LoopHandle::current();
    let inner = aw.into_awaitable(&lp);
    if inner.done() {
        return inner;
    }
    let outer = Future::new(&lp);
    {
        let outer = outer.clone();
        inner.add_done_callback(move |inner| {
            if outer.cancelled() {
                // Still observe the inner's error so it does not warn.
                if !inner.cancelled() {
                    let _ = inner.exception();
                }
                return;
            }
            if inner.cancelled() {
                outer.cancel();
            } else if let Ok(Some(error)) = inner.exception() {
                let _ = outer.set_exception(error);
            } else {
                match inner.result() {
                    Ok(value) => {
                        let _ = outer.set_result(value);
                    }
                    Err(error) => {
                        let _ = outer.set_exception(error);
                    }
                }
            }
        });
    }
    outer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::sleep_with;
    use crate::task::spawn;
    use crate::test_loop::with_loop;
    use std::time::Duration;

    #[test]
    fn results_follow_argument_order_not_completion_order() {
        with_loop(|lp, _h| {
            let task = spawn(async {
                gather(vec![
                    sleep_with(Duration::from_millis(20), "slow"),
                    sleep_with(Duration::from_millis(10), "fast"),
                ])
                .await
            });
            lp.run_ready();
            lp.advance(Duration::from_millis(20));
            assert_eq!(task.result().unwrap(), vec!["slow", "fast"]);
        });
    }

    #[test]
    fn empty_gather_resolves_immediately() {
        with_loop(|lp, _h| {
            let agg = gather(Vec::<Future<u32>>::new());
            assert!(agg.done());
            assert_eq!(agg.result().unwrap(), Vec::<u32>::new());
            lp.run_ready();
        });
    }

    #[test]
    fn first_error_resolves_the_aggregate_immediately() {
        with_loop(|lp, h| {
            let failing: Future<u32> = Future::new(h);
            let slow: Future<u32> = Future::new(h);
            let agg = gather(vec![slow.clone(), failing.clone()]);
            lp.run_ready();
            failing.set_exception(Error::msg("bad")).unwrap();
            lp.run_ready();
            assert!(matches!(agg.result(), Err(Error::Other(_))));
            assert!(!slow.done(), "siblings keep running");
            slow.set_result(1).unwrap();
            lp.run_ready();
        });
    }

    #[test]
    fn child_cancellation_reports_but_does_not_cancel_the_aggregate() {
        with_loop(|lp, h| {
            let doomed: Future<u32> = Future::new(h);
            let other: Future<u32> = Future::new(h);
            let agg = gather_results(vec![doomed.clone(), other.clone()]);
            lp.run_ready();
            doomed.cancel();
            other.set_result(3).unwrap();
            lp.run_ready();
            let outcomes = agg.result().unwrap();
            assert!(matches!(outcomes[0], Err(Error::Cancelled)));
            assert_eq!(*outcomes[1].as_ref().unwrap(), 3);
            assert!(!agg.cancelled());
        });
    }

    #[test]
    fn child_cancellation_is_an_error_for_fail_fast_gather() {
        with_loop(|lp, h| {
            let doomed: Future<u32> = Future::new(h);
            let agg = gather(vec![doomed.clone()]);
            lp.run_ready();
            doomed.cancel();
            lp.run_ready();
            assert!(matches!(agg.result(), Err(Error::Cancelled)));
            assert!(!agg.cancelled(), "the aggregate reports, it is not cancelled");
        });
    }

    #[test]
    fn cancelling_the_aggregate_cancels_unfinished_children() {
        with_loop(|lp, h| {
            let a: Future<u32> = Future::new(h);
            let b: Future<u32> = Future::new(h);
            let agg = gather_results(vec![a.clone(), b.clone()]);
            lp.run_ready();
            a.set_result(1).unwrap();
            lp.run_ready();
            assert!(agg.cancel());
            lp.run_ready();
            assert!(!a.cancelled());
            assert!(b.cancelled());
            let outcomes = agg.result().unwrap();
            assert_eq!(*outcomes[0].as_ref().unwrap(), 1);
            assert!(matches!(outcomes[1], Err(Error::Cancelled)));
        });
    }

    #[test]
    fn duplicate_futures_share_one_child_but_keep_their_slots() {
        with_loop(|lp, h| {
            let shared: Future<u32> = Future::new(h);
            let agg = gather(vec![shared.clone(), shared.clone()]);
            lp.run_ready();
            shared.set_result(7).unwrap();
            lp.run_ready();
            assert_eq!(agg.result().unwrap(), vec![7, 7]);
        });
    }

    #[test]
    fn shield_passes_results_and_errors_through() {
        with_loop(|lp, h| {
            let inner: Future<u32> = Future::new(h);
            let outer = shield(inner.clone());
            lp.run_ready();
            inner.set_result(6).unwrap();
            lp.run_ready();
            assert_eq!(outer.result().unwrap(), 6);
        });
    }

    #[test]
    fn shield_of_a_done_future_is_the_future_itself() {
        with_loop(|_lp, h| {
            let inner: Future<u32> = Future::new(h);
            inner.set_result(1).unwrap();
            let outer = shield(inner.clone());
            assert!(Future::ptr_eq(&inner, &outer));
        });
    }

    #[test]
    fn cancelling_the_outer_leaves_the_inner_alone() {
        with_loop(|lp, h| {
            let inner: Future<u32> = Future::new(h);
            let outer = shield(inner.clone());
            lp.run_ready();
            assert!(outer.cancel());
            lp.run_ready();
            assert!(outer.cancelled());
            assert!(!inner.done());
            inner.set_result(9).unwrap();
            lp.run_ready();
            assert_eq!(inner.result().unwrap(), 9);
        });
    }

    #[test]
    fn inner_cancellation_still_cancels_the_outer() {
        with_loop(|lp, h| {
            let inner: Future<u32> = Future::new(h);
            let outer = shield(inner.clone());
            lp.run_ready();
            inner.cancel();
            lp.run_ready();
            assert!(outer.cancelled());
        });
    }
}
