//! Weak bookkeeping of live tasks and the per-loop current task.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use slotmap::{SlotMap, new_key_type};

use crate::port::{LoopHandle, LoopId};

new_key_type! {
    /// Stable identity of a task, shared by every clone and [`TaskRef`] of
    /// it.
    pub struct TaskId;
}

/// The erased view of a task used by [`all_tasks`] and [`current_task`].
pub trait AnyTask {
    /// The task's registry identity.
    fn id(&self) -> TaskId;
    /// The loop the task runs on.
    fn loop_id(&self) -> LoopId;
    /// True once the task is terminal.
    fn done(&self) -> bool;
    /// True if the task's coroutine terminated with a cancellation.
    fn cancelled(&self) -> bool;
    /// Requests cooperative cancellation; see
    /// [`Task::cancel`](crate::Task::cancel).
    fn cancel(&self) -> bool;
}

/// Shared, type-erased handle to a task.
pub type TaskRef = Rc<dyn AnyTask>;

// The registry must never keep a task alive (listing tasks is observation,
// not ownership), hence the weak entries. Tasks enrol in their constructor
// and withdraw on their terminal transition; a task dropped mid-flight
// leaves a dead weak entry that queries skip.
thread_local! {
    static ALL_TASKS: RefCell<SlotMap<TaskId, Weak<dyn AnyTask>>> = RefCell::default();
    static CURRENT_TASK: RefCell<Option<TaskRef>> = RefCell::default();
}

pub(crate) fn enroll(task: Weak<dyn AnyTask>) -> TaskId {
    ALL_TASKS.with_borrow_mut(|tasks| tasks.insert(task))
}

pub(crate) fn withdraw(id: TaskId) {
    ALL_TASKS.with_borrow_mut(|tasks| {
        tasks.remove(id);
    });
}

/// Every live task tied to `lp`, as a possibly-stale snapshot.
pub fn all_tasks(lp: &LoopHandle) -> Vec<TaskRef> {
    ALL_TASKS.with_borrow(|tasks| {
        tasks
            .values()
            .filter_map(Weak::upgrade)
            .filter(|task| task.loop_id() == lp.id())
            .collect()
    })
}

/// The task currently stepping on `lp`, or `None` when called outside a
/// task's step.
pub fn current_task(lp: &LoopHandle) -> Option<TaskRef> {
    CURRENT_TASK.with_borrow(|current| {
        current.clone().filter(|task| task.loop_id() == lp.id())
    })
}

/// Installs a task as the thread's currently-stepping one for the guard's
/// lifetime. Steps never nest on a single thread.
pub(crate) struct CurrentTaskGuard(());

impl CurrentTaskGuard {
    pub(crate) fn new(task: TaskRef) -> Self {
        CURRENT_TASK.with_borrow_mut(|slot| {
            assert!(
                slot.is_none(),
                "a task stepped while another task was already running"
            );
            *slot = Some(task);
        });
        Self(())
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with_borrow_mut(|slot| *slot = None);
    }
}
