//! The task currently being polled on this thread.
//!
//! Suspension points ([`delay`][crate::delay], [`yield_now`][crate::yield_now],
//! [`Deferred::resolve`][crate::Deferred::resolve], ...) need to know which task is polling them
//! so that they can observe its cancellation. The dispatcher installs the task before polling its
//! future, and nested scopes install their own task while polling their body.

use std::cell::RefCell;

use crate::task::Task;

thread_local! {
    static CURRENT: RefCell<Option<Task>> = const { RefCell::new(None) };
}

/// Returns the task whose future is currently being polled on this thread, if any.
pub(crate) fn current() -> Option<Task> {
    CURRENT.with(|cell| cell.borrow().clone())
}

/// Installs `task` as the current task until the returned guard is dropped.
///
/// Guards nest: dropping one restores whatever was current when it was created, so a nested
/// scope can install its own task while its parent task is being polled.
pub(crate) fn enter(task: Task) -> Entered {
    let prev = CURRENT.with(|cell| cell.replace(Some(task)));
    Entered { prev }
}

#[must_use = "the task is only current while `Entered` is alive"]
pub(crate) struct Entered {
    prev: Option<Task>,
}

impl Drop for Entered {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|cell| *cell.borrow_mut() = prev);
    }
}

/// Checks the current task for a pending cancellation request.
///
/// This is the single place where cancellation is *observed*. Outside of any task there is
/// nothing to cancel.
pub(crate) fn check_cancelled() -> Result<(), crate::Cancelled> {
    match current() {
        Some(task) if task.observe_cancellation() => Err(crate::Cancelled),
        _ => Ok(()),
    }
}
