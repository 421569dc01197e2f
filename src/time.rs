//! Suspension points driven by the dispatcher.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use crate::{context, error::Cancelled};

/// Suspends the current task for `duration` of dispatcher time.
///
/// Returns [`Cancelled`] if the task is (or becomes) cancelled before the time is up. A zero
/// `duration` does not suspend, but still checks for cancellation.
///
/// # Panics
///
/// The returned future panics if it has to wait and is not polled by a task of this crate.
pub fn delay(duration: Duration) -> Delay {
    Delay {
        duration,
        deadline: None,
        cancelled: Arc::new(AtomicBool::new(false)),
    }
}

/// Future returned by [`delay`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Delay {
    duration: Duration,
    deadline: Option<Duration>,
    /// Shared with the dispatcher's timer entry.
    cancelled: Arc<AtomicBool>,
}

impl Future for Delay {
    type Output = Result<(), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(cancelled) = context::check_cancelled() {
            return Poll::Ready(Err(cancelled));
        }
        if self.duration.is_zero() {
            return Poll::Ready(Ok(()));
        }

        let Some(task) = context::current() else {
            panic!("`delay` polled outside of a task");
        };
        let dispatcher = task.dispatcher();
        match self.deadline {
            None => {
                let deadline = dispatcher.now() + self.duration;
                self.deadline = Some(deadline);
                dispatcher.register_timer(deadline, cx.waker().clone(), self.cancelled.clone());
                Poll::Pending
            }
            Some(deadline) if dispatcher.now() >= deadline => Poll::Ready(Ok(())),
            Some(_) => Poll::Pending,
        }
    }
}

impl Drop for Delay {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

/// Lets every other runnable task run before the current task continues.
///
/// Returns [`Cancelled`] if the task is cancelled before or while yielding.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
#[derive(Debug)]
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Result<(), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        context::check_cancelled()?;
        if self.yielded {
            return Poll::Ready(Ok(()));
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
