//! Deferred values: work producing a result that other tasks can wait for.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, OnceLock},
};

use crate::{
    error::Error,
    scope::Scope,
    sync::Mutex,
    task::{Join, Kind, Task, TaskState, ValueCell},
};

/// When the producer of a [`Deferred`] starts running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Start {
    /// Schedule the producer as soon as the [`Deferred`] is created.
    #[default]
    Eager,
    /// Only start the producer when the [`Deferred`] is first resolved or started.
    Lazy,
}

type BoxedBody<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send>>;
type Producer<T> = Box<dyn FnOnce(Scope) -> BoxedBody<T> + Send>;

/// A value that is being produced by a task in some [`Scope`].
///
/// Created by [`Scope::start_deferred`]. Cloning a [`Deferred`] yields another handle to the same
/// value; the producer still runs only once.
///
/// The backing task is a child of the scope it was started in, so its failure is propagated
/// according to that scope's [`Policy`][crate::Policy] *regardless* of whether anybody resolves
/// it. Under [`Policy::Supervisor`][crate::Policy::Supervisor], a failure that was never
/// observed through [`Deferred::resolve`] is reported to the uncaught-failure handler once the
/// last handle is dropped.
pub struct Deferred<T>(Arc<Shared<T>>);

struct Shared<T> {
    scope: Scope,
    producer: Mutex<Option<Producer<T>>>,
    task: OnceLock<Task>,
    value: ValueCell<T>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("task", &self.0.task.get())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + 'static> Deferred<T> {
    pub(crate) fn new<F, Fut>(scope: Scope, start: Start, f: F) -> Self
    where
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let producer: Producer<T> = Box::new(move |scope| -> BoxedBody<T> { Box::pin(f(scope)) });
        let this = Self(Arc::new(Shared {
            scope,
            producer: Mutex::new(Some(producer)),
            task: OnceLock::new(),
            value: ValueCell::default(),
        }));
        if start == Start::Eager {
            this.start();
        }
        this
    }

    /// Starts the producer if it has not been started yet, and returns the backing task.
    ///
    /// If the owning scope is already cancelled, the task is created in the
    /// [`Cancelled`][TaskState::Cancelled] state and the producer never runs.
    pub fn start(&self) -> &Task {
        let mut fresh = false;
        let task = self.0.task.get_or_init(|| {
            fresh = true;
            self.spawn(false)
        });
        if fresh && !task.is_terminal() {
            task.dispatcher().schedule(task.id());
        }
        task
    }

    fn spawn(&self, cancelled: bool) -> Task {
        let producer = self.0.producer.lock().take();
        let value = self.0.value.clone();
        let store = move |v| *value.lock() = Some(v);
        match producer {
            Some(producer) => self.0.scope.prepare(Kind::Deferred, cancelled, producer, store),
            None => unreachable!("deferred producer taken twice"),
        }
    }

    /// Waits for the value.
    ///
    /// Starts the producer if it is [lazy][Start::Lazy] and has not been started yet. Resolving
    /// is memoized: every call returns a clone of the same value, or the same failure (as
    /// checked by [`Failure::ptr_eq`][crate::Failure::ptr_eq]), or [`Error::Cancelled`] if the
    /// producer was cancelled.
    ///
    /// This is a suspension point. If the task calling `resolve` is cancelled while it waits,
    /// `resolve` returns [`Error::Cancelled`], even if the value becomes available at the same
    /// time. An outcome that is already available when `resolve` is called is returned
    /// regardless, without suspending. In particular, a caller that swallowed its own
    /// cancellation (for example with [`run_catching`][crate::run_catching]) and then resolves a
    /// deferred that has already failed gets that failure, not [`Error::Cancelled`]; it only sees
    /// the cancellation at its next suspension point.
    pub async fn resolve(&self) -> Result<T, Error> {
        let task = self.start();
        Join::new(task).await?;
        match task.outcome() {
            Some(Ok(())) => match &*self.0.value.lock() {
                Some(value) => Ok(value.clone()),
                None => unreachable!("deferred task {} completed without a value", task.id()),
            },
            Some(Err(e)) => {
                if e.is_failed() {
                    task.mark_handled();
                }
                Err(e)
            }
            None => unreachable!("joined task {} has not finished", task.id()),
        }
    }

    /// Cancels the producer.
    ///
    /// A lazy producer that has not been started yet will never run.
    pub fn cancel(&self) {
        let mut fresh = false;
        let task = self.0.task.get_or_init(|| {
            fresh = true;
            self.spawn(true)
        });
        if !fresh {
            task.cancel();
        }
    }
}

impl<T> Deferred<T> {
    /// Returns the backing task, or `None` if a lazy producer has not been started yet.
    pub fn task(&self) -> Option<&Task> {
        self.0.task.get()
    }

    pub fn is_started(&self) -> bool {
        self.0.task.get().is_some()
    }

    /// Returns the state of the backing task, or `None` if it has not been started yet.
    pub fn state(&self) -> Option<TaskState> {
        self.task().map(Task::state)
    }

    /// Returns `true` once the producer has finished with a value.
    pub fn is_completed(&self) -> bool {
        self.state() == Some(TaskState::Completed)
    }

    /// Returns the owning scope.
    pub fn scope(&self) -> &Scope {
        &self.0.scope
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(task) = self.task.get() {
            task.detach();
        }
    }
}
