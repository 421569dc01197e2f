//! The task state machine and the task tree.
//!
//! Every unit of work, and every scope, is backed by a [`Task`]. Tasks form a tree: a task knows
//! its parent, and a parent tracks its children until they reach a terminal state. All of the
//! structured concurrency rules live here:
//!
//! - cancellation cascades from a task to all of its children, in spawn order;
//! - a failure cancels the failing task's children and, if the parent scope has the
//!   [`Policy::Normal`] policy, fails the parent with the same [`Failure`];
//! - a task only becomes terminal once its body has finished *and* all of its children are
//!   terminal;
//! - a failure that nobody can observe is handed to the uncaught-failure handler exactly once.

use std::{
    fmt,
    future::Future,
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll, Waker},
};

use crate::{
    context,
    dispatcher::{Dispatcher, UncaughtHandler},
    error::{Cancelled, Error, Failure},
    scope::Policy,
    sync::Mutex,
};

/// Holds the value produced by a task body until somebody takes it.
pub(crate) type ValueCell<T> = Arc<Mutex<Option<T>>>;

/// Process-unique identifier of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The lifecycle state of a [`Task`].
///
/// ```text
/// Active ──┬────────────────────────────► Completed
///          │                               ▲
///          └─► Cancelling ─┬───────────────┘
///                          ├────────────► Cancelled
///                          └────────────► Failed
/// ```
///
/// The `Cancelling → Completed` edge is taken by a task whose body returns a value before it
/// ever observes a cancellation request: it still ends up [`Completed`][TaskState::Completed],
/// even though the request arrived in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Active,
    /// Cancellation or failure has been requested, but the body or some children are still running.
    Cancelling,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// The role a task plays in the tree. Determines how its failures travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// A free-standing scope without a body. Its failures are reported as uncaught.
    Root,
    /// The root of [`Dispatcher::block_on`]; its outcome is returned to the blocked caller.
    Joined,
    /// Fire-and-forget work started with `Scope::launch`.
    Launch,
    /// The backing task of a `Deferred`.
    Deferred,
    /// A nested scope; its outcome is returned to the code that opened it.
    Nested,
}

impl Kind {
    /// Whether a failure of this task is pushed into its parent scope.
    fn propagates(self) -> bool {
        matches!(self, Kind::Launch | Kind::Deferred)
    }

    /// Whether nobody holds a handle through which a failure could still be observed.
    fn starts_detached(self) -> bool {
        matches!(self, Kind::Root | Kind::Launch)
    }
}

/// A handle to a task in the task tree.
///
/// Cloning a [`Task`] yields another handle to the same task. Handles can be used to inspect the
/// task, to cancel it, and to wait for it.
#[derive(Clone)]
pub struct Task(Arc<Inner>);

struct Inner {
    id: TaskId,
    name: Option<String>,
    kind: Kind,
    policy: Policy,
    parent: Option<Task>,
    dispatcher: Dispatcher,
    handler: Option<UncaughtHandler>,
    /// The dispatcher slot that has to be scheduled for this task's body to see a cancellation.
    /// Nested scopes are polled by whichever task opened them.
    runner: Option<TaskId>,
    state: Mutex<State>,
}

struct State {
    phase: TaskState,
    cancel_requested: bool,
    cancel_observed: bool,
    /// The first failure wins; later ones are dropped.
    failure: Option<Failure>,
    body: Body,
    /// Non-terminal children, in spawn order.
    children: Vec<Task>,
    waiters: Vec<Waker>,
    /// No handle remains through which the failure could be observed.
    detached: bool,
    /// The failure has been observed, propagated or reported.
    handled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Body {
    Running,
    Finished,
    /// Bodyless scopes finish once they are cancelled and their children are done.
    Absent,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

pub(crate) struct Spawn {
    pub(crate) kind: Kind,
    pub(crate) policy: Policy,
    pub(crate) name: Option<String>,
    pub(crate) handler: Option<UncaughtHandler>,
    pub(crate) has_body: bool,
}

impl Task {
    /// Creates a task without a parent.
    pub(crate) fn root(dispatcher: &Dispatcher, spawn: Spawn) -> Task {
        let task = Task::create(dispatcher.clone(), None, spawn, None);
        log::trace!("created root task {} ({:?})", task.id(), task.0.kind);
        task
    }

    /// Creates a child of `self`.
    ///
    /// If `self` is already cancelling or terminal, or `cancelled` is set, the child is created
    /// in the *Cancelled* state, never runs, and is not registered with `self`.
    pub(crate) fn child(&self, spawn: Spawn, cancelled: bool) -> Task {
        let runner = match spawn.kind {
            Kind::Nested => context::current()
                .and_then(|current| current.0.runner)
                .or(self.0.runner),
            _ => None,
        };
        let task = Task::create(self.0.dispatcher.clone(), Some(self.clone()), spawn, runner);

        let registered = {
            let mut state = self.0.state.lock();
            let open = !cancelled && !state.cancel_requested && !state.phase.is_terminal();
            if open {
                state.children.push(task.clone());
            }
            open
        };

        if registered {
            log::trace!(
                "task {} spawned {} ({:?})",
                self.id(),
                task.id(),
                task.0.kind
            );
        } else {
            log::debug!(
                "task {} created in cancelled scope {}; it will never run",
                task.id(),
                self.id()
            );
            {
                let mut state = task.0.state.lock();
                state.cancel_requested = true;
                state.cancel_observed = true;
                state.body = Body::Finished;
                state.phase = TaskState::Cancelling;
            }
            task.try_finalize();
        }
        task
    }

    fn create(
        dispatcher: Dispatcher,
        parent: Option<Task>,
        spawn: Spawn,
        runner: Option<TaskId>,
    ) -> Task {
        let id = TaskId::next();
        let handler = spawn
            .handler
            .or_else(|| parent.as_ref().and_then(|p| p.0.handler.clone()));
        let runner = match (spawn.kind, spawn.has_body) {
            (Kind::Nested, _) => runner,
            (_, true) => Some(id),
            (_, false) => None,
        };
        Task(Arc::new(Inner {
            id,
            name: spawn.name,
            kind: spawn.kind,
            policy: spawn.policy,
            parent,
            dispatcher,
            handler,
            runner,
            state: Mutex::new(State {
                phase: TaskState::Active,
                cancel_requested: false,
                cancel_observed: false,
                failure: None,
                body: if spawn.has_body {
                    Body::Running
                } else {
                    Body::Absent
                },
                children: Vec::new(),
                waiters: Vec::new(),
                detached: spawn.kind.starts_detached(),
                handled: false,
            }),
        }))
    }

    #[inline]
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    /// Returns the name given to the scope backed by this task, if any.
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Returns the scope policy that applies to this task's children.
    #[inline]
    pub fn policy(&self) -> Policy {
        self.0.policy
    }

    pub fn parent(&self) -> Option<&Task> {
        self.0.parent.as_ref()
    }

    /// Returns the children that have not yet reached a terminal state, in spawn order.
    pub fn children(&self) -> Vec<Task> {
        self.0.state.lock().children.clone()
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.0.dispatcher
    }

    pub fn state(&self) -> TaskState {
        self.0.state.lock().phase
    }

    /// Returns `true` while the task has not been asked to cancel and has not finished.
    pub fn is_active(&self) -> bool {
        self.state() == TaskState::Active
    }

    pub fn is_completed(&self) -> bool {
        self.state() == TaskState::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    pub fn is_failed(&self) -> bool {
        self.state() == TaskState::Failed
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Returns `true` once cancellation has been requested, by a call to [`Task::cancel`], by a
    /// cancelled or failing ancestor, or by a failure of the task itself.
    pub fn is_cancel_requested(&self) -> bool {
        self.0.state.lock().cancel_requested
    }

    /// Returns the failure recorded for this task, if any.
    ///
    /// A failure is recorded as soon as the task (or, under [`Policy::Normal`], one of its
    /// children) fails, which can be well before the task reaches [`TaskState::Failed`].
    pub fn failure(&self) -> Option<Failure> {
        self.0.state.lock().failure.clone()
    }

    /// Returns the terminal outcome of the task, or `None` if it has not finished yet.
    pub fn outcome(&self) -> Option<Result<(), Error>> {
        let state = self.0.state.lock();
        match state.phase {
            TaskState::Active | TaskState::Cancelling => None,
            TaskState::Completed => Some(Ok(())),
            TaskState::Cancelled => Some(Err(Cancelled.into())),
            TaskState::Failed => match &state.failure {
                Some(failure) => Some(Err(Error::Failed(failure.clone()))),
                None => unreachable!("task {} failed without a failure", self.id()),
            },
        }
    }

    /// Requests cancellation of this task and, recursively, all of its children.
    ///
    /// Children are cancelled in spawn order. The request is only *observed* at the task's next
    /// suspension point; cancelling a task that has already finished (or is already cancelling)
    /// does nothing.
    pub fn cancel(&self) {
        let children = {
            let mut state = self.0.state.lock();
            if state.cancel_requested || state.phase.is_terminal() {
                return;
            }
            state.cancel_requested = true;
            state.phase = TaskState::Cancelling;
            state.children.clone()
        };

        log::debug!("cancelling task {} and {} child(ren)", self.id(), children.len());
        for child in &children {
            child.cancel();
        }
        self.wake_runner();
        self.try_finalize();
    }

    /// Waits until this task has reached a terminal state.
    ///
    /// This only waits; it does not count as observing a failure of the task, so a failed
    /// launched task is still reported as uncaught. Use [`Task::outcome`] afterwards to learn how
    /// it ended.
    ///
    /// If the task has already finished, this returns immediately. Otherwise it is a suspension
    /// point: if the *calling* task is cancelled while waiting (or before), this returns
    /// [`Cancelled`].
    pub async fn join(&self) -> Result<(), Cancelled> {
        Join::new(self).await
    }

    /// Marks cancellation as observed if it has been requested.
    pub(crate) fn observe_cancellation(&self) -> bool {
        let mut state = self.0.state.lock();
        if state.cancel_requested {
            state.cancel_observed = true;
        }
        state.cancel_requested
    }

    /// Records that somebody has seen this task's failure.
    pub(crate) fn mark_handled(&self) {
        self.0.state.lock().handled = true;
    }

    /// Records that no handle remains through which this task's failure could be observed.
    pub(crate) fn detach(&self) {
        let unhandled = {
            let mut state = self.0.state.lock();
            state.detached = true;
            if state.phase == TaskState::Failed && !state.handled {
                state.handled = true;
                state.failure.clone()
            } else {
                None
            }
        };
        if let Some(failure) = unhandled {
            self.report(&failure);
        }
    }

    /// Registers `cx`'s waker to be woken when the task becomes terminal.
    pub(crate) fn poll_terminated(&self, cx: &mut Context<'_>) -> Poll<()> {
        let mut state = self.0.state.lock();
        if state.phase.is_terminal() {
            Poll::Ready(())
        } else {
            state.waiters.push(cx.waker().clone());
            Poll::Pending
        }
    }

    /// Called when the body of this task has returned (or was abandoned).
    pub(crate) fn finish_body(&self, result: Result<(), Error>) {
        match result {
            Ok(()) => {}
            Err(Error::Cancelled(_)) => {
                self.0.state.lock().cancel_observed = true;
                self.cancel();
            }
            Err(Error::Failed(failure)) => self.fail(failure),
        }
        self.0.state.lock().body = Body::Finished;
        log::trace!("body of task {} finished", self.id());
        self.try_finalize();
    }

    /// Records `failure` and starts cancelling everything below this task.
    fn fail(&self, failure: Failure) {
        let children = {
            let mut state = self.0.state.lock();
            if state.phase.is_terminal() {
                log::debug!("task {} already finished; dropping late failure: {failure}", self.id());
                return;
            }
            if let Some(first) = &state.failure {
                log::debug!(
                    "task {} already failed with `{first}`; suppressing `{failure}`",
                    self.id()
                );
                return;
            }
            state.failure = Some(failure.clone());
            state.cancel_requested = true;
            state.phase = TaskState::Cancelling;
            state.children.clone()
        };

        log::debug!("task {} failed: {failure}", self.id());
        for child in &children {
            child.cancel();
        }
        if let (Some(parent), true) = (&self.0.parent, self.0.kind.propagates()) {
            parent.child_failed(self, failure);
        }
        self.wake_runner();
        self.try_finalize();
    }

    fn child_failed(&self, child: &Task, failure: Failure) {
        match self.0.policy {
            Policy::Normal => {
                log::debug!(
                    "task {} failed; cancelling scope {} and all its children",
                    child.id(),
                    self.id()
                );
                child.mark_handled();
                self.fail(failure);
            }
            Policy::Supervisor => {
                log::debug!(
                    "task {} failed; supervisor scope {} keeps running",
                    child.id(),
                    self.id()
                );
            }
        }
    }

    fn child_terminated(&self, child: &Task) {
        self.0
            .state
            .lock()
            .children
            .retain(|c| !Arc::ptr_eq(&c.0, &child.0));
        self.try_finalize();
    }

    /// Moves the task to its terminal state if its body and all children are done.
    fn try_finalize(&self) {
        let (phase, waiters, unhandled) = {
            let mut state = self.0.state.lock();
            if state.phase.is_terminal() || !state.children.is_empty() {
                return;
            }
            let body_done = match state.body {
                Body::Running => false,
                Body::Finished => true,
                Body::Absent => state.cancel_requested,
            };
            if !body_done {
                return;
            }

            let phase = if state.failure.is_some() {
                TaskState::Failed
            } else if state.cancel_observed || state.body == Body::Absent {
                TaskState::Cancelled
            } else {
                TaskState::Completed
            };
            state.phase = phase;

            let unhandled = if phase == TaskState::Failed && state.detached && !state.handled {
                state.handled = true;
                state.failure.clone()
            } else {
                None
            };
            (phase, mem::take(&mut state.waiters), unhandled)
        };

        log::trace!("task {} finished: {phase:?}", self.id());
        for waiter in waiters {
            waiter.wake();
        }
        if let Some(failure) = unhandled {
            self.report(&failure);
        }
        if let Some(parent) = &self.0.parent {
            parent.child_terminated(self);
        }
    }

    fn wake_runner(&self) {
        if let Some(runner) = self.0.runner {
            self.0.dispatcher.schedule(runner);
        }
    }

    fn report(&self, failure: &Failure) {
        log::debug!("task {} failed and nobody is left to observe it", self.id());
        self.0
            .dispatcher
            .report_uncaught(self.0.handler.as_ref(), self.id(), failure);
    }
}

/// Waits for a task to become terminal, observing the waiting task's cancellation.
///
/// A target that is already terminal when first polled is returned even if the waiting task is
/// being cancelled. Once the waiter has suspended, its own cancellation takes precedence.
pub(crate) struct Join<'a> {
    task: &'a Task,
    suspended: bool,
}

impl<'a> Join<'a> {
    pub(crate) fn new(task: &'a Task) -> Self {
        Self {
            task,
            suspended: false,
        }
    }
}

impl Future for Join<'_> {
    type Output = Result<(), Cancelled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.suspended && self.task.is_terminal() {
            return Poll::Ready(Ok(()));
        }
        if let Err(cancelled) = context::check_cancelled() {
            return Poll::Ready(Err(cancelled));
        }
        match self.task.poll_terminated(cx) {
            Poll::Ready(()) => Poll::Ready(Ok(())),
            Poll::Pending => {
                self.suspended = true;
                Poll::Pending
            }
        }
    }
}

/// Turns a panic while polling the inner future into a failure.
pub(crate) struct CatchUnwind<F> {
    inner: Pin<Box<F>>,
}

impl<F> CatchUnwind<F> {
    pub(crate) fn new(inner: F) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<T, F: Future<Output = Result<T, Error>>> Future for CatchUnwind<F> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match panic::catch_unwind(AssertUnwindSafe(|| inner.poll(cx))) {
            Ok(poll) => poll,
            Err(payload) => {
                let failure = Failure::from_panic(payload);
                log::debug!("caught panic: {failure}");
                Poll::Ready(Err(Error::Failed(failure)))
            }
        }
    }
}
