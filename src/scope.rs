//! Scopes: the owners of tasks.
//!
//! Every piece of work is started inside a [`Scope`], and every [`Scope`] is backed by a [`Task`].
//! Work started in a scope becomes a child of that task. The scope's [`Policy`] decides what a
//! failing child does to its siblings.

use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
};

use crate::{
    deferred::{Deferred, Start},
    dispatcher::{Dispatcher, UncaughtHandler},
    error::{Cancelled, Error, Failure},
    task::{CatchUnwind, Kind, Spawn, Task, TaskId, ValueCell},
};

/// How a scope reacts to the failure of one of its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Policy {
    /// A failing child fails the scope with the same failure, which cancels all other children
    /// and travels further up the tree.
    #[default]
    Normal,
    /// Children fail independently. The scope and its other children keep running, and a failed
    /// [launched][Scope::launch] child is reported to the uncaught-failure handler.
    Supervisor,
}

/// A builder object that can be used to configure a root [`Scope`].
#[derive(Clone, Default)]
pub struct ScopeBuilder {
    name: Option<String>,
    policy: Policy,
    handler: Option<UncaughtHandler>,
}

impl ScopeBuilder {
    /// Sets the scope's name, shown in the [`Debug`] output of its [`Task`].
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    #[inline]
    pub fn policy(self, policy: Policy) -> Self {
        Self { policy, ..self }
    }

    /// Sets the uncaught-failure handler for every task in this scope's tree.
    ///
    /// Takes precedence over the [`Dispatcher`]'s handler.
    pub fn on_uncaught<F>(self, handler: F) -> Self
    where
        F: Fn(TaskId, &Failure) + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
            ..self
        }
    }

    /// Creates the scope.
    ///
    /// The scope has no body of its own; it stays active until it is cancelled, or until a
    /// failure reaches it (under [`Policy::Normal`]). Since nobody waits for it, a failure of the
    /// scope is reported to the uncaught-failure handler.
    pub fn build(self, dispatcher: &Dispatcher) -> Scope {
        let task = Task::root(
            dispatcher,
            Spawn {
                kind: Kind::Root,
                policy: self.policy,
                name: self.name,
                handler: self.handler,
                has_body: false,
            },
        );
        Scope { task }
    }
}

/// A handle to a scope.
///
/// Cloning a [`Scope`] yields another handle to the same scope.
#[derive(Debug, Clone)]
pub struct Scope {
    task: Task,
}

impl Scope {
    #[inline]
    pub fn builder() -> ScopeBuilder {
        ScopeBuilder::default()
    }

    /// Creates a root scope with the [`Policy::Normal`] policy.
    pub fn new(dispatcher: &Dispatcher) -> Self {
        Self::builder().build(dispatcher)
    }

    /// Creates a root scope with the [`Policy::Supervisor`] policy.
    pub fn supervisor(dispatcher: &Dispatcher) -> Self {
        Self::builder().policy(Policy::Supervisor).build(dispatcher)
    }

    /// Returns the [`Task`] backing this scope.
    #[inline]
    pub fn task(&self) -> &Task {
        &self.task
    }

    #[inline]
    pub fn policy(&self) -> Policy {
        self.task.policy()
    }

    #[inline]
    pub fn dispatcher(&self) -> &Dispatcher {
        self.task.dispatcher()
    }

    /// Returns `true` while the scope accepts new work that will actually run.
    pub fn is_active(&self) -> bool {
        self.task.is_active()
    }

    /// Cancels the scope and everything running in it.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Starts fire-and-forget work in this scope.
    ///
    /// `f` receives the [`Scope`] of the new task, in which it can start children of its own.
    ///
    /// Nobody can observe the outcome of launched work, so if it fails, the failure either fails
    /// this scope ([`Policy::Normal`]) or is reported to the uncaught-failure handler
    /// ([`Policy::Supervisor`]). If this scope is already cancelled, the returned task is
    /// [`Cancelled`][crate::TaskState::Cancelled] and `f` is never called.
    pub fn launch<F, Fut>(&self, f: F) -> Task
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let task = self.prepare(Kind::Launch, false, f, |()| {});
        if !task.is_terminal() {
            self.dispatcher().schedule(task.id());
        }
        task
    }

    /// Starts work producing a value of type `T` that can be awaited with
    /// [`Deferred::resolve`].
    ///
    /// With [`Start::Eager`], the work is scheduled right away. With [`Start::Lazy`], it only
    /// starts when the [`Deferred`] is first resolved (or explicitly [started][Deferred::start]).
    pub fn start_deferred<T, F, Fut>(&self, start: Start, f: F) -> Deferred<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Scope) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        Deferred::new(self.clone(), start, f)
    }

    /// Runs `f` in a nested scope with the [`Policy::Normal`] policy and waits for it.
    ///
    /// The returned future completes once `f` has returned *and* all work started in the nested
    /// scope has finished. Failures are not propagated to `self`; instead, the first failure of
    /// the nested scope (whether raised by `f` or by a child) is returned. If the nested scope was
    /// cancelled, [`Error::Cancelled`] is returned.
    ///
    /// Dropping the returned future before it completes cancels the nested scope. If the nested
    /// scope still ends up failing after that, its failure is reported as uncaught.
    pub fn scope<T, F, Fut>(&self, f: F) -> Nested<T, Fut>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.nested(Policy::Normal, f)
    }

    /// Like [`Scope::scope`], but the nested scope uses the [`Policy::Supervisor`] policy.
    ///
    /// Children of the nested scope fail independently; only a failure raised by `f` itself is
    /// returned.
    pub fn supervisor_scope<T, F, Fut>(&self, f: F) -> Nested<T, Fut>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        self.nested(Policy::Supervisor, f)
    }

    fn nested<T, F, Fut>(&self, policy: Policy, f: F) -> Nested<T, Fut>
    where
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let task = self.task.child(
            Spawn {
                kind: Kind::Nested,
                policy,
                name: None,
                handler: None,
                has_body: true,
            },
            false,
        );
        let body = if task.is_terminal() {
            None
        } else {
            Some(CatchUnwind::new(f(Scope { task: task.clone() })))
        };
        Nested {
            task,
            body,
            value: None,
            returned: false,
        }
    }

    /// Creates a child task running `f` and hands its future to the dispatcher, without
    /// scheduling it.
    pub(crate) fn prepare<T, F, Fut, S>(&self, kind: Kind, cancelled: bool, f: F, sink: S) -> Task
    where
        T: Send + 'static,
        F: FnOnce(Scope) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
        S: FnOnce(T) + Send + 'static,
    {
        let task = self.task.child(
            Spawn {
                kind,
                policy: Policy::Normal,
                name: None,
                handler: None,
                has_body: true,
            },
            cancelled,
        );
        if !task.is_terminal() {
            let body = f(Scope { task: task.clone() });
            self.dispatcher()
                .spawn(task.clone(), Box::pin(run(task.clone(), body, sink)));
        }
        task
    }
}

/// Drives a task body and reports its result to the task.
async fn run<T, Fut, S>(task: Task, body: Fut, sink: S)
where
    Fut: Future<Output = Result<T, Error>>,
    S: FnOnce(T),
{
    if task.is_cancel_requested() {
        log::trace!("task {} was cancelled before it started", task.id());
        task.finish_body(Err(Cancelled.into()));
        return;
    }
    let result = CatchUnwind::new(body).await.map(sink);
    task.finish_body(result);
}

/// Spawns and schedules the root task of a blocking call.
pub(crate) fn spawn_root<T, F, Fut>(
    dispatcher: &Dispatcher,
    handler: Option<UncaughtHandler>,
    f: F,
) -> (Task, ValueCell<T>)
where
    T: Send + 'static,
    F: FnOnce(Scope) -> Fut,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
{
    let task = Task::root(
        dispatcher,
        Spawn {
            kind: Kind::Joined,
            policy: Policy::Normal,
            name: None,
            handler,
            has_body: true,
        },
    );
    let value = ValueCell::<T>::default();
    let body = f(Scope { task: task.clone() });
    let cell = value.clone();
    dispatcher.spawn(
        task.clone(),
        Box::pin(run(task.clone(), body, move |v| *cell.lock() = Some(v))),
    );
    dispatcher.schedule(task.id());
    (task, value)
}

pub(crate) fn take_root_outcome<T>(task: &Task, value: &ValueCell<T>) -> Result<T, Error> {
    match task.outcome() {
        Some(Ok(())) => match value.lock().take() {
            Some(value) => Ok(value),
            None => unreachable!("root task {} completed without a value", task.id()),
        },
        Some(Err(e)) => Err(e),
        None => unreachable!("root task {} has not finished", task.id()),
    }
}

/// Future returned by [`Scope::scope`] and [`Scope::supervisor_scope`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
pub struct Nested<T, Fut> {
    task: Task,
    /// `None` once the body has returned.
    body: Option<CatchUnwind<Fut>>,
    value: Option<T>,
    /// Set once the outcome has been handed to the caller.
    returned: bool,
}

// Neither the body (boxed) nor the value is ever pinned.
impl<T, Fut> Unpin for Nested<T, Fut> {}

impl<T, Fut> Nested<T, Fut> {
    /// Returns the [`Task`] backing the nested scope.
    pub fn task(&self) -> &Task {
        &self.task
    }
}

impl<T, Fut> Future for Nested<T, Fut>
where
    Fut: Future<Output = Result<T, Error>>,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(body) = &mut this.body {
            let polled = {
                let _entered = crate::context::enter(this.task.clone());
                Pin::new(body).poll(cx)
            };
            let Poll::Ready(result) = polled else {
                return Poll::Pending;
            };
            this.body = None;
            let result = result.map(|value| this.value = Some(value));
            this.task.finish_body(result);
        }

        ready!(this.task.poll_terminated(cx));
        this.returned = true;
        Poll::Ready(match this.task.outcome() {
            Some(Ok(())) => match this.value.take() {
                Some(value) => Ok(value),
                None => unreachable!("nested scope {} completed without a value", this.task.id()),
            },
            Some(Err(e)) => Err(e),
            None => unreachable!("nested scope {} has not finished", this.task.id()),
        })
    }
}

impl<T, Fut> Drop for Nested<T, Fut> {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        if self.body.take().is_some() {
            log::debug!(
                "nested scope {} dropped before its body finished",
                self.task.id()
            );
            self.task.finish_body(Err(Cancelled.into()));
        } else {
            self.task.cancel();
        }
        // Nobody can read the outcome anymore, so a failure has to go to the handler.
        self.task.detach();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        catch, delay, run_catching,
        test::{boom, Journal, Recorder},
        yield_now, Discipline, TaskState,
    };

    use super::*;

    fn dispatcher(discipline: Discipline, recorder: &Recorder) -> Dispatcher {
        Dispatcher::builder()
            .discipline(discipline)
            .on_uncaught(recorder.handler())
            .build()
    }

    /// A deferred fails after one time unit while a launched task awaits it through `catch`.
    fn deferred_fails_while_awaited(policy: Policy, discipline: Discipline) {
        let recorder = Recorder::new();
        let dispatcher = dispatcher(discipline, &recorder);
        let scope = Scope::builder().policy(policy).build(&dispatcher);
        let journal = Journal::new();

        let failure = Failure::msg("E");
        let f = failure.clone();
        let deferred = scope.start_deferred(Start::Eager, move |_| async move {
            delay(Duration::from_secs(1)).await?;
            Err::<i32, _>(f.into())
        });
        let j = journal.clone();
        let d = deferred.clone();
        let launched = scope.launch(move |_| async move {
            let caught = catch(d.resolve()).await;
            j.push(format!("{caught:?}"));
            let _ = caught?;
            Ok(())
        });

        dispatcher.advance_time(Duration::from_secs(1));
        let task = deferred.task().unwrap();
        assert!(task.is_failed());
        assert!(task.failure().unwrap().ptr_eq(&failure));

        match policy {
            Policy::Supervisor => {
                assert_eq!(
                    journal.entries(),
                    ["Ok(Err(Failure(Message(\"E\"))))"]
                );
                assert!(launched.is_completed());
                assert!(scope.is_active());
                assert_eq!(recorder.count(), 0);
            }
            Policy::Normal => {
                assert_eq!(journal.entries(), ["Err(Cancelled)"]);
                assert!(launched.is_cancelled());
                assert!(scope.task().is_failed());
                assert!(scope.task().failure().unwrap().ptr_eq(&failure));
                assert_eq!(recorder.count(), 1);
                assert!(recorder.failures()[0].ptr_eq(&failure));
            }
        }
    }

    #[test]
    fn supervisor_lets_catch_see_the_failure() {
        deferred_fails_while_awaited(Policy::Supervisor, Discipline::Queued);
        deferred_fails_while_awaited(Policy::Supervisor, Discipline::Immediate);
    }

    #[test]
    fn normal_scope_cancels_the_catcher() {
        deferred_fails_while_awaited(Policy::Normal, Discipline::Queued);
        deferred_fails_while_awaited(Policy::Normal, Discipline::Immediate);
    }

    #[test]
    fn unresolved_deferred_failure_fails_the_scope() {
        for discipline in [Discipline::Queued, Discipline::Immediate] {
            let recorder = Recorder::new();
            let dispatcher = dispatcher(discipline, &recorder);
            let scope = Scope::new(&dispatcher);

            let e = Failure::msg("E");
            let f = e.clone();
            let a = scope.start_deferred(Start::Eager, move |_| async move {
                delay(Duration::from_secs(1)).await?;
                Err::<u32, _>(f.into())
            });
            let b = scope.start_deferred(Start::Eager, |_| async {
                delay(Duration::from_secs(2)).await?;
                Ok(2u32)
            });

            dispatcher.advance_time(Duration::from_secs(1));
            assert_eq!(a.state(), Some(TaskState::Failed));
            assert_eq!(b.state(), Some(TaskState::Cancelled));
            assert!(scope.task().is_failed());
            assert!(scope.task().failure().unwrap().ptr_eq(&e));
            assert_eq!(recorder.count(), 1);
        }
    }

    #[test]
    fn failure_cancels_siblings() {
        for discipline in [Discipline::Queued, Discipline::Immediate] {
            let recorder = Recorder::new();
            let dispatcher = dispatcher(discipline, &recorder);
            let scope = Scope::new(&dispatcher);
            let journal = Journal::new();

            let j = journal.clone();
            let sleeper = scope.launch(move |_| async move {
                if let Err(e) = delay(Duration::from_secs(10)).await {
                    j.push("sleeper cancelled");
                    return Err(e.into());
                }
                j.push("sleeper woke");
                Ok(())
            });
            let failing = scope.launch(|_| async {
                delay(Duration::from_secs(1)).await?;
                Err(boom())
            });

            dispatcher.advance_until_idle();
            assert_eq!(journal.entries(), ["sleeper cancelled"]);
            assert!(sleeper.is_cancelled());
            assert!(failing.is_failed());
            assert!(scope.task().is_failed());
            assert!(scope.task().failure().unwrap().ptr_eq(&failing.failure().unwrap()));
            // Only the root scope's failure is reported; the child's was propagated.
            assert_eq!(recorder.count(), 1);
        }
    }

    #[test]
    fn supervisor_isolates_failures() {
        let recorder = Recorder::new();
        let dispatcher = dispatcher(Discipline::Queued, &recorder);
        let scope = Scope::supervisor(&dispatcher);

        let failing = scope.launch(|_| async { Err(boom()) });
        let sleeper = scope.launch(|_| async {
            delay(Duration::from_secs(1)).await?;
            Ok(())
        });
        dispatcher.advance_until_idle();

        assert!(failing.is_failed());
        assert!(sleeper.is_completed());
        assert!(scope.is_active());
        assert_eq!(recorder.count(), 1);
        assert_eq!(recorder.failures()[0].to_string(), "boom");
    }

    #[test]
    fn launch_into_cancelled_scope_never_runs() {
        let dispatcher = Dispatcher::immediate();
        let scope = Scope::new(&dispatcher);
        scope.cancel();
        assert_eq!(scope.task().state(), TaskState::Cancelled);

        let journal = Journal::new();
        let j = journal.clone();
        let task = scope.launch(move |_| {
            j.push("producer called");
            async { Ok(()) }
        });
        assert!(task.is_cancelled());
        assert!(journal.is_empty());
        assert!(scope.task().children().is_empty());
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn immediate_cancellation_is_observed_before_cancel_returns() {
        let dispatcher = Dispatcher::immediate();
        let scope = Scope::new(&dispatcher);
        let journal = Journal::new();

        let j = journal.clone();
        let task = scope.launch(move |_| async move {
            let result = delay(Duration::from_secs(1)).await;
            j.push("observed");
            result?;
            Ok(())
        });
        assert!(journal.is_empty());
        task.cancel();
        journal.push("cancel returned");
        assert_eq!(journal.entries(), ["observed", "cancel returned"]);
        assert!(task.is_cancelled());
        assert!(scope.is_active());
    }

    #[test]
    fn nested_scope_waits_for_its_children() {
        let dispatcher = Dispatcher::queued();
        let journal = Journal::new();
        let j = journal.clone();
        let value = dispatcher
            .block_on(move |s| async move {
                let j2 = j.clone();
                let value = s
                    .scope(move |n| async move {
                        n.launch(move |_| async move {
                            delay(Duration::from_secs(5)).await?;
                            j2.push("child done");
                            Ok(())
                        });
                        Ok(42)
                    })
                    .await?;
                j.push("scope returned");
                Ok(value)
            })
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(journal.entries(), ["child done", "scope returned"]);
        assert_eq!(dispatcher.now(), Duration::from_secs(5));
    }

    #[test]
    fn nested_scope_rethrows_child_failure() {
        let recorder = Recorder::new();
        let dispatcher = dispatcher(Discipline::Queued, &recorder);
        let result = dispatcher.run_test(|s| async move {
            let nested = s
                .scope(|n| async move {
                    n.launch(|_| async {
                        delay(Duration::from_secs(1)).await?;
                        Err(boom())
                    });
                    delay(Duration::from_secs(10)).await?;
                    Ok("unreachable")
                })
                .await;
            let failure = nested.unwrap_err().failure().cloned().unwrap();
            Ok(failure.to_string())
        });
        assert_eq!(result.unwrap(), "boom");
        assert_eq!(dispatcher.now(), Duration::from_secs(1));
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn supervisor_scope_reports_launched_failures() {
        let dispatcher = Dispatcher::queued();
        let journal = Journal::new();
        let j = journal.clone();
        let result = dispatcher.run_test(move |s| async move {
            s.supervisor_scope(move |sup| async move {
                sup.launch(|_| async { Err(boom()) });
                sup.launch(move |_| async move {
                    yield_now().await?;
                    j.push("sibling survived");
                    Ok(())
                });
                Ok(())
            })
            .await
        });
        assert_eq!(result.unwrap_err().to_string(), "boom");
        assert_eq!(journal.entries(), ["sibling survived"]);
    }

    #[test]
    fn supervisor_scope_rethrows_its_own_failure() {
        let dispatcher = Dispatcher::queued();
        let result = dispatcher.block_on(|s| async move {
            let nested = s.supervisor_scope(|_| async { Err::<(), _>(boom()) }).await;
            Ok(nested.unwrap_err().is_failed())
        });
        assert!(result.unwrap());
    }

    #[test]
    fn nested_scope_observes_outer_cancellation() {
        for discipline in [Discipline::Queued, Discipline::Immediate] {
            let dispatcher = Dispatcher::builder().discipline(discipline).build();
            let scope = Scope::new(&dispatcher);
            let journal = Journal::new();

            let j = journal.clone();
            let outer = scope.launch(move |s| async move {
                let nested = s
                    .scope(|n| async move {
                        n.launch(|_| async {
                            delay(Duration::from_secs(10)).await?;
                            Ok(())
                        });
                        delay(Duration::from_secs(10)).await?;
                        Ok(())
                    })
                    .await;
                j.push(format!("{nested:?}"));
                nested
            });
            dispatcher.advance_time(Duration::from_secs(1));
            assert!(journal.is_empty());

            scope.cancel();
            dispatcher.run_until_idle();
            assert_eq!(journal.entries(), ["Err(Cancelled(Cancelled))"]);
            assert!(outer.is_cancelled());
            assert!(scope.task().is_cancelled());
        }
    }

    #[test]
    fn dropping_nested_future_cancels_it() {
        let dispatcher = Dispatcher::queued();
        let scope = Scope::new(&dispatcher);
        let nested = scope.scope(|n| async move {
            n.launch(|_| async {
                delay(Duration::from_secs(10)).await?;
                Ok(())
            });
            Ok(())
        });
        let task = nested.task().clone();
        assert!(task.is_active());
        drop(nested);
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(scope.is_active());
    }

    #[test]
    fn failure_after_dropping_nested_future_is_reported() {
        let recorder = Recorder::new();
        let dispatcher = dispatcher(Discipline::Queued, &recorder);
        let scope = Scope::new(&dispatcher);

        let mut nested = scope.scope(|n| async move {
            n.launch(|_| async {
                let _ = run_catching(async {
                    delay(Duration::from_secs(10)).await?;
                    Ok(())
                })
                .await;
                Err(boom())
            });
            delay(Duration::from_secs(10)).await?;
            Ok(())
        });
        assert!(crate::test::poll_once(&mut nested).is_pending());
        // Let the child reach its `run_catching` before the nested scope is cancelled.
        dispatcher.run_until_idle();
        let task = nested.task().clone();
        drop(nested);
        assert_eq!(task.state(), TaskState::Cancelling);

        dispatcher.advance_until_idle();
        assert!(task.is_failed());
        assert_eq!(recorder.count(), 1);
        assert!(recorder.failures()[0].ptr_eq(&task.failure().unwrap()));
        assert!(scope.is_active());
    }

    #[test]
    fn dropping_finished_nested_future_reports_nothing() {
        let recorder = Recorder::new();
        let dispatcher = dispatcher(Discipline::Queued, &recorder);
        let result = dispatcher.block_on(|s| async move {
            let nested = s.scope(|_| async { Err::<(), _>(boom()) }).await;
            Ok(nested.is_err())
        });
        assert!(result.unwrap());
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn nested_body_panic_fails_the_nested_scope() {
        let dispatcher = Dispatcher::queued();
        let result = dispatcher.block_on(|s| async move {
            let nested = s
                .scope::<(), _, _>(|_| async { panic!("nested went wrong") })
                .await;
            Ok::<_, Error>(nested.unwrap_err().failure().map(Failure::is_panic))
        });
        assert_eq!(result.unwrap(), Some(true));
    }

    #[test]
    fn scope_handler_takes_precedence() {
        let scoped = Recorder::new();
        let global = Recorder::new();
        let dispatcher = dispatcher(Discipline::Immediate, &global);
        let scope = Scope::builder()
            .name("workers")
            .policy(Policy::Supervisor)
            .on_uncaught(scoped.handler())
            .build(&dispatcher);
        assert_eq!(scope.task().name(), Some("workers"));

        scope.launch(|s| async move {
            s.launch(|_| async { Err(boom()) });
            Ok(())
        });
        let other = Scope::supervisor(&dispatcher);
        other.launch(|_| async { Err(boom()) });

        assert_eq!(scoped.count(), 1);
        assert_eq!(global.count(), 1);
    }

    #[test]
    fn root_outcome_is_returned() {
        let dispatcher = Dispatcher::immediate();
        assert_eq!(dispatcher.block_on(|_| async { Ok(3) }).unwrap(), 3);
        let err = dispatcher
            .block_on(|s| async move {
                s.cancel();
                yield_now().await?;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
