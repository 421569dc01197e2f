//! Executes task futures and drives virtual time.
//!
//! A [`Dispatcher`] owns every spawned task future, a FIFO run queue of task IDs, and a virtual
//! clock with a timer queue. Wakers push the ID of their task into the run queue; what happens
//! next depends on the [`Discipline`]:
//!
//! - [`Discipline::Immediate`] polls the woken task right away, on the call stack of whoever woke
//!   it. Spawning a task polls it before the spawning call returns, and cancelling a task lets it
//!   observe the cancellation before the cancelling call returns. Wake-ups that happen while this
//!   thread is already draining the run queue are only queued; the outermost drain runs them
//!   before it returns, so long chains of wake-ups never deepen the stack.
//! - [`Discipline::Queued`] only polls tasks when the owner drives the dispatcher with
//!   [`Dispatcher::run_until_idle`], [`Dispatcher::advance_time`] and friends.
//!
//! The discipline only changes *when* effects become visible, never which effects happen.

use std::{
    cell::RefCell,
    cmp::Ordering as CmpOrdering,
    collections::{BinaryHeap, HashMap},
    fmt,
    future::Future,
    mem,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    task::{Context, Poll, Wake, Waker},
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    context,
    error::{Error, Failure},
    scope,
    sync::Mutex,
    task::{Task, TaskId},
};

/// A callback receiving failures that no resolver, parent scope or blocking caller will ever see.
///
/// Handlers must not panic; if one does, the panic is caught and logged.
pub type UncaughtHandler = Arc<dyn Fn(TaskId, &Failure) + Send + Sync + 'static>;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// When a woken task gets polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Discipline {
    /// Poll woken tasks synchronously, before the waking call returns.
    Immediate,
    /// Queue woken tasks until the dispatcher is driven.
    #[default]
    Queued,
}

/// How advancing the dispatcher's clock relates to real time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Clock {
    /// Time only moves when the dispatcher is driven, and moving it is free.
    #[default]
    Virtual,
    /// Advancing time puts the driving thread to sleep for the same duration.
    Wall,
}

/// A builder object that can be used to configure a [`Dispatcher`].
#[derive(Clone, Default)]
pub struct DispatcherBuilder {
    name: Option<String>,
    discipline: Discipline,
    clock: Clock,
    handler: Option<UncaughtHandler>,
}

impl DispatcherBuilder {
    /// Sets the name of the [`Dispatcher`], used in log messages.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the execution discipline. Defaults to [`Discipline::Queued`].
    #[inline]
    pub fn discipline(self, discipline: Discipline) -> Self {
        Self { discipline, ..self }
    }

    /// Sets the clock. Defaults to [`Clock::Virtual`].
    #[inline]
    pub fn clock(self, clock: Clock) -> Self {
        Self { clock, ..self }
    }

    /// Sets the dispatcher-wide uncaught-failure handler.
    ///
    /// Scopes can install their own handler with [`ScopeBuilder::on_uncaught`], which takes
    /// precedence for every task in that scope's tree. Without any handler, uncaught failures are
    /// logged at error level.
    ///
    /// [`ScopeBuilder::on_uncaught`]: crate::ScopeBuilder::on_uncaught
    pub fn on_uncaught<F>(self, handler: F) -> Self
    where
        F: Fn(TaskId, &Failure) + Send + Sync + 'static,
    {
        Self {
            handler: Some(Arc::new(handler)),
            ..self
        }
    }

    pub fn build(self) -> Dispatcher {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Dispatcher(Arc::new(Shared {
            name: self.name,
            discipline: self.discipline,
            clock: self.clock,
            handler: self.handler,
            sender,
            receiver,
            slots: Mutex::new(HashMap::new()),
            timers: Mutex::new(Timers {
                now: Duration::ZERO,
                next_seq: 0,
                heap: BinaryHeap::new(),
            }),
        }))
    }
}

/// A handle to a task dispatcher.
///
/// Cloning a [`Dispatcher`] yields another handle to the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher(Arc<Shared>);

struct Shared {
    name: Option<String>,
    discipline: Discipline,
    clock: Clock,
    handler: Option<UncaughtHandler>,
    /// The run queue. Wakers send task IDs, the driving thread receives them.
    sender: Sender<TaskId>,
    receiver: Receiver<TaskId>,
    slots: Mutex<HashMap<TaskId, Slot>>,
    timers: Mutex<Timers>,
}

struct Slot {
    task: Task,
    /// `None` while the future is being polled further up the stack.
    future: Option<BoxFuture>,
    /// Set when the task is woken while its future is being polled.
    notified: bool,
}

struct Timers {
    now: Duration,
    next_seq: u64,
    heap: BinaryHeap<TimerEntry>,
}

/// A pending wake-up at a virtual deadline.
struct TimerEntry {
    deadline: Duration,
    /// Registration order; breaks ties between equal deadlines so that they fire FIFO.
    seq: u64,
    waker: Waker,
    /// Set by the owning [`Delay`][crate::time::Delay] when it is dropped.
    cancelled: Arc<AtomicBool>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    // Reversed, so that the `BinaryHeap` pops the earliest entry first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.deadline, other.seq).cmp(&(self.deadline, self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

thread_local! {
    /// Dispatchers whose run queue is being drained further up this thread's stack.
    static DRAINING: RefCell<Vec<*const Shared>> = const { RefCell::new(Vec::new()) };
}

/// Marks a dispatcher as draining on this thread until dropped.
struct Draining(*const Shared);

impl Draining {
    fn enter(shared: &Arc<Shared>) -> Self {
        let ptr = Arc::as_ptr(shared);
        DRAINING.with(|draining| draining.borrow_mut().push(ptr));
        Self(ptr)
    }

    fn is_active(shared: &Arc<Shared>) -> bool {
        let ptr = Arc::as_ptr(shared);
        DRAINING.with(|draining| draining.borrow().contains(&ptr))
    }
}

impl Drop for Draining {
    fn drop(&mut self) {
        DRAINING.with(|draining| {
            let mut draining = draining.borrow_mut();
            if let Some(pos) = draining.iter().rposition(|ptr| *ptr == self.0) {
                draining.remove(pos);
            }
        });
    }
}

struct TaskWaker {
    id: TaskId,
    dispatcher: Weak<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if let Some(shared) = self.dispatcher.upgrade() {
            Dispatcher(shared).schedule(self.id);
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Dispatcher::builder().build()
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("name", &self.0.name)
            .field("discipline", &self.0.discipline)
            .field("clock", &self.0.clock)
            .field("now", &self.now())
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Returns a builder that can be used to configure a [`Dispatcher`].
    #[inline]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Creates a virtual-time dispatcher using [`Discipline::Immediate`].
    pub fn immediate() -> Self {
        Self::builder().discipline(Discipline::Immediate).build()
    }

    /// Creates a virtual-time dispatcher using [`Discipline::Queued`].
    pub fn queued() -> Self {
        Self::builder().discipline(Discipline::Queued).build()
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    #[inline]
    pub fn discipline(&self) -> Discipline {
        self.0.discipline
    }

    #[inline]
    pub fn clock(&self) -> Clock {
        self.0.clock
    }

    /// Returns the current time of the dispatcher's clock, measured from its creation.
    pub fn now(&self) -> Duration {
        self.0.timers.lock().now
    }

    /// Returns `true` if no task is currently waiting in the run queue.
    ///
    /// Tasks waiting for a timer do not count; see [`Dispatcher::next_deadline`].
    pub fn is_idle(&self) -> bool {
        self.0.receiver.is_empty()
    }

    /// Returns the earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Duration> {
        let mut timers = self.0.timers.lock();
        while let Some(entry) = timers.heap.peek() {
            if !entry.cancelled.load(Ordering::Acquire) {
                return Some(entry.deadline);
            }
            timers.heap.pop();
        }
        None
    }

    /// Polls queued tasks until the run queue is empty, without advancing time.
    ///
    /// Returns the number of tasks that were polled.
    pub fn run_until_idle(&self) -> usize {
        let _draining = Draining::enter(&self.0);
        let mut polled = 0;
        while let Ok(id) = self.0.receiver.try_recv() {
            if self.poll_task(id) {
                polled += 1;
            }
        }
        polled
    }

    /// Advances the clock by `duration`.
    ///
    /// Every timer whose deadline falls within the advanced interval fires in deadline order
    /// (registration order among equal deadlines), and all work made runnable at one deadline runs
    /// to quiescence before the clock moves on to the next.
    pub fn advance_time(&self, duration: Duration) {
        let target = self.now() + duration;
        self.run_until_idle();
        while let Some(deadline) = self.next_deadline().filter(|deadline| *deadline <= target) {
            self.advance_to(deadline);
        }
        self.advance_to(target);
    }

    /// Keeps firing timers until none are left and the run queue is empty.
    pub fn advance_until_idle(&self) {
        self.run_until_idle();
        while let Some(deadline) = self.next_deadline() {
            self.advance_to(deadline);
        }
    }

    /// Runs `f` in a fresh root scope and drives the dispatcher until that scope has finished.
    ///
    /// Virtual time is advanced automatically whenever nothing is runnable (with a
    /// [`Clock::Wall`], the calling thread sleeps instead). The root scope is joined by this call:
    /// if it fails, the failure is returned here rather than reported as uncaught. Work that is
    /// not part of the root scope's tree (for example tasks in a separately created [`Scope`])
    /// only runs while the root scope is still running.
    ///
    /// # Panics
    ///
    /// Panics if the root scope is suspended while no task is runnable and no timer is pending,
    /// since it could never finish.
    ///
    /// [`Scope`]: crate::Scope
    pub fn block_on<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(crate::Scope) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (task, value) = scope::spawn_root(self, None, f);
        self.drive(&task);
        scope::take_root_outcome(&task, &value)
    }

    /// Like [`Dispatcher::block_on`], but failures reported as uncaught anywhere in the root
    /// scope's tree also make this call fail.
    ///
    /// This mirrors a test harness that must not let a failure slip by silently: a failed task
    /// in a supervisor scope inside the root is returned as an error, even though it did not fail
    /// the root scope itself. After the root scope has finished, remaining runnable work is
    /// executed (without advancing time), so that unrelated scopes on the same dispatcher get to
    /// report their failures to their own handlers.
    pub fn run_test<T, F, Fut>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(crate::Scope) -> Fut,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let uncaught = Arc::new(Mutex::new(Vec::<Failure>::new()));
        let sink = uncaught.clone();
        let handler: UncaughtHandler = Arc::new(move |id: TaskId, failure: &Failure| {
            log::debug!("test scope caught uncaught failure of task {id}: {failure}");
            sink.lock().push(failure.clone());
        });

        let (task, value) = scope::spawn_root(self, Some(handler), f);
        self.drive(&task);
        self.run_until_idle();

        let outcome = scope::take_root_outcome(&task, &value);
        let first_uncaught = uncaught.lock().first().cloned();
        match (outcome, first_uncaught) {
            (Ok(_), Some(failure)) => Err(Error::Failed(failure)),
            (outcome, _) => outcome,
        }
    }

    fn drive(&self, root: &Task) {
        loop {
            self.run_until_idle();
            if root.is_terminal() {
                return;
            }
            match self.next_deadline() {
                Some(deadline) => self.advance_to(deadline),
                None => panic!(
                    "root task {} is suspended, but no task is runnable and no timer is pending",
                    root.id()
                ),
            }
        }
    }

    fn advance_to(&self, target: Duration) {
        let elapsed = target.saturating_sub(self.now());
        if self.0.clock == Clock::Wall && !elapsed.is_zero() {
            thread::sleep(elapsed);
        }

        let due = {
            let mut timers = self.0.timers.lock();
            if target > timers.now {
                timers.now = target;
            }
            let mut due = Vec::new();
            while timers.heap.peek().map_or(false, |e| e.deadline <= target) {
                if let Some(entry) = timers.heap.pop() {
                    if !entry.cancelled.load(Ordering::Acquire) {
                        due.push(entry.waker);
                    }
                }
            }
            due
        };

        log::trace!("{self:?}: advanced to {target:?}, {} timer(s) due", due.len());
        due.into_iter().for_each(Waker::wake);
        self.run_until_idle();
    }

    pub(crate) fn register_timer(&self, deadline: Duration, waker: Waker, cancelled: Arc<AtomicBool>) {
        let mut timers = self.0.timers.lock();
        let seq = timers.next_seq;
        timers.next_seq += 1;
        log::trace!("timer {seq} registered for {deadline:?}");
        timers.heap.push(TimerEntry {
            deadline,
            seq,
            waker,
            cancelled,
        });
    }

    /// Hands a task's future to the dispatcher. The task is not polled until it is scheduled.
    pub(crate) fn spawn(&self, task: Task, future: BoxFuture) {
        let id = task.id();
        self.0.slots.lock().insert(
            id,
            Slot {
                task,
                future: Some(future),
                notified: false,
            },
        );
    }

    /// Puts a task into the run queue (and, under [`Discipline::Immediate`], polls it unless a
    /// drain further up this thread's stack will).
    ///
    /// Scheduling a task that has already finished is a no-op.
    pub(crate) fn schedule(&self, id: TaskId) {
        // The receiver lives as long as the sender, so this cannot fail.
        self.0.sender.send(id).ok();
        if self.0.discipline == Discipline::Immediate && !Draining::is_active(&self.0) {
            self.run_until_idle();
        }
    }

    /// Polls the future of task `id` once. Returns `false` if there was nothing to poll.
    fn poll_task(&self, id: TaskId) -> bool {
        let (task, mut future) = {
            let mut slots = self.0.slots.lock();
            let Some(slot) = slots.get_mut(&id) else {
                return false;
            };
            match slot.future.take() {
                Some(future) => (slot.task.clone(), future),
                None => {
                    slot.notified = true;
                    return false;
                }
            }
        };

        let waker = Waker::from(Arc::new(TaskWaker {
            id,
            dispatcher: Arc::downgrade(&self.0),
        }));
        let mut cx = Context::from_waker(&waker);
        let poll = {
            let _entered = context::enter(task);
            future.as_mut().poll(&mut cx)
        };

        let mut slots = self.0.slots.lock();
        match poll {
            Poll::Ready(()) => {
                let slot = slots.remove(&id);
                drop(slots);
                // Dropping the finished future may run arbitrary destructors.
                drop(future);
                drop(slot);
            }
            Poll::Pending => {
                if let Some(slot) = slots.get_mut(&id) {
                    slot.future = Some(future);
                    if mem::take(&mut slot.notified) {
                        self.0.sender.send(id).ok();
                    }
                }
            }
        }
        true
    }

    /// Delivers a failure nobody else will see to the appropriate handler.
    pub(crate) fn report_uncaught(&self, scoped: Option<&UncaughtHandler>, id: TaskId, failure: &Failure) {
        match scoped.or(self.0.handler.as_ref()) {
            Some(handler) => {
                if panic::catch_unwind(AssertUnwindSafe(|| handler(id, failure))).is_err() {
                    log::warn!("uncaught-failure handler panicked while handling task {id}: {failure}");
                }
            }
            None => log::error!("uncaught failure in task {id}: {failure}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        delay,
        test::{boom, Journal, Recorder},
        yield_now, Scope, Start, TaskState,
    };

    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn dispatcher_is_send_sync() {
        assert_send_sync::<Dispatcher>();
    }

    #[test]
    fn queued_waits_for_driver() {
        let dispatcher = Dispatcher::queued();
        let scope = Scope::new(&dispatcher);
        let journal = Journal::new();

        let j = journal.clone();
        let task = scope.launch(move |_| async move {
            j.push("ran");
            Ok(())
        });
        assert!(journal.is_empty());
        assert!(!dispatcher.is_idle());
        assert_eq!(task.state(), TaskState::Active);

        assert_eq!(dispatcher.run_until_idle(), 1);
        assert_eq!(journal.entries(), ["ran"]);
        assert_eq!(task.state(), TaskState::Completed);
        assert!(dispatcher.is_idle());
    }

    #[test]
    fn immediate_runs_before_launch_returns() {
        let dispatcher = Dispatcher::immediate();
        let scope = Scope::new(&dispatcher);
        let journal = Journal::new();

        let j = journal.clone();
        let task = scope.launch(move |_| async move {
            j.push("ran");
            Ok(())
        });
        journal.push("launched");
        assert_eq!(journal.entries(), ["ran", "launched"]);
        assert!(task.is_completed());
    }

    #[test]
    fn immediate_wake_chains_run_iteratively() {
        let dispatcher = Dispatcher::immediate();
        let scope = Scope::supervisor(&dispatcher);

        let mut last = scope.start_deferred(Start::Eager, |_| async {
            delay(Duration::from_secs(1)).await?;
            Ok(0u32)
        });
        for _ in 0..10_000 {
            let prev = last;
            last = scope.start_deferred(Start::Eager, move |_| async move {
                Ok(prev.resolve().await? + 1)
            });
        }
        assert_eq!(last.state(), Some(TaskState::Active));

        dispatcher.advance_time(Duration::from_secs(1));
        assert!(last.is_completed());
        assert!(dispatcher.is_idle());
        let value = dispatcher.block_on(move |_| async move { last.resolve().await });
        assert_eq!(value.unwrap(), 10_000);
    }

    #[test]
    fn immediate_defers_wakes_raised_inside_a_task() {
        let dispatcher = Dispatcher::immediate();
        let scope = Scope::new(&dispatcher);
        let journal = Journal::new();

        let j = journal.clone();
        scope.launch(move |s| async move {
            let j2 = j.clone();
            s.launch(move |_| async move {
                j2.push("child");
                Ok(())
            });
            j.push("parent");
            Ok(())
        });
        journal.push("launched");
        assert_eq!(journal.entries(), ["parent", "child", "launched"]);
    }

    #[test]
    fn timers_fire_in_deadline_then_registration_order() {
        let dispatcher = Dispatcher::queued();
        let scope = Scope::new(&dispatcher);
        let journal = Journal::new();

        for (name, ms) in [("c", 30), ("a", 10), ("b1", 20), ("b2", 20)] {
            let j = journal.clone();
            scope.launch(move |_| async move {
                delay(Duration::from_millis(ms)).await?;
                j.push(name);
                Ok(())
            });
        }

        dispatcher.run_until_idle();
        assert_eq!(dispatcher.next_deadline(), Some(Duration::from_millis(10)));

        dispatcher.advance_time(Duration::from_millis(20));
        assert_eq!(journal.entries(), ["a", "b1", "b2"]);
        assert_eq!(dispatcher.now(), Duration::from_millis(20));

        dispatcher.advance_time(Duration::from_millis(5));
        assert_eq!(journal.entries(), ["a", "b1", "b2"]);

        dispatcher.advance_until_idle();
        assert_eq!(journal.entries(), ["a", "b1", "b2", "c"]);
        assert_eq!(dispatcher.now(), Duration::from_millis(30));
        assert_eq!(dispatcher.next_deadline(), None);
    }

    #[test]
    fn work_at_one_deadline_quiesces_before_the_next() {
        let dispatcher = Dispatcher::queued();
        let scope = Scope::new(&dispatcher);
        let journal = Journal::new();

        let j = journal.clone();
        scope.launch(move |s| async move {
            delay(Duration::from_millis(10)).await?;
            let j2 = j.clone();
            s.launch(move |_| async move {
                yield_now().await?;
                j2.push("spawned at 10ms");
                Ok(())
            });
            j.push("woke at 10ms");
            Ok(())
        });
        let j = journal.clone();
        scope.launch(move |_| async move {
            delay(Duration::from_millis(11)).await?;
            j.push("woke at 11ms");
            Ok(())
        });

        dispatcher.advance_time(Duration::from_millis(11));
        assert_eq!(
            journal.entries(),
            ["woke at 10ms", "spawned at 10ms", "woke at 11ms"]
        );
    }

    #[test]
    fn block_on_advances_virtual_time() {
        let dispatcher = Dispatcher::queued();
        let value = dispatcher.block_on(|_| async {
            delay(Duration::from_secs(3600)).await?;
            Ok(7)
        });
        assert_eq!(value.unwrap(), 7);
        assert_eq!(dispatcher.now(), Duration::from_secs(3600));
    }

    #[test]
    fn block_on_returns_root_failure_without_reporting() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::builder()
            .on_uncaught(recorder.handler())
            .build();
        let err = dispatcher
            .block_on(|_| async { Err::<(), _>(boom()) })
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(recorder.count(), 0);
    }

    #[test]
    fn wall_clock_sleeps() {
        let dispatcher = Dispatcher::builder().clock(Clock::Wall).build();
        let start = std::time::Instant::now();
        dispatcher
            .block_on(|_| async {
                delay(Duration::from_millis(20)).await?;
                Ok(())
            })
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert_eq!(dispatcher.now(), Duration::from_millis(20));
    }

    #[test]
    #[should_panic(expected = "no timer is pending")]
    fn block_on_detects_stall() {
        let dispatcher = Dispatcher::queued();
        let other = Scope::new(&dispatcher);
        dispatcher
            .block_on(move |_| async move {
                let forever = other.launch(|_| std::future::pending::<Result<(), Error>>());
                forever.join().await?;
                Ok(())
            })
            .ok();
    }

    #[test]
    fn panicking_handler_is_contained() {
        let dispatcher = Dispatcher::builder()
            .on_uncaught(|_, _| panic!("handler bug"))
            .build();
        let scope = Scope::new(&dispatcher);
        scope.launch(|_| async { Err(boom()) });
        dispatcher.run_until_idle();
        assert_eq!(scope.task().state(), TaskState::Failed);
    }
}
