//! Failure and cancellation values.
//!
//! Task bodies return `Result<T, Error>`. An [`Error`] is one of two fundamentally different
//! things:
//!
//! - [`Error::Failed`] carries a [`Failure`], an application error raised by user code. A task
//!   whose body returns a failure is *Failed*, and the failure is propagated along the task tree
//!   according to the owning scope's [`Policy`][crate::Policy].
//! - [`Error::Cancelled`] means the task was asked to stop. It is never propagated as a failure;
//!   a task whose body returns it simply ends up *Cancelled*.
//!
//! Keeping these apart is the whole point: code that handles failures (like [`catch`]) must not
//! accidentally "handle" a cancellation and keep running.
//!
//! [`catch`]: crate::catch

use std::{any::Any, error::Error as StdError, fmt, sync::Arc};

/// The error type returned by task bodies, [`Deferred::resolve`] and the nested scope
/// constructs.
///
/// [`Deferred::resolve`]: crate::Deferred::resolve
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// An application failure.
    #[error(transparent)]
    Failed(Failure),
    /// The task observed a cancellation request.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl Error {
    /// Creates an [`Error::Failed`] from a message.
    pub fn msg<M: fmt::Display>(message: M) -> Self {
        Error::Failed(Failure::msg(message))
    }

    /// Creates an [`Error::Failed`] wrapping an arbitrary error value.
    pub fn failed<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Error::Failed(Failure::new(error))
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled(_))
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        matches!(self, Error::Failed(_))
    }

    /// Returns the [`Failure`] if this is an [`Error::Failed`].
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Error::Failed(failure) => Some(failure),
            Error::Cancelled(_) => None,
        }
    }
}

impl From<Failure> for Error {
    fn from(failure: Failure) -> Self {
        Error::Failed(failure)
    }
}

/// The cancellation error.
///
/// Returned by every suspension point ([`delay`], [`yield_now`], [`Deferred::resolve`],
/// [`Task::join`]) once the task that polls it has been asked to cancel, and by
/// [`Deferred::resolve`] when the resolved task itself was cancelled.
///
/// [`delay`]: crate::delay
/// [`yield_now`]: crate::yield_now
/// [`Deferred::resolve`]: crate::Deferred::resolve
/// [`Task::join`]: crate::Task::join
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task was cancelled")]
pub struct Cancelled;

/// An application failure.
///
/// Cloning a [`Failure`] is cheap and preserves its identity: when a failure is propagated from a
/// child task to its scope, the scope fails with the *same* [`Failure`], which can be checked with
/// [`Failure::ptr_eq`].
#[derive(Clone)]
pub struct Failure(Arc<dyn StdError + Send + Sync + 'static>);

impl Failure {
    pub fn new<E: StdError + Send + Sync + 'static>(error: E) -> Self {
        Self(Arc::new(error))
    }

    pub fn msg<M: fmt::Display>(message: M) -> Self {
        Self::new(Message(message.to_string()))
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::new(Panicked { message })
    }

    /// Returns whether `self` and `other` originate from the same raised error.
    #[inline]
    pub fn ptr_eq(&self, other: &Failure) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns whether this failure was produced by a panicking task body.
    pub fn is_panic(&self) -> bool {
        self.downcast_ref::<Panicked>().is_some()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let inner: &(dyn StdError + 'static) = &*self.0;
        inner.downcast_ref::<E>()
    }

    /// Returns the wrapped error.
    pub fn get(&self) -> &(dyn StdError + Send + Sync + 'static) {
        &*self.0
    }
}

impl fmt::Debug for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Failure").field(&self.0).finish()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StdError for Failure {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

/// The error wrapped by a [`Failure`] created from a panicking task body.
#[derive(Debug, thiserror::Error)]
#[error("task panicked: {message}")]
pub struct Panicked {
    message: String,
}

impl Panicked {
    pub fn message(&self) -> &str {
        &self.message
    }
}
