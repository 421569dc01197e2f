//! A [`std::sync::Mutex`] that does not poison itself.
//!
//! Task bodies are allowed to panic: the runtime catches the panic and turns it into a failure
//! of the task, which is then propagated through the task tree like any other failure. If the
//! runtime's own bookkeeping used poisoning locks, a panic that unwinds while a lock is held
//! would make every subsequent lock attempt fail, and the propagation machinery would tear
//! itself down instead of reporting the root cause.
//!
//! All runtime state in this crate is guarded by this [`Mutex`] instead.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync,
};

#[derive(Default)]
pub(crate) struct Mutex<T: ?Sized> {
    inner: sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub(crate) const fn new(t: T) -> Mutex<T> {
        Self {
            inner: sync::Mutex::new(t),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        MutexGuard { inner: guard }
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(MutexGuard { inner: guard }),
            Err(sync::TryLockError::Poisoned(poison)) => Some(MutexGuard {
                inner: poison.into_inner(),
            }),
            Err(sync::TryLockError::WouldBlock) => None,
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Mutex");
        match self.try_lock() {
            Some(val) => s.field("data", &&*val),
            None => s.field("data", &"<locked>"),
        }
        .finish_non_exhaustive()
    }
}

pub(crate) struct MutexGuard<'a, T: ?Sized + 'a> {
    inner: sync::MutexGuard<'a, T>,
}

impl<'a, T: ?Sized + 'a> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<'a, T: ?Sized + 'a> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}
