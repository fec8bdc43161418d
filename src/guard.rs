//! Concurrency guard around the single owned connection.
//!
//! SQLite connections are `Send` but not `Sync`, so readers cannot share one
//! either: every logical caller (producers, poll ticks, queries, close) takes
//! the same exclusive lock. The commit-hook path never comes through here; it
//! runs inside a caller that already holds the lock.
//!
//! The guard remembers which thread holds it. A second request from that
//! same thread (a commit-hook handler calling back into its queue) fails
//! with [`Error::Reentrant`] instead of deadlocking on the mutex.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};
use crate::storage::Storage;

#[derive(Clone)]
pub struct ConnectionGuard {
    storage: Arc<Mutex<Option<Storage>>>,
    holder: Arc<Mutex<Option<ThreadId>>>,
}

/// Clears the recorded holder on drop.
struct Held<'a>(&'a Mutex<Option<ThreadId>>);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl ConnectionGuard {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage: Arc::new(Mutex::new(Some(storage))),
            holder: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `f` while holding the connection.
    ///
    /// The lock is released on every exit path. A panic inside `f` poisons
    /// the mutex; the next caller takes it over anyway, since a panicked
    /// statement leaves SQLite itself consistent.
    pub fn with<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Storage) -> Result<T>,
    {
        self.ensure_not_held()?;
        let mut slot = self.lock();
        let storage = slot.as_mut().ok_or(Error::Closed)?;
        let _held = self.hold();
        f(storage)
    }

    /// Release the connection. Later calls to [`ConnectionGuard::with`] fail
    /// with [`Error::Closed`]. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.ensure_not_held()?;
        let storage = self.lock().take();
        match storage {
            Some(storage) => storage.close(),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        // The holding thread knows the connection is open.
        if self.held_by_current_thread() {
            return false;
        }
        self.lock().is_none()
    }

    fn held_by_current_thread(&self) -> bool {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) == Some(thread::current().id())
    }

    fn ensure_not_held(&self) -> Result<()> {
        if self.held_by_current_thread() {
            return Err(Error::Reentrant);
        }
        Ok(())
    }

    fn hold(&self) -> Held<'_> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = Some(thread::current().id());
        Held(&self.holder)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Storage>> {
        self.storage.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::State;

    #[test]
    fn with_releases_after_errors_and_panics() {
        let guard = ConnectionGuard::new(Storage::in_memory().unwrap());

        let err = guard
            .with(|_| -> Result<()> { Err(Error::Other("nope".into())) })
            .unwrap_err();
        assert!(matches!(err, Error::Other(_)));

        let cloned = guard.clone();
        let panicked = std::thread::spawn(move || {
            cloned.with(|_| -> Result<()> { panic!("inside guard") })
        })
        .join();
        assert!(panicked.is_err());

        let id = guard
            .with(|s| s.insert_job("PingMsg", b"{}"))
            .unwrap();
        let state = guard.with(|s| s.get_job(id)).unwrap().state;
        assert_eq!(state, State::Enqueued);
    }

    #[test]
    fn closed_guard_refuses_access() {
        let guard = ConnectionGuard::new(Storage::in_memory().unwrap());
        guard.close().unwrap();
        assert!(guard.is_closed());
        assert!(matches!(guard.with(|s| s.list_all()), Err(Error::Closed)));
        guard.close().unwrap();
    }

    #[test]
    fn nested_use_on_the_holding_thread_fails_fast() {
        let guard = ConnectionGuard::new(Storage::in_memory().unwrap());

        let inner = guard
            .with(|_| {
                assert!(!guard.is_closed());
                assert!(matches!(guard.close(), Err(Error::Reentrant)));
                Ok(guard.with(|s| s.list_all()))
            })
            .unwrap();
        assert!(matches!(inner, Err(Error::Reentrant)));

        // Released again, and usable from any thread.
        assert!(guard.with(|s| s.list_all()).unwrap().is_empty());
        let other = guard.clone();
        std::thread::spawn(move || other.with(|s| s.list_all()).map(|jobs| jobs.len()))
            .join()
            .unwrap()
            .unwrap();
    }
}
