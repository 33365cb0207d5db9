//! # Mutex.
//!
//! A [`Mutex`] is a [`Lock`] that owns the data it protects. The data can only
//! be reached through the [`MutexGuard`] returned by [`Mutex::lock`] or
//! [`Mutex::try_lock`], so it is only ever accessed with the lock held.
//! Because it is built on [`Lock`], a thread waiting for a mutex donates its
//! priority to the holder.
//!
//! The guard does **not** unlock on drop. It must be released explicitly with
//! [`MutexGuard::unlock`], and dropping it without doing so panics: releasing a
//! lock may switch to another thread, which is not something a destructor
//! should do behind the caller's back.

use crate::lock::Lock;
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use kthread::{Scheduler, WouldBlock};

/// A mutual exclusion primitive useful for protecting shared data.
///
/// # Examples
///
/// ```rust,ignore
/// let data = Mutex::new(0);
///
/// let mut guard = data.lock(sched);
/// *guard += 1;
/// // The lock must be "explicitly" unlocked.
/// guard.unlock();
/// ```
pub struct Mutex<T> {
    lock: Lock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    pub const fn new(t: T) -> Mutex<T> {
        Mutex {
            lock: Lock::new(),
            data: UnsafeCell::new(t),
        }
    }

    /// Acquires the mutex, sleeping until it is able to do so.
    ///
    /// # Panics
    /// Panics if the caller already holds the mutex.
    pub fn lock<'a, S: Scheduler>(&'a self, sched: &'a S) -> MutexGuard<'a, T, S> {
        self.lock.acquire(sched);
        MutexGuard::new(self, sched)
    }

    /// Attempts to acquire the mutex without sleeping.
    ///
    /// # Errors
    /// If the mutex could not be acquired because it is already locked, then
    /// this call will return the [`WouldBlock`] error.
    pub fn try_lock<'a, S: Scheduler>(
        &'a self,
        sched: &'a S,
    ) -> Result<MutexGuard<'a, T, S>, WouldBlock> {
        self.lock.try_acquire(sched)?;
        Ok(MutexGuard::new(self, sched))
    }

    /// The lock underneath this mutex.
    pub fn raw(&self) -> &Lock {
        &self.lock
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    /// Creates a `Mutex<T>`, with the `Default` value for T.
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

/// An implementation of a "scoped lock" of a mutex. When this structure
/// is dropped (falls out of scope) without unlocking, the panic occurs.
///
/// The lock must be explicitly unlocked by [`unlock`] method.
///
/// [`unlock`]: MutexGuard::unlock
pub struct MutexGuard<'a, T, S: Scheduler> {
    pub(crate) mutex: &'a Mutex<T>,
    pub(crate) sched: &'a S,
    _not_send: PhantomData<*mut ()>,
}

impl<'a, T, S: Scheduler> MutexGuard<'a, T, S> {
    fn new(mutex: &'a Mutex<T>, sched: &'a S) -> Self {
        Self {
            mutex,
            sched,
            _not_send: PhantomData,
        }
    }

    /// Releases the underlying [`Mutex`].
    ///
    /// The caller may be preempted before this returns, if releasing the
    /// mutex wakes up a more urgent thread.
    pub fn unlock(self) {
        self.mutex.lock.release(self.sched);
        core::mem::forget(self);
    }
}

impl<T, S: Scheduler> Deref for MutexGuard<'_, T, S> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T, S: Scheduler> DerefMut for MutexGuard<'_, T, S> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T, S: Scheduler> Drop for MutexGuard<'_, T, S> {
    fn drop(&mut self) {
        panic!("`.unlock()` must be explicitly called for MutexGuard.");
    }
}
