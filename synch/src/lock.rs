//! # Lock.
//!
//! A [`Lock`] can be held by at most one thread at a time. It is a semaphore
//! with an initial value of 1 plus an owner: only the thread that acquired the
//! lock may release it, and a thread must not acquire a lock it already
//! holds (locks are not recursive).
//!
//! Acquiring a held lock donates the caller's priority to the holder (see the
//! crate documentation), and releasing the lock returns the donations that
//! waiting for it produced.
//!
//! | state                | acquire by T        | release by holder          |
//! |----------------------|---------------------|----------------------------|
//! | free                 | held by T           | panic                      |
//! | held by H            | T donates and waits | wakes the most urgent one  |
//! | held by T            | panic               | free, or held by next      |

use crate::{donation, semaphore::Semaphore};
use kthread::{InterruptGuard, LockId, LockIdCell, Scheduler, Tid, WouldBlock};

/// A non-recursive lock with priority donation.
pub struct Lock {
    id: LockIdCell,
    semaphore: Semaphore,
}

impl Lock {
    /// Creates a new, free lock.
    pub const fn new() -> Self {
        Self {
            id: LockIdCell::new(),
            semaphore: Semaphore::new(1),
        }
    }

    /// Identity of this lock, as recorded in the thread table.
    pub fn id(&self) -> LockId {
        self.id.get()
    }

    /// Acquires the lock, sleeping until it becomes available.
    ///
    /// While the caller sleeps, its priority is donated to the holder.
    ///
    /// # Panics
    /// Panics if called from an interrupt handler, or if the caller already
    /// holds the lock.
    pub fn acquire<S: Scheduler>(&self, sched: &S) {
        assert!(
            !sched.in_interrupt_context(),
            "Try to acquire a lock inside an interrupt handler."
        );
        let me = sched.current();
        let mut guard = InterruptGuard::new(sched);
        assert_ne!(
            sched.threads().borrow(&guard).holder_of(self.id()),
            Some(me),
            "{} already holds the lock.",
            me
        );
        loop {
            // Another thread may have taken the lock between our wakeup and
            // our retry, so donate again on every attempt.
            let holder = sched.threads().borrow(&guard).holder_of(self.id());
            if let Some(holder) = holder {
                donation::donate(&mut sched.threads().borrow_mut(&guard), me, self.id(), holder);
            }
            if self.semaphore.down_or_sleep(sched, &mut guard) {
                break;
            }
        }
        let waiters = self.semaphore.waiters_with(&guard);
        let mut threads = sched.threads().borrow_mut(&guard);
        threads.record_mut(me).waiting_on = None;
        threads.set_holder(self.id(), Some(me));
        // Whoever is still queued now waits for us.
        donation::adopt(&mut threads, me, waiters);
    }

    /// Acquires the lock if it is free, without sleeping.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the lock is held, including by the caller.
    pub fn try_acquire<S: Scheduler>(&self, sched: &S) -> Result<(), WouldBlock> {
        let me = sched.current();
        let guard = InterruptGuard::new(sched);
        if sched.threads().borrow(&guard).holder_of(self.id()).is_some() {
            return Err(WouldBlock);
        }
        self.semaphore.try_down_with(&guard)?;
        let waiters = self.semaphore.waiters_with(&guard);
        let mut threads = sched.threads().borrow_mut(&guard);
        threads.set_holder(self.id(), Some(me));
        // The previous holder may have left contenders queued; they now wait for us.
        donation::adopt(&mut threads, me, waiters);
        Ok(())
    }

    /// Releases the lock and wakes up the most urgent waiter.
    ///
    /// The caller gives back the priority donated by the threads that waited
    /// for this lock, and yields if the woken thread is now more urgent.
    ///
    /// # Panics
    /// Panics if the caller does not hold the lock.
    pub fn release<S: Scheduler>(&self, sched: &S) {
        let me = sched.current();
        let mut guard = InterruptGuard::new(sched);
        {
            let mut threads = sched.threads().borrow_mut(&guard);
            assert_eq!(
                threads.holder_of(self.id()),
                Some(me),
                "Try to release a lock not held by {}.",
                me
            );
            donation::retract(&mut threads, me, self.id());
            threads.set_holder(self.id(), None);
        }
        self.semaphore.up_with(sched, &mut guard);
    }

    /// Returns `true` if the running thread holds the lock.
    pub fn held_by_current<S: Scheduler>(&self, sched: &S) -> bool {
        self.holder(sched) == Some(sched.current())
    }

    /// The thread holding the lock.
    ///
    /// The answer may be stale as soon as this returns, unless the caller is
    /// the holder.
    pub fn holder<S: Scheduler>(&self, sched: &S) -> Option<Tid> {
        let guard = InterruptGuard::new(sched);
        let holder = sched.threads().borrow(&guard).holder_of(self.id());
        holder
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}
