//! # Condition Variable.
//!
//! A **condition variable** lets a thread sleep until some condition over
//! shared data holds, without burning CPU. It is always used together with
//! the [`Lock`] that guards the data:
//!
//! ```rust,ignore
//! lock.acquire(sched);
//! while !condition() {
//!     condvar.wait(sched, &lock);
//! }
//! // The condition holds and the lock is held.
//! lock.release(sched);
//! ```
//!
//! [`ConditionVariable::wait`] atomically releases the lock and sleeps; it
//! re-acquires the lock before returning. Signaling does not hand the lock
//! over (Mesa semantics): between the signal and the wakeup, other threads
//! may run and change the data again, so the condition must be re-checked in a
//! loop. [`ConditionVariable::wait_while`] does exactly that on a [`Mutex`].
//!
//! Each waiter sleeps on its own single-use semaphore. [`signal`] wakes the
//! waiter with the highest current priority, and [`broadcast`] wakes all of
//! them, most urgent first.
//!
//! [`signal`]: ConditionVariable::signal
//! [`broadcast`]: ConditionVariable::broadcast

use crate::{
    lock::Lock,
    mutex::{Mutex, MutexGuard},
    semaphore::Semaphore,
};
use alloc::{sync::Arc, vec::Vec};
use core::cmp::Reverse;
use kthread::{InterruptGuard, IrqCell, Scheduler, Tid};
use log::trace;

struct Waiter {
    owner: Tid,
    semaphore: Arc<Semaphore>,
}

/// A Condition Variable
///
/// Condition variables represent the ability to block a thread such that it
/// consumes no CPU time while waiting for an event to occur. A condition
/// variable must always be used with the same lock.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: IrqCell<Vec<Waiter>>,
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            waiters: IrqCell::new(Vec::new()),
        }
    }

    /// Releases `lock`, sleeps until signaled, and re-acquires `lock`.
    ///
    /// The condition the caller waits for may be false again when this
    /// returns.
    ///
    /// # Panics
    /// Panics if called from an interrupt handler, or if the caller does not
    /// hold `lock`.
    pub fn wait<S: Scheduler>(&self, sched: &S, lock: &Lock) {
        assert!(
            !sched.in_interrupt_context(),
            "Try to wait on a condition variable inside an interrupt handler."
        );
        assert!(
            lock.held_by_current(sched),
            "Try to wait on a condition variable without holding its lock."
        );
        let me = sched.current();
        let semaphore = Arc::new(Semaphore::new(0));
        {
            let guard = InterruptGuard::new(sched);
            let threads = sched.threads().borrow(&guard);
            let mine = threads.priority(me);
            let mut waiters = self.waiters.borrow_mut(&guard);
            let pos = waiters
                .iter()
                .position(|waiter| threads.priority(waiter.owner) < mine)
                .unwrap_or(waiters.len());
            waiters.insert(
                pos,
                Waiter {
                    owner: me,
                    semaphore: semaphore.clone(),
                },
            );
        }
        lock.release(sched);
        semaphore.down(sched);
        lock.acquire(sched);
    }

    /// Wakes up the most urgent thread waiting on this condition variable, if
    /// any.
    ///
    /// # Panics
    /// Panics if the caller does not hold `lock`.
    pub fn signal<S: Scheduler>(&self, sched: &S, lock: &Lock) {
        assert!(
            lock.held_by_current(sched),
            "Try to signal a condition variable without holding its lock."
        );
        let mut guard = InterruptGuard::new(sched);
        self.wake_one(sched, &mut guard);
    }

    /// Wakes up every thread waiting on this condition variable, most urgent
    /// first.
    ///
    /// # Panics
    /// Panics if the caller does not hold `lock`.
    pub fn broadcast<S: Scheduler>(&self, sched: &S, lock: &Lock) {
        assert!(
            lock.held_by_current(sched),
            "Try to broadcast a condition variable without holding its lock."
        );
        let mut guard = InterruptGuard::new(sched);
        while self.wake_one(sched, &mut guard) {}
    }

    fn wake_one<S: Scheduler>(&self, sched: &S, guard: &mut InterruptGuard<'_>) -> bool {
        let waiter = {
            let threads = sched.threads().borrow(guard);
            let mut waiters = self.waiters.borrow_mut(guard);
            if waiters.is_empty() {
                return false;
            }
            // Donations may have reordered the waiters since they queued.
            waiters.sort_by_key(|waiter| Reverse(threads.priority(waiter.owner)));
            waiters.remove(0)
        };
        trace!("{} signals {}", sched.current(), waiter.owner);
        waiter.semaphore.up_with(sched, guard);
        true
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// This function locks `mutex` and checks the predicate. If it returns
    /// `true`, the thread sleeps with the mutex temporarily released. When the
    /// thread is signaled and wakes up, it re-locks the mutex and re-evaluates
    /// the predicate. This loop continues until the predicate returns
    /// `false`, and the mutex is returned locked.
    ///
    /// # Example
    /// ```rust,ignore
    /// let guard = condvar.wait_while(&mutex, sched, |state| state.count == 0);
    /// ```
    ///
    /// There is **no need to check the predicate before calling** `wait_while`.
    pub fn wait_while<'a, T, S: Scheduler>(
        &self,
        mutex: &'a Mutex<T>,
        sched: &'a S,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T, S> {
        let mut guard = mutex.lock(sched);
        while predicate(&mut guard) {
            self.wait(sched, mutex.raw());
        }
        guard
    }

    /// Wakes up one waiter, then unlocks the mutex behind `guard`.
    pub fn signal_and_unlock<T, S: Scheduler>(&self, guard: MutexGuard<'_, T, S>) {
        self.signal(guard.sched, guard.mutex.raw());
        guard.unlock();
    }

    /// Wakes up every waiter, then unlocks the mutex behind `guard`.
    pub fn broadcast_and_unlock<T, S: Scheduler>(&self, guard: MutexGuard<'_, T, S>) {
        self.broadcast(guard.sched, guard.mutex.raw());
        guard.unlock();
    }
}
