//! The scheduler interface consumed by the synchronization primitives.

use crate::{
    interrupt::{InterruptGuard, Interrupts, IrqCell},
    thread::{Priority, ThreadTable, Tid},
};

/// A trait for a strict priority-preemptive uniprocessor scheduler.
///
/// The [`Scheduler`] trait is the only thing the synchronization primitives
/// know about threads. It identifies the running thread, puts it to sleep,
/// wakes others up, and decides whether a newly runnable thread should take
/// the CPU away from the current one. Through its [`Interrupts`] supertrait it
/// also provides the interrupt-disabled critical sections every primitive
/// runs in.
///
/// The scheduler is passed to every operation as an explicit context handle.
/// Operations that may switch the CPU to another thread take the current
/// [`InterruptGuard`] by mutable reference: a borrow of an [`IrqCell`] is tied
/// to a shared borrow of the guard, so the borrow checker rejects holding one
/// across a context switch.
pub trait Scheduler: Interrupts {
    /// Returns the handle of the running thread.
    fn current(&self) -> Tid;

    /// The arena of thread records, including donation bookkeeping.
    fn threads(&self) -> &IrqCell<ThreadTable>;

    /// Blocks the running thread until another thread calls
    /// [`Scheduler::unblock`] on it.
    ///
    /// Must be called with interrupts disabled, i.e. while `guard` is alive,
    /// and never from an interrupt handler. When this returns, the thread
    /// runs again and interrupts are still disabled.
    fn block(&self, guard: &mut InterruptGuard<'_>);

    /// Makes a blocked thread runnable.
    ///
    /// This never preempts the caller; call [`Scheduler::check_preempt`]
    /// afterwards to yield to the woken thread if it is more urgent.
    ///
    /// # Panics
    /// Panics if `tid` is not blocked.
    fn unblock(&self, tid: Tid);

    /// Yields the CPU if a runnable thread has a strictly higher priority than
    /// the running one.
    ///
    /// Inside an interrupt handler, the yield is deferred until the handler
    /// returns.
    fn check_preempt(&self, guard: &mut InterruptGuard<'_>);

    /// Effective priority of the running thread.
    fn current_priority(&self) -> Priority
    where
        Self: Sized,
    {
        let guard = InterruptGuard::new(self);
        let priority = self.threads().borrow(&guard).priority(self.current());
        priority
    }
}
