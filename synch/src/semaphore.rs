//! # Semaphore.
//!
//! A **semaphore** is a non-negative counter together with two atomic
//! operations on it:
//!
//! - [`Semaphore::down`]: waits until the counter is positive, then decrements
//!   it. The caller sleeps while it waits.
//! - [`Semaphore::up`]: increments the counter and wakes one sleeper, if any.
//!
//! A semaphore initialized to 0 signals an event that will happen exactly
//! once: one thread downs it to wait, another ups it when the event occurs. A
//! semaphore initialized to `n` hands out `n` permits to a shared resource.
//!
//! ## Priority
//!
//! Sleepers are queued in descending order of priority, and threads of equal
//! priority in order of arrival. [`Semaphore::up`] wakes the sleeper with the
//! highest priority *at the time of the wakeup*: a sleeper may have received a
//! priority donation after it queued, so the queue order alone is not
//! trusted. If the woken thread is more urgent than the caller, the caller
//! yields to it at once (or, inside an interrupt handler, when the handler
//! returns).
//!
//! ```rust,ignore
//! let sema = Semaphore::new(0);
//!
//! // Thread A
//! sema.down(sched); // Sleeps until B ups the semaphore.
//!
//! // Thread B
//! sema.up(sched);
//! ```

use alloc::{collections::VecDeque, vec::Vec};
use kthread::{InterruptGuard, IrqCell, Priority, Scheduler, ThreadTable, Tid, WouldBlock};
use log::trace;

struct State {
    value: usize,
    waiters: VecDeque<Tid>,
}

/// Counting semaphore.
pub struct Semaphore {
    state: IrqCell<State>,
}

impl Semaphore {
    /// Creates a new semaphore initialized to `value`.
    pub const fn new(value: usize) -> Self {
        Self {
            state: IrqCell::new(State {
                value,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Waits for the value to become positive, then decrements it.
    ///
    /// # Panics
    /// Panics if called from an interrupt handler.
    pub fn down<S: Scheduler>(&self, sched: &S) {
        assert!(
            !sched.in_interrupt_context(),
            "Try to down a semaphore inside an interrupt handler."
        );
        let mut guard = InterruptGuard::new(sched);
        while !self.down_or_sleep(sched, &mut guard) {}
    }

    /// Decrements the value if it is positive and returns `true`. Otherwise
    /// queues the caller, sleeps until it is woken, and returns `false`; the
    /// caller is expected to retry.
    pub(crate) fn down_or_sleep<S: Scheduler>(
        &self,
        sched: &S,
        guard: &mut InterruptGuard<'_>,
    ) -> bool {
        let me = sched.current();
        {
            let mut state = self.state.borrow_mut(guard);
            if state.value > 0 {
                state.value -= 1;
                return true;
            }
            let threads = sched.threads().borrow(guard);
            let mine = threads.priority(me);
            let pos = state
                .waiters
                .iter()
                .position(|tid| threads.priority(*tid) < mine)
                .unwrap_or(state.waiters.len());
            state.waiters.insert(pos, me);
        }
        trace!("{} sleeps on a semaphore", me);
        sched.block(guard);
        false
    }

    /// Decrements the value if it is positive, without sleeping.
    ///
    /// May be called from an interrupt handler.
    ///
    /// # Errors
    /// Returns [`WouldBlock`] if the value is 0.
    pub fn try_down<S: Scheduler>(&self, sched: &S) -> Result<(), WouldBlock> {
        let guard = InterruptGuard::new(sched);
        self.try_down_with(&guard)
    }

    pub(crate) fn try_down_with(&self, guard: &InterruptGuard<'_>) -> Result<(), WouldBlock> {
        let mut state = self.state.borrow_mut(guard);
        if state.value == 0 {
            return Err(WouldBlock);
        }
        state.value -= 1;
        Ok(())
    }

    /// Increments the value and wakes up the most urgent sleeper, if any.
    ///
    /// May be called from an interrupt handler.
    pub fn up<S: Scheduler>(&self, sched: &S) {
        let mut guard = InterruptGuard::new(sched);
        self.up_with(sched, &mut guard);
    }

    pub(crate) fn up_with<S: Scheduler>(&self, sched: &S, guard: &mut InterruptGuard<'_>) {
        let woken = {
            let mut state = self.state.borrow_mut(guard);
            let threads = sched.threads().borrow(guard);
            let woken = most_urgent(state.waiters.iter().copied(), &threads)
                .and_then(|pos| state.waiters.remove(pos));
            state.value += 1;
            woken
        };
        if let Some(tid) = woken {
            trace!("{} wakes up {}", sched.current(), tid);
            sched.unblock(tid);
        }
        sched.check_preempt(guard);
    }

    /// Current value. Only meaningful for diagnostics.
    pub fn value<S: Scheduler>(&self, sched: &S) -> usize {
        let guard = InterruptGuard::new(sched);
        let value = self.state.borrow(&guard).value;
        value
    }

    /// The sleeping threads, in queue order. Only meaningful for diagnostics.
    pub fn waiters<S: Scheduler>(&self, sched: &S) -> Vec<Tid> {
        let guard = InterruptGuard::new(sched);
        self.waiters_with(&guard)
    }

    pub(crate) fn waiters_with(&self, guard: &InterruptGuard<'_>) -> Vec<Tid> {
        self.state.borrow(guard).waiters.iter().copied().collect()
    }
}

/// Position of the first thread with the highest priority among `tids`.
fn most_urgent(tids: impl Iterator<Item = Tid>, threads: &ThreadTable) -> Option<usize> {
    let mut best: Option<(usize, Priority)> = None;
    for (pos, tid) in tids.enumerate() {
        let priority = threads.priority(tid);
        if best.is_none_or(|(_, top)| priority > top) {
            best = Some((pos, priority));
        }
    }
    best.map(|(pos, _)| pos)
}
