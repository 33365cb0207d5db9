//! Interrupt-disabled critical sections.
//!
//! On a uniprocessor kernel, the only way to make a sequence of updates
//! atomic with respect to other threads is to prevent the timer interrupt from
//! preempting the running thread. Every piece of state that the
//! synchronization primitives share between threads (semaphore counters, wait
//! queues, lock holders, donor lists) is therefore protected by disabling
//! interrupts, never by another lock.
//!
//! This module exposes that discipline as two types:
//!
//! - [`InterruptGuard`]: an RAII-based guard that disables interrupts when
//!   created and restores the previous state when dropped. Guards nest; the
//!   innermost guard restores the state observed by its own creation.
//! - [`IrqCell`]: a cell whose contents can only be borrowed while an
//!   [`InterruptGuard`] is alive. The borrow is tied to the guard's lifetime,
//!   and the operations that can switch threads away ([`Scheduler::block`],
//!   [`Scheduler::check_preempt`]) take the guard by `&mut`, so a borrow can
//!   never be held across a context switch.
//!
//! [`Scheduler::block`]: crate::Scheduler::block
//! [`Scheduler::check_preempt`]: crate::Scheduler::check_preempt

use core::{
    cell::{Ref, RefCell, RefMut},
    marker::PhantomData,
};

/// Enumeration representing the interrupt state.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum InterruptState {
    /// Interrupts are enabled.
    On,
    /// Interrupts are disabled.
    Off,
}

/// Interrupt control of the running CPU.
///
/// Implemented by the scheduler, which knows which thread owns the CPU and
/// whether it is currently servicing an interrupt.
pub trait Interrupts {
    /// Disables interrupts and returns the state before the call.
    fn disable_interrupts(&self) -> InterruptState;

    /// Restores the interrupt state to `state`.
    fn restore_interrupts(&self, state: InterruptState);

    /// Returns `true` while the CPU is executing an interrupt handler.
    fn in_interrupt_context(&self) -> bool;
}

/// An RAII-based guard for managing interrupt disabling.
///
/// When an `InterruptGuard` is created, interrupts are disabled. When it is
/// dropped, the interrupt state is restored to what it was before the guard was
/// created.
///
/// **Important:**
/// - [`InterruptGuard`] instances **must be dropped in reverse order of their
///   creation** to prevent unintended interrupt state changes.
/// - Due to Rust's ownership and scoping rules, this invariant is naturally
///   upheld unless `drop()` is explicitly called prematurely or an
///   [`InterruptGuard`] is stored in a struct field.
///
/// The guard survives a context switch: a thread that blocks while holding a
/// guard finds interrupts still disabled when it resumes, and its own drop
/// restores the state it saved.
pub struct InterruptGuard<'a> {
    cpu: &'a (dyn Interrupts + 'a),
    prev: InterruptState,
    _not_send: PhantomData<*mut ()>,
}

impl<'a> InterruptGuard<'a> {
    /// Creates a new `InterruptGuard`, disabling interrupts on `cpu`.
    ///
    /// # Example
    /// ```rust,ignore
    /// let _guard = InterruptGuard::new(sched); // Disables interrupts
    /// // Critical section...
    /// // Interrupts are restored when `_guard` goes out of scope.
    /// ```
    pub fn new<I: Interrupts + 'a>(cpu: &'a I) -> Self {
        let prev = cpu.disable_interrupts();
        Self {
            cpu,
            prev,
            _not_send: PhantomData,
        }
    }

    /// The interrupt state this guard restores when dropped.
    pub fn saved_state(&self) -> InterruptState {
        self.prev
    }

    /// Consumes the guard without restoring the interrupt state.
    ///
    /// Used by a thread that leaves the CPU for good (e.g. on exit), where
    /// the next thread owns the interrupt state from now on.
    pub fn consume(self) {
        core::mem::forget(self);
    }
}

impl Drop for InterruptGuard<'_> {
    fn drop(&mut self) {
        self.cpu.restore_interrupts(self.prev);
    }
}

/// A cell that is only accessible inside an interrupt-disabled critical
/// section.
///
/// `IrqCell` is the kernel's replacement for a lock around data shared with
/// other threads and interrupt handlers. Borrowing requires a live
/// [`InterruptGuard`], and the returned borrow cannot outlive it.
///
/// Borrowing the same cell mutably twice panics, like [`RefCell`].
pub struct IrqCell<T> {
    inner: RefCell<T>,
}

// Only one thread of control runs while interrupts are disabled on a
// uniprocessor, and every access goes through a guard.
unsafe impl<T: Send> Sync for IrqCell<T> {}
unsafe impl<T: Send> Send for IrqCell<T> {}

impl<T> IrqCell<T> {
    /// Creates a new cell holding `t`.
    pub const fn new(t: T) -> Self {
        Self {
            inner: RefCell::new(t),
        }
    }

    /// Immutably borrows the contents for the lifetime of `guard`.
    #[track_caller]
    pub fn borrow<'g>(&'g self, _guard: &'g InterruptGuard<'_>) -> Ref<'g, T> {
        self.inner.borrow()
    }

    /// Mutably borrows the contents for the lifetime of `guard`.
    #[track_caller]
    pub fn borrow_mut<'g>(&'g self, _guard: &'g InterruptGuard<'_>) -> RefMut<'g, T> {
        self.inner.borrow_mut()
    }

    /// Consumes this cell, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: Default> Default for IrqCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
