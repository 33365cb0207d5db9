//! Kernel threading interface.
//!
//! This crate is the boundary between the synchronization primitives and the
//! thread scheduler. It provides:
//!
//! - [`interrupt`]: interrupt-disabled critical sections ([`InterruptGuard`])
//!   and the cell type that can only be accessed inside one ([`IrqCell`]).
//! - [`thread`]: thread handles and the arena of per-thread records,
//!   including the priority-donation bookkeeping.
//! - [`scheduler`]: the [`Scheduler`] trait.
//! - `uniproc` (with the `std` feature): a hosted, deterministic uniprocessor
//!   that runs kernel threads on host threads, one at a time.
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod interrupt;
pub mod scheduler;
pub mod thread;
#[cfg(feature = "std")]
pub mod uniproc;

pub use interrupt::{InterruptGuard, InterruptState, Interrupts, IrqCell};
pub use scheduler::Scheduler;
pub use thread::{
    LockId, LockIdCell, PRI_DEFAULT, PRI_MAX, PRI_MIN, Priority, ThreadRecord, ThreadTable, Tid,
};

/// The lock could not be acquired at this time because the operation would
/// otherwise block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

impl core::fmt::Display for WouldBlock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("operation would block")
    }
}
