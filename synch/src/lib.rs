//! Synchronization primitives with priority donation.
//!
//! This crate implements the blocking synchronization primitives of a
//! uniprocessor kernel with a strict priority-preemptive scheduler:
//!
//! - [`Semaphore`]: a counter with a priority-ordered queue of sleepers.
//! - [`Lock`]: a binary semaphore with an owner. A thread that waits on a held
//!   lock donates its priority to the holder, and transitively to whatever the
//!   holder waits on, so that a low-priority holder cannot be starved by
//!   medium-priority threads while a high-priority thread waits for it.
//! - [`ConditionVariable`]: a Mesa-style condition variable on top of a
//!   [`Lock`].
//! - [`Mutex`]: a lock that owns the data it protects.
//!
//! None of them reach for global state. Every operation receives the
//! scheduler of the running CPU as an explicit [`Scheduler`] handle, and all
//! shared state is guarded by disabling interrupts through it.
//!
//! [`Scheduler`]: kthread::Scheduler
#![cfg_attr(not(test), no_std)]
#![deny(missing_docs)]

extern crate alloc;

pub mod condition_variable;
mod donation;
pub mod lock;
pub mod mutex;
pub mod semaphore;

pub use condition_variable::ConditionVariable;
pub use kthread::WouldBlock;
pub use lock::Lock;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
