//! Priority donation.
//!
//! A thread that blocks on a held lock lends its priority to the holder. If
//! the holder is itself blocked on another lock, the priority travels on to
//! that lock's holder, and so on down the chain, so that every thread standing
//! between the donor and the CPU runs at least as urgently as the donor.
//!
//! Donations are returned lock by lock: when a holder releases a lock, it
//! forgets the donors that were waiting for that lock and falls back to the
//! highest of its base priority and its remaining donations.
//!
//! Wait-for chains must be acyclic; cycles are a deadlock the walk does not
//! try to detect.

use alloc::{collections::VecDeque, vec::Vec};
use kthread::{LockId, ThreadTable, Tid};
use log::debug;

/// Records that `donor` waits for `lock`, held by `holder`, and raises the
/// priority of every thread along the chain starting at `holder`.
pub(crate) fn donate(threads: &mut ThreadTable, donor: Tid, lock: LockId, holder: Tid) {
    let priority = threads.priority(donor);
    threads.record_mut(donor).waiting_on = Some(lock);
    let donors = &mut threads.record_mut(holder).donors;
    if !donors.contains(&donor) {
        donors.push_front(donor);
    }

    let mut next = Some(holder);
    while let Some(donee) = next {
        let record = threads.record_mut(donee);
        // Every thread further down the chain already runs at least at this
        // priority.
        if record.priority >= priority {
            break;
        }
        debug!(
            "{} donates priority {} to {} (was {})",
            donor, priority, donee, record.priority
        );
        record.priority = priority;
        let waiting_on = record.waiting_on;
        next = waiting_on.and_then(|lock| threads.holder_of(lock));
    }
}

/// Makes `holder`, the new holder of a lock, the donee of the threads still
/// queued on it.
pub(crate) fn adopt(threads: &mut ThreadTable, holder: Tid, waiters: Vec<Tid>) {
    if waiters.is_empty() {
        return;
    }
    let donors = &mut threads.record_mut(holder).donors;
    for waiter in waiters {
        if !donors.contains(&waiter) {
            donors.push_back(waiter);
        }
    }
    let priority = threads.recompute_priority(holder);
    debug!("{} inherits the waiters of its lock at priority {}", holder, priority);
}

/// Drops the donations `holder` received from threads waiting for `lock`,
/// and recomputes its priority from what remains.
pub(crate) fn retract(threads: &mut ThreadTable, holder: Tid, lock: LockId) {
    let donors = core::mem::take(&mut threads.record_mut(holder).donors);
    let remaining: VecDeque<Tid> = donors
        .into_iter()
        .filter(|donor| {
            threads
                .get(*donor)
                .is_some_and(|record| record.waiting_on != Some(lock))
        })
        .collect();
    threads.record_mut(holder).donors = remaining;

    let before = threads.priority(holder);
    let after = threads.recompute_priority(holder);
    if before != after {
        debug!("{} returns from priority {} to {}", holder, before, after);
    }
}
