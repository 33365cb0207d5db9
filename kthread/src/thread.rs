//! Thread records and their arena.
//!
//! The scheduler owns one [`ThreadTable`] holding a [`ThreadRecord`] for every
//! live thread. Records are addressed by [`Tid`], a generation-checked handle:
//! once a thread is reaped, its slot may be reused, and every handle that still
//! names the old thread resolves to `None` instead of to the newcomer.
//!
//! Besides the scheduling priority, each record carries the bookkeeping of the
//! priority-donation protocol: the *base* priority that the thread asked for,
//! the threads that currently donate to it, and the lock it is waiting on. The
//! table also remembers which thread holds each lock.

use alloc::{collections::BTreeMap, collections::VecDeque, string::String, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Scheduling priority of a thread. Larger is more urgent.
pub type Priority = u8;

/// Lowest priority.
pub const PRI_MIN: Priority = 0;
/// Priority of a thread created without an explicit priority.
pub const PRI_DEFAULT: Priority = 31;
/// Highest priority.
pub const PRI_MAX: Priority = 63;

/// A weak handle to a thread record.
///
/// Handles are cheap to copy and compare. A handle outlives its thread: after
/// the thread is reaped, [`ThreadTable::get`] returns `None` for it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Tid {
    index: u32,
    generation: u32,
}

impl Tid {
    /// Slot index of this handle in the arena.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid#{}.{}", self.index, self.generation)
    }
}

/// Identity of a lock.
///
/// The holder of a lock and the lock a thread waits on are recorded by id in
/// the [`ThreadTable`], so a lock never needs to be reachable from a thread
/// record.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct LockId(u64);

/// Id 0 is never handed out; [`LockIdCell`] uses it for "not yet assigned".
const UNASSIGNED: u64 = 0;

impl LockId {
    /// Allocates a fresh lock id.
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(UNASSIGNED + 1);
        LockId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for LockId {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`LockId`] allocated on first use.
///
/// Allocating an id touches a global counter, which a `const fn` cannot do.
/// Embedding a `LockIdCell` instead keeps lock constructors `const`, so locks
/// can live in statics.
#[derive(Debug, Default)]
pub struct LockIdCell(AtomicU64);

impl LockIdCell {
    /// Creates a cell with no id assigned yet.
    pub const fn new() -> Self {
        LockIdCell(AtomicU64::new(UNASSIGNED))
    }

    /// The id of this cell, allocating it on the first call.
    pub fn get(&self) -> LockId {
        let id = self.0.load(Ordering::Acquire);
        if id != UNASSIGNED {
            return LockId(id);
        }
        let fresh = LockId::new();
        match self
            .0
            .compare_exchange(UNASSIGNED, fresh.0, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => fresh,
            Err(winner) => LockId(winner),
        }
    }
}

/// Per-thread scheduling and donation state.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    /// Name of the thread, for diagnostics.
    pub name: String,
    /// Effective priority: the base priority raised by donations.
    pub priority: Priority,
    /// Priority the thread asked for. Donations never touch it.
    pub base_priority: Priority,
    /// Threads blocked on a lock held by this thread, most recent first.
    pub donors: VecDeque<Tid>,
    /// The lock this thread is blocked acquiring, if any.
    pub waiting_on: Option<LockId>,
}

impl ThreadRecord {
    fn new(name: String, priority: Priority) -> Self {
        Self {
            name,
            priority,
            base_priority: priority,
            donors: VecDeque::new(),
            waiting_on: None,
        }
    }
}

struct Slot {
    generation: u32,
    record: Option<ThreadRecord>,
}

/// Arena of thread records plus the lock-holder relation.
pub struct ThreadTable {
    slots: Vec<Slot>,
    free: Vec<u32>,
    holders: BTreeMap<LockId, Tid>,
}

impl ThreadTable {
    /// Creates an empty table.
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            holders: BTreeMap::new(),
        }
    }

    /// Registers a new thread and returns its handle.
    pub fn insert(&mut self, name: impl Into<String>, priority: Priority) -> Tid {
        assert!(
            priority <= PRI_MAX,
            "Priority {} is out of range [{}, {}].",
            priority,
            PRI_MIN,
            PRI_MAX
        );
        let record = ThreadRecord::new(name.into(), priority);
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.record = Some(record);
            Tid {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                record: Some(record),
            });
            Tid {
                index,
                generation: 0,
            }
        }
    }

    /// Frees the record of an exited thread.
    ///
    /// Returns `None` if the handle was already stale.
    pub fn reap(&mut self, tid: Tid) -> Option<ThreadRecord> {
        let slot = self.slots.get_mut(tid.index as usize)?;
        if slot.generation != tid.generation {
            return None;
        }
        let record = slot.record.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(tid.index);
        Some(record)
    }

    /// Looks up a record.
    pub fn get(&self, tid: Tid) -> Option<&ThreadRecord> {
        self.slots
            .get(tid.index as usize)
            .filter(|slot| slot.generation == tid.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    /// Looks up a record mutably.
    pub fn get_mut(&mut self, tid: Tid) -> Option<&mut ThreadRecord> {
        self.slots
            .get_mut(tid.index as usize)
            .filter(|slot| slot.generation == tid.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    /// Looks up a record that must be alive.
    ///
    /// # Panics
    /// Panics if `tid` is stale.
    #[track_caller]
    pub fn record(&self, tid: Tid) -> &ThreadRecord {
        match self.get(tid) {
            Some(record) => record,
            None => panic!("stale thread handle {}", tid),
        }
    }

    /// Mutable counterpart of [`ThreadTable::record`].
    #[track_caller]
    pub fn record_mut(&mut self, tid: Tid) -> &mut ThreadRecord {
        match self.get_mut(tid) {
            Some(record) => record,
            None => panic!("stale thread handle {}", tid),
        }
    }

    /// Effective priority of `tid`.
    #[track_caller]
    pub fn priority(&self, tid: Tid) -> Priority {
        self.record(tid).priority
    }

    /// Base priority of `tid`.
    #[track_caller]
    pub fn base_priority(&self, tid: Tid) -> Priority {
        self.record(tid).base_priority
    }

    /// The thread holding `lock`, if any.
    pub fn holder_of(&self, lock: LockId) -> Option<Tid> {
        self.holders.get(&lock).copied()
    }

    /// Records `holder` as the owner of `lock`.
    pub fn set_holder(&mut self, lock: LockId, holder: Option<Tid>) {
        match holder {
            Some(tid) => {
                self.holders.insert(lock, tid);
            }
            None => {
                self.holders.remove(&lock);
            }
        }
    }

    /// Recomputes the effective priority of `tid` from its base priority and
    /// its remaining donors, and returns it.
    ///
    /// Donors whose handle went stale are ignored.
    #[track_caller]
    pub fn recompute_priority(&mut self, tid: Tid) -> Priority {
        let record = self.record(tid);
        let donated = record
            .donors
            .iter()
            .filter_map(|donor| self.get(*donor))
            .map(|donor| donor.priority)
            .max()
            .unwrap_or(PRI_MIN);
        let priority = record.base_priority.max(donated);
        self.record_mut(tid).priority = priority;
        priority
    }

    /// Changes the base priority of `tid`.
    ///
    /// The effective priority follows the base, but never drops below a
    /// donation the thread still receives. Returns the new effective priority.
    #[track_caller]
    pub fn set_base_priority(&mut self, tid: Tid, priority: Priority) -> Priority {
        assert!(
            priority <= PRI_MAX,
            "Priority {} is out of range [{}, {}].",
            priority,
            PRI_MIN,
            PRI_MAX
        );
        self.record_mut(tid).base_priority = priority;
        self.recompute_priority(tid)
    }

    /// Number of live threads.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Returns `true` if no thread is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates over the live threads.
    pub fn iter(&self) -> impl Iterator<Item = (Tid, &ThreadRecord)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.record.as_ref().map(|record| {
                (
                    Tid {
                        index: index as u32,
                        generation: slot.generation,
                    },
                    record,
                )
            })
        })
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
