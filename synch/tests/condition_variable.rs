mod common;

use common::Journal;
use kthread::{PRI_DEFAULT, PRI_MIN, Priority, Scheduler, uniproc::Uniprocessor};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use synch::{ConditionVariable, Lock, Mutex};

#[test]
fn mesa_semantics() {
    let cpu = Uniprocessor::builder().priority(PRI_MIN).build();
    let lock = Arc::new(Lock::new());
    let condvar = Arc::new(ConditionVariable::new());
    let ready = Arc::new(AtomicBool::new(false));
    let journal = Journal::new();

    let waiter = {
        let (cpu_, lock, condvar, ready, journal) = (
            cpu.clone(),
            lock.clone(),
            condvar.clone(),
            ready.clone(),
            journal.clone(),
        );
        cpu.spawn("waiter", PRI_DEFAULT, move || {
            lock.acquire(&*cpu_);
            loop {
                let observed = ready.load(Ordering::SeqCst);
                journal.push(observed);
                if observed {
                    break;
                }
                condvar.wait(&*cpu_, &lock);
            }
            lock.release(&*cpu_);
        })
    };

    // A signal is only a hint: the waiter wakes up and finds nothing changed.
    lock.acquire(&*cpu);
    condvar.signal(&*cpu, &lock);
    lock.release(&*cpu);
    assert_eq!(journal.entries(), [false, false]);

    lock.acquire(&*cpu);
    ready.store(true, Ordering::SeqCst);
    condvar.signal(&*cpu, &lock);
    lock.release(&*cpu);
    assert_eq!(journal.entries(), [false, false, true]);

    cpu.join(waiter);
}

fn spawn_waiters(
    cpu: &Arc<Uniprocessor>,
    lock: &Arc<Lock>,
    condvar: &Arc<ConditionVariable>,
    journal: &Arc<Journal<Priority>>,
) -> Vec<kthread::Tid> {
    [2, 9, 5]
        .into_iter()
        .map(|priority| {
            let (cpu_, lock, condvar, journal) =
                (cpu.clone(), lock.clone(), condvar.clone(), journal.clone());
            cpu.spawn("waiter", priority, move || {
                lock.acquire(&*cpu_);
                condvar.wait(&*cpu_, &lock);
                journal.push(priority);
                lock.release(&*cpu_);
            })
        })
        .collect()
}

#[test]
fn signal_wakes_highest_priority_first() {
    let cpu = Uniprocessor::builder().priority(PRI_MIN).build();
    let lock = Arc::new(Lock::new());
    let condvar = Arc::new(ConditionVariable::new());
    let journal = Journal::new();
    let waiters = spawn_waiters(&cpu, &lock, &condvar, &journal);

    for expected in [vec![9], vec![9, 5], vec![9, 5, 2]] {
        lock.acquire(&*cpu);
        condvar.signal(&*cpu, &lock);
        lock.release(&*cpu);
        assert_eq!(journal.entries(), expected);
    }

    // Nobody left to wake.
    lock.acquire(&*cpu);
    condvar.signal(&*cpu, &lock);
    lock.release(&*cpu);

    for waiter in waiters {
        cpu.join(waiter);
    }
}

#[test]
fn broadcast_wakes_all_by_priority() {
    let cpu = Uniprocessor::builder().priority(PRI_MIN).build();
    let lock = Arc::new(Lock::new());
    let condvar = Arc::new(ConditionVariable::new());
    let journal = Journal::new();
    let waiters = spawn_waiters(&cpu, &lock, &condvar, &journal);

    lock.acquire(&*cpu);
    condvar.broadcast(&*cpu, &lock);
    // Every waiter now wants the lock back and lends us its priority.
    assert_eq!(cpu.current_priority(), 9);
    lock.release(&*cpu);
    assert_eq!(journal.entries(), [9, 5, 2]);
    assert_eq!(cpu.current_priority(), PRI_MIN);

    for waiter in waiters {
        cpu.join(waiter);
    }
}

#[test]
#[should_panic(expected = "without holding its lock")]
fn wait_without_lock() {
    let cpu = Uniprocessor::new();
    let lock = Lock::new();
    ConditionVariable::new().wait(&*cpu, &lock);
}

#[test]
#[should_panic(expected = "without holding its lock")]
fn signal_without_lock() {
    let cpu = Uniprocessor::new();
    let lock = Lock::new();
    ConditionVariable::new().signal(&*cpu, &lock);
}

#[test]
#[should_panic(expected = "without holding its lock")]
fn broadcast_without_lock() {
    let cpu = Uniprocessor::new();
    let lock = Lock::new();
    ConditionVariable::new().broadcast(&*cpu, &lock);
}

mod bounded_buffer {
    use super::*;

    const MAX: usize = 2;
    struct BufferInner {
        item: [usize; MAX],
        front: usize,
        tail: usize,
    }
    impl BufferInner {
        fn is_full(&self) -> bool {
            self.tail.overflowing_sub(self.front).0 % MAX == MAX - 1
        }
        fn is_empty(&self) -> bool {
            self.front == self.tail
        }
    }
    struct Buffer {
        inner: Mutex<BufferInner>,
        full: ConditionVariable,
        empty: ConditionVariable,
    }

    impl Buffer {
        fn new() -> Self {
            Buffer {
                inner: Mutex::new(BufferInner {
                    item: [0; MAX],
                    front: 0,
                    tail: 0,
                }),
                full: ConditionVariable::new(),
                empty: ConditionVariable::new(),
            }
        }

        fn put<S: Scheduler>(&self, sched: &S, val: usize) {
            let mut guard = self.full.wait_while(&self.inner, sched, |b| b.is_full());
            let tail = (guard.tail + 1) % MAX;
            guard.tail = tail;
            guard.item[tail] = val;
            self.empty.signal_and_unlock(guard);
        }

        fn put_many<S: Scheduler>(&self, sched: &S, val: &[usize]) {
            let mut idx = 0;
            while idx < val.len() {
                let mut guard = self.full.wait_while(&self.inner, sched, |b| b.is_full());
                while !guard.is_full() && idx < val.len() {
                    let tail = (guard.tail + 1) % MAX;
                    guard.tail = tail;
                    guard.item[tail] = val[idx];
                    idx += 1;
                }
                self.empty.broadcast_and_unlock(guard);
            }
        }

        fn get<S: Scheduler>(&self, sched: &S) -> usize {
            let mut guard = self.empty.wait_while(&self.inner, sched, |b| b.is_empty());
            let front = (guard.front + 1) % MAX;
            let item = guard.item[front];
            guard.front = front;
            self.full.signal_and_unlock(guard);
            item
        }
    }

    fn run(consumer_priorities: &[Priority], producer_priority: Priority, chunked: bool) {
        let cpu = Uniprocessor::builder().priority(PRI_MIN).build();
        let buffer = Arc::new(Buffer::new());
        let output = Arc::new(Mutex::new(Vec::new()));
        let items = consumer_priorities.len();

        let consumers: Vec<_> = consumer_priorities
            .iter()
            .map(|&priority| {
                let (cpu_, buffer, output) = (cpu.clone(), buffer.clone(), output.clone());
                cpu.spawn("consumer", priority, move || {
                    let d = buffer.get(&*cpu_);
                    let mut guard = output.lock(&*cpu_);
                    guard.push(d);
                    guard.unlock();
                })
            })
            .collect();

        let producer = {
            let (cpu_, buffer) = (cpu.clone(), buffer.clone());
            cpu.spawn("producer", producer_priority, move || {
                let values: Vec<usize> = (0..items).collect();
                if chunked {
                    for chunk in values.chunks(2) {
                        buffer.put_many(&*cpu_, chunk);
                    }
                } else {
                    for i in values {
                        buffer.put(&*cpu_, i);
                    }
                }
            })
        };

        for consumer in consumers {
            cpu.join(consumer);
        }
        cpu.join(producer);

        let mut output = output.lock(&*cpu);
        output.sort();
        assert_eq!(&*output, &(0..items).collect::<Vec<_>>());
        output.unlock();
    }

    #[test]
    fn bounded_buffer_1() {
        run(&[PRI_DEFAULT; 6], PRI_DEFAULT, false);
    }

    #[test]
    fn bounded_buffer_2() {
        run(&[PRI_DEFAULT; 6], PRI_DEFAULT, true);
    }

    #[test]
    fn bounded_buffer_mixed_priorities() {
        run(&[3, 40, 12, 7, 25, 60], 20, false);
    }
}
