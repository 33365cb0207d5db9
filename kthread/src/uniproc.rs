//! A hosted uniprocessor.
//!
//! [`Uniprocessor`] runs kernel threads on host threads, but lets exactly one
//! of them own the simulated CPU at any time. The CPU is handed from thread to
//! thread like a baton: a thread that blocks, yields or is preempted picks its
//! successor, passes the baton and waits until someone passes it back. The
//! resulting schedule is fully deterministic and follows the rules of a strict
//! priority-preemptive kernel scheduler:
//!
//! - the running thread always has the highest priority among runnable ones,
//!   except while it sits inside an interrupt-disabled critical section;
//! - among runnable threads of equal priority, the one that became runnable
//!   first runs first;
//! - a thread woken from an interrupt handler preempts the interrupted thread
//!   when the handler returns.
//!
//! The interrupt level is simulated per CPU and saved and restored on every
//! context switch, exactly like the interrupt flag on a real kernel.
//!
//! ```rust,ignore
//! let cpu = Uniprocessor::builder().priority(PRI_MIN).build();
//! let worker = cpu.spawn("worker", PRI_DEFAULT, || { /* ... */ });
//! cpu.join(worker);
//! ```

use crate::{
    interrupt::{InterruptGuard, InterruptState, Interrupts, IrqCell},
    scheduler::Scheduler,
    thread::{PRI_DEFAULT, Priority, ThreadTable, Tid},
};
use bitflags::bitflags;
use crossbeam_utils::atomic::AtomicCell;
use log::trace;
use std::{
    any::Any,
    collections::{BTreeMap, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind, resume_unwind},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

bitflags! {
    /// Scheduler events recorded by [`Uniprocessor::trace`].
    pub struct TraceMask: u32 {
        /// A thread blocked.
        const BLOCK = 1 << 0;
        /// A blocked thread became runnable.
        const UNBLOCK = 1 << 1;
        /// The CPU switched from one thread to another.
        const SWITCH = 1 << 2;
        /// A thread was preempted by a more urgent one.
        const PREEMPT = 1 << 3;
        /// A thread exited.
        const EXIT = 1 << 4;
    }
}

/// A scheduler event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The thread blocked.
    Block(Tid),
    /// The thread became runnable again.
    Unblock(Tid),
    /// The CPU switched threads.
    Switch {
        /// Thread that gave up the CPU.
        from: Tid,
        /// Thread that got the CPU.
        to: Tid,
    },
    /// The thread was preempted.
    Preempt(Tid),
    /// The thread exited.
    Exit(Tid),
}

impl Event {
    fn kind(&self) -> TraceMask {
        match self {
            Event::Block(_) => TraceMask::BLOCK,
            Event::Unblock(_) => TraceMask::UNBLOCK,
            Event::Switch { .. } => TraceMask::SWITCH,
            Event::Preempt(_) => TraceMask::PREEMPT,
            Event::Exit(_) => TraceMask::EXIT,
        }
    }
}

/// A possible state of a hosted thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable.
    Ready,
    /// Thread owns the CPU.
    Running,
    /// Thread is blocked.
    Blocked,
    /// Thread has exited but has not been joined yet.
    Exited,
}

struct HostedThread {
    state: ThreadState,
    saved_level: InterruptState,
    joiners: Vec<Tid>,
    panic: Option<Box<dyn Any + Send>>,
}

impl HostedThread {
    fn new(state: ThreadState, saved_level: InterruptState) -> Self {
        Self {
            state,
            saved_level,
            joiners: Vec::new(),
            panic: None,
        }
    }
}

struct Core {
    running: Tid,
    ready: VecDeque<Tid>,
    hosted: BTreeMap<Tid, HostedThread>,
    yield_on_return: bool,
    mask: TraceMask,
    trace: Vec<Event>,
    halted: Option<String>,
}

impl Core {
    #[track_caller]
    fn thread(&mut self, tid: Tid) -> &mut HostedThread {
        self.hosted
            .get_mut(&tid)
            .expect("Thread is not managed by this CPU.")
    }

    fn record(&mut self, event: Event) {
        if self.mask.contains(event.kind()) {
            self.trace.push(event);
        }
    }

    fn make_ready(&mut self, tid: Tid) {
        self.thread(tid).state = ThreadState::Ready;
        self.ready.push_back(tid);
    }

    /// Position and priority of the most urgent ready thread. Earliest wins
    /// ties.
    fn best_ready(&self, threads: &ThreadTable) -> Option<(usize, Priority)> {
        let mut best: Option<(usize, Priority)> = None;
        for (pos, tid) in self.ready.iter().enumerate() {
            let priority = threads.priority(*tid);
            if best.is_none_or(|(_, top)| priority > top) {
                best = Some((pos, priority));
            }
        }
        best
    }

    fn take_next(&mut self, threads: &ThreadTable) -> Option<Tid> {
        let (pos, _) = self.best_ready(threads)?;
        self.ready.remove(pos)
    }
}

/// Builder for a [`Uniprocessor`].
pub struct UniprocessorBuilder {
    name: String,
    priority: Priority,
    mask: TraceMask,
}

impl UniprocessorBuilder {
    /// Name of the thread that builds the CPU. Defaults to `"main"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Priority of the thread that builds the CPU. Defaults to
    /// [`PRI_DEFAULT`].
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Events to record in the trace. Defaults to none.
    pub fn trace(mut self, mask: TraceMask) -> Self {
        self.mask = mask;
        self
    }

    /// Creates the CPU. The calling host thread becomes its running thread.
    pub fn build(self) -> Arc<Uniprocessor> {
        let mut threads = ThreadTable::new();
        let main = threads.insert(self.name, self.priority);
        let mut hosted = BTreeMap::new();
        hosted.insert(
            main,
            HostedThread::new(ThreadState::Running, InterruptState::On),
        );
        Arc::new(Uniprocessor {
            threads: IrqCell::new(threads),
            core: Mutex::new(Core {
                running: main,
                ready: VecDeque::new(),
                hosted,
                yield_on_return: false,
                mask: self.mask,
                trace: Vec::new(),
                halted: None,
            }),
            baton: Condvar::new(),
            level: AtomicCell::new(InterruptState::On),
            in_interrupt: AtomicCell::new(false),
        })
    }
}

/// A hosted uniprocessor with a strict priority-preemptive scheduler.
pub struct Uniprocessor {
    threads: IrqCell<ThreadTable>,
    core: Mutex<Core>,
    baton: Condvar,
    level: AtomicCell<InterruptState>,
    in_interrupt: AtomicCell<bool>,
}

impl Uniprocessor {
    /// Creates a CPU whose running thread is the caller, named `"main"` at
    /// [`PRI_DEFAULT`].
    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Returns a builder to configure the CPU.
    pub fn builder() -> UniprocessorBuilder {
        UniprocessorBuilder {
            name: String::from("main"),
            priority: PRI_DEFAULT,
            mask: TraceMask::empty(),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands the CPU from the running thread to `next`.
    fn switch_to(&self, core: &mut Core, next: Tid) {
        let prev = core.running;
        let level = self.level.load();
        if let Some(thread) = core.hosted.get_mut(&prev) {
            thread.saved_level = level;
        }
        let thread = core.thread(next);
        thread.state = ThreadState::Running;
        let level = thread.saved_level;
        core.running = next;
        self.level.store(level);
        core.record(Event::Switch {
            from: prev,
            to: next,
        });
        trace!("switch {} -> {}", prev, next);
        self.baton.notify_all();
    }

    /// Waits until the baton comes back to `me`.
    fn wait_turn<'a>(&'a self, mut core: MutexGuard<'a, Core>, me: Tid) -> MutexGuard<'a, Core> {
        while core.running != me {
            if let Some(reason) = core.halted.clone() {
                drop(core);
                panic!("CPU halted: {}", reason);
            }
            core = self.baton.wait(core).unwrap_or_else(PoisonError::into_inner);
        }
        core
    }

    /// Runs the most urgent ready thread. `me` must already be off the CPU
    /// logically, i.e. blocked or in the ready queue.
    fn reschedule(&self, mut core: MutexGuard<'_, Core>, guard: &mut InterruptGuard<'_>, me: Tid) {
        let next = {
            let threads = self.threads.borrow(guard);
            core.take_next(&threads)
        };
        match next {
            Some(next) if next == me => core.thread(me).state = ThreadState::Running,
            Some(next) => {
                self.switch_to(&mut core, next);
                drop(self.wait_turn(core, me));
            }
            None => {
                let reason = format!("{} blocked while no thread is ready to run", me);
                core.halted = Some(reason.clone());
                self.baton.notify_all();
                drop(core);
                panic!("CPU halted: {}", reason);
            }
        }
    }

    /// Spawns a kernel thread running `f` at `priority`.
    ///
    /// The new thread preempts the caller immediately if it is more urgent.
    pub fn spawn<F>(self: &Arc<Self>, name: impl Into<String>, priority: Priority, f: F) -> Tid
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let mut guard = InterruptGuard::new(&**self);
        let tid = self.threads.borrow_mut(&guard).insert(name.clone(), priority);
        self.lock_core()
            .hosted
            .insert(tid, HostedThread::new(ThreadState::Ready, InterruptState::On));

        let cpu = Arc::clone(self);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || cpu.run(tid, f))
            .expect("Failed to spawn a host thread.");

        self.lock_core().ready.push_back(tid);
        self.check_preempt(&mut guard);
        tid
    }

    fn run<F: FnOnce()>(&self, me: Tid, f: F) {
        drop(self.wait_turn(self.lock_core(), me));
        let panic = catch_unwind(AssertUnwindSafe(f)).err();
        self.exit(me, panic);
    }

    fn exit(&self, me: Tid, panic: Option<Box<dyn Any + Send>>) {
        let guard = InterruptGuard::new(self);
        let mut core = self.lock_core();
        if core.halted.is_some() {
            return;
        }
        let thread = core.thread(me);
        thread.state = ThreadState::Exited;
        thread.panic = panic;
        let joiners = std::mem::take(&mut thread.joiners);
        for joiner in joiners {
            core.make_ready(joiner);
            core.record(Event::Unblock(joiner));
        }
        core.record(Event::Exit(me));
        trace!("{} exited", me);

        let next = {
            let threads = self.threads.borrow(&guard);
            core.take_next(&threads)
        };
        match next {
            Some(next) => self.switch_to(&mut core, next),
            None => {
                core.halted = Some(format!("{} exited while no thread is ready to run", me));
                self.baton.notify_all();
            }
        }
        drop(core);
        // The interrupt level now belongs to the next thread.
        guard.consume();
    }

    /// Waits for `tid` to exit and reaps it.
    ///
    /// If the thread panicked, the panic is resumed on the caller.
    ///
    /// # Panics
    /// Panics if `tid` is the caller or was already joined.
    pub fn join(&self, tid: Tid) {
        assert!(
            !self.in_interrupt_context(),
            "Try to join inside an interrupt handler."
        );
        let mut guard = InterruptGuard::new(self);
        loop {
            let mut core = self.lock_core();
            let me = core.running;
            assert_ne!(me, tid, "Try to join itself.");
            let thread = core
                .hosted
                .get_mut(&tid)
                .expect("Try to join a thread that was already joined.");
            if thread.state == ThreadState::Exited {
                let panic = thread.panic.take();
                core.hosted.remove(&tid);
                drop(core);
                self.threads.borrow_mut(&guard).reap(tid);
                drop(guard);
                if let Some(panic) = panic {
                    resume_unwind(panic);
                }
                return;
            }
            thread.joiners.push(me);
            core.thread(me).state = ThreadState::Blocked;
            core.record(Event::Block(me));
            self.reschedule(core, &mut guard, me);
        }
    }

    /// Gives the CPU to another ready thread of equal or higher priority, if
    /// any.
    pub fn yield_now(&self) {
        assert!(
            !self.in_interrupt_context(),
            "Try to yield inside an interrupt handler."
        );
        let mut guard = InterruptGuard::new(self);
        let mut core = self.lock_core();
        let me = core.running;
        core.make_ready(me);
        self.reschedule(core, &mut guard, me);
    }

    /// Sets the base priority of the running thread.
    ///
    /// The effective priority never drops below a donation the thread still
    /// receives. Yields if the running thread is no longer the most urgent.
    pub fn set_priority(&self, priority: Priority) {
        let mut guard = InterruptGuard::new(self);
        let me = self.current();
        self.threads
            .borrow_mut(&guard)
            .set_base_priority(me, priority);
        self.check_preempt(&mut guard);
    }

    /// Runs `handler` as if it were an interrupt handler preempting the
    /// running thread.
    ///
    /// Interrupts are disabled while the handler runs. If the handler made a
    /// more urgent thread runnable, the interrupted thread yields to it once
    /// the handler returns.
    ///
    /// # Panics
    /// Panics if interrupts are disabled or another handler is running.
    pub fn interrupt<R>(&self, handler: impl FnOnce() -> R) -> R {
        assert!(!self.in_interrupt.load(), "Nested interrupt.");
        assert_eq!(
            self.level.load(),
            InterruptState::On,
            "Interrupt delivered while interrupts are disabled."
        );

        struct HandlerContext<'a>(&'a AtomicCell<bool>);
        impl Drop for HandlerContext<'_> {
            fn drop(&mut self) {
                self.0.store(false);
            }
        }

        let ret = {
            let _guard = InterruptGuard::new(self);
            self.in_interrupt.store(true);
            let _context = HandlerContext(&self.in_interrupt);
            handler()
        };
        let pending = std::mem::take(&mut self.lock_core().yield_on_return);
        if pending {
            let mut guard = InterruptGuard::new(self);
            self.check_preempt(&mut guard);
        }
        ret
    }

    /// Effective priority of `tid`, or `None` if it was reaped.
    pub fn priority_of(&self, tid: Tid) -> Option<Priority> {
        let guard = InterruptGuard::new(self);
        let priority = self.threads.borrow(&guard).get(tid).map(|t| t.priority);
        priority
    }

    /// Base priority of `tid`, or `None` if it was reaped.
    pub fn base_priority_of(&self, tid: Tid) -> Option<Priority> {
        let guard = InterruptGuard::new(self);
        let priority = self
            .threads
            .borrow(&guard)
            .get(tid)
            .map(|t| t.base_priority);
        priority
    }

    /// State of `tid`, or `None` if it was joined.
    pub fn state_of(&self, tid: Tid) -> Option<ThreadState> {
        self.lock_core().hosted.get(&tid).map(|t| t.state)
    }

    /// Current interrupt level of the CPU.
    pub fn level(&self) -> InterruptState {
        self.level.load()
    }

    /// Events recorded so far.
    pub fn trace(&self) -> Vec<Event> {
        self.lock_core().trace.clone()
    }
}

impl Interrupts for Uniprocessor {
    fn disable_interrupts(&self) -> InterruptState {
        self.level.swap(InterruptState::Off)
    }

    fn restore_interrupts(&self, state: InterruptState) {
        self.level.store(state);
    }

    fn in_interrupt_context(&self) -> bool {
        self.in_interrupt.load()
    }
}

impl Scheduler for Uniprocessor {
    fn current(&self) -> Tid {
        self.lock_core().running
    }

    fn threads(&self) -> &IrqCell<ThreadTable> {
        &self.threads
    }

    fn block(&self, guard: &mut InterruptGuard<'_>) {
        assert!(
            !self.in_interrupt_context(),
            "Try to block inside an interrupt handler."
        );
        assert_eq!(
            self.level.load(),
            InterruptState::Off,
            "Try to block with interrupts enabled."
        );
        let mut core = self.lock_core();
        let me = core.running;
        core.thread(me).state = ThreadState::Blocked;
        core.record(Event::Block(me));
        trace!("{} blocked", me);
        self.reschedule(core, guard, me);
    }

    fn unblock(&self, tid: Tid) {
        let _guard = InterruptGuard::new(self);
        let mut core = self.lock_core();
        assert_eq!(
            core.thread(tid).state,
            ThreadState::Blocked,
            "Try to unblock {} which is not blocked.",
            tid
        );
        core.make_ready(tid);
        core.record(Event::Unblock(tid));
        trace!("{} unblocked", tid);
    }

    fn check_preempt(&self, guard: &mut InterruptGuard<'_>) {
        let mut core = self.lock_core();
        let me = core.running;
        let outranked = {
            let threads = self.threads.borrow(guard);
            let mine = threads.priority(me);
            core.best_ready(&threads)
                .is_some_and(|(_, priority)| priority > mine)
        };
        if !outranked {
            return;
        }
        if self.in_interrupt_context() {
            core.yield_on_return = true;
            return;
        }
        core.record(Event::Preempt(me));
        core.make_ready(me);
        self.reschedule(core, guard, me);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PRI_MIN;
    use std::sync::Mutex as HostMutex;

    fn log_of(log: &HostMutex<Vec<&'static str>>) -> Vec<&'static str> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn spawn_and_join() {
        let cpu = Uniprocessor::builder().priority(PRI_MIN).build();
        let log = Arc::new(HostMutex::new(Vec::new()));
        let l = log.clone();
        let t = cpu.spawn("child", PRI_DEFAULT, move || l.lock().unwrap().push("child"));
        // The child is more urgent, so it ran to completion already.
        assert_eq!(cpu.state_of(t), Some(ThreadState::Exited));
        log.lock().unwrap().push("main");
        cpu.join(t);
        assert_eq!(log_of(&log), ["child", "main"]);
        assert_eq!(cpu.state_of(t), None);
        assert_eq!(cpu.priority_of(t), None);
    }

    #[test]
    fn lower_priority_waits_for_join() {
        let cpu = Uniprocessor::new();
        let log = Arc::new(HostMutex::new(Vec::new()));
        let l = log.clone();
        let t = cpu.spawn("child", PRI_MIN, move || l.lock().unwrap().push("child"));
        assert_eq!(cpu.state_of(t), Some(ThreadState::Ready));
        log.lock().unwrap().push("main");
        cpu.join(t);
        assert_eq!(log_of(&log), ["main", "child"]);
    }

    #[test]
    fn yield_round_robins_equal_priority() {
        let cpu = Uniprocessor::new();
        let log = Arc::new(HostMutex::new(Vec::new()));
        let (l, c) = (log.clone(), cpu.clone());
        let t = cpu.spawn("child", PRI_DEFAULT, move || {
            l.lock().unwrap().push("child 1");
            c.yield_now();
            l.lock().unwrap().push("child 2");
        });
        log.lock().unwrap().push("main 1");
        cpu.yield_now();
        log.lock().unwrap().push("main 2");
        cpu.join(t);
        assert_eq!(log_of(&log), ["main 1", "child 1", "main 2", "child 2"]);
    }

    #[test]
    fn lowering_priority_yields() {
        let cpu = Uniprocessor::new();
        let log = Arc::new(HostMutex::new(Vec::new()));
        let l = log.clone();
        let t = cpu.spawn("child", PRI_DEFAULT - 1, move || l.lock().unwrap().push("child"));
        cpu.set_priority(PRI_MIN);
        log.lock().unwrap().push("main");
        assert_eq!(log_of(&log), ["child", "main"]);
        assert_eq!(cpu.current_priority(), PRI_MIN);
        cpu.join(t);
    }

    #[test]
    #[should_panic(expected = "boom")]
    fn panics_propagate_to_joiner() {
        let cpu = Uniprocessor::new();
        let t = cpu.spawn("child", PRI_MIN, || panic!("boom"));
        cpu.join(t);
    }

    #[test]
    fn trace_honors_mask() {
        let cpu = Uniprocessor::builder()
            .priority(PRI_MIN)
            .trace(TraceMask::SWITCH | TraceMask::EXIT)
            .build();
        let main = cpu.current();
        let t = cpu.spawn("child", PRI_DEFAULT, || {});
        cpu.join(t);
        assert_eq!(
            cpu.trace(),
            [
                Event::Switch { from: main, to: t },
                Event::Exit(t),
                Event::Switch { from: t, to: main },
            ]
        );
    }

    #[test]
    fn interrupt_defers_preemption() {
        let cpu = Uniprocessor::builder().priority(PRI_MIN).build();
        let log = Arc::new(HostMutex::new(Vec::new()));
        let (l, c) = (log.clone(), cpu.clone());
        let t = cpu.spawn("sleeper", PRI_DEFAULT, move || {
            let mut guard = InterruptGuard::new(&*c);
            c.block(&mut guard);
            drop(guard);
            l.lock().unwrap().push("sleeper");
        });
        assert_eq!(cpu.state_of(t), Some(ThreadState::Blocked));
        let (l, c) = (log.clone(), cpu.clone());
        cpu.interrupt(move || {
            assert!(c.in_interrupt_context());
            c.unblock(t);
            let mut guard = InterruptGuard::new(&*c);
            c.check_preempt(&mut guard);
            l.lock().unwrap().push("handler");
        });
        log.lock().unwrap().push("main");
        assert_eq!(log_of(&log), ["handler", "sleeper", "main"]);
        assert_eq!(cpu.level(), InterruptState::On);
        cpu.join(t);
    }

    #[test]
    #[should_panic(expected = "CPU halted")]
    fn blocking_the_last_thread_halts() {
        let cpu = Uniprocessor::new();
        let mut guard = InterruptGuard::new(&*cpu);
        cpu.block(&mut guard);
    }
}
