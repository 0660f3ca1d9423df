//! # Scheduler
//!
//! Priority scheduler for a single core. Four static tiers, each a max-heap on
//! dynamic priority; a running task is displaced only by a more urgent ready
//! task, by blocking, or by overrunning its time slice.
//!
//! ## Locking
//!
//! [`lock_scheduler`](Scheduler::lock_scheduler) masks interrupts with a
//! re-entrant counter; [`schedule`](Scheduler::schedule) must run under it.
//! [`lock_stuff`](Scheduler::lock_stuff) additionally defers switches: a
//! `schedule()` inside only records the request, and the outermost release
//! makes exactly one decision.
//!
//! The run state, the tasks' bookkeeping and the latches are also reached
//! from the timer interrupt. Their spin locks mask interrupts while held, so
//! every accessor is safe to call with interrupts enabled.
//!
//! ## Lifetime of tasks
//!
//! The run state holds every live task. A task that ends is dropped at the
//! scheduling decision after the one that switched away from it, so its stack
//! and address space are never freed while in use.

use crate::SpawnError;
use crate::platform::{Masking, Platform, SwitchTarget};
use crate::queue::ReadyQueues;
use crate::task::{Task, TaskEntry, TaskId, TaskPriority, TaskState};
use crate::waitable::{Subscriber, Waitable};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering as TierOrdering;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use kernel_sync::{
    HeldState, InterruptControl, InterruptGuard, InterruptLock, IrqSpinLockGuard, SpinLock,
    SwitchPostponer,
};
use kernel_vmem::ThreadMemory;

/// Tunables of the scheduling policy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SchedulerConfig {
    /// Running longer than this lets peers of the same tier take over.
    pub time_slice: Duration,
    pub default_dynamic_priority: u8,
    /// Added to a task's dynamic priority when it blocks.
    pub block_boost: u8,
    /// Added to every ready task per tick; taken from a task overrunning its slice.
    pub aging_step: u8,
    /// Tier of the boot flow of control.
    pub boot_priority: TaskPriority,
}

impl SchedulerConfig {
    pub const DEFAULT: Self = Self {
        time_slice: Duration::from_millis(50),
        default_dynamic_priority: 128,
        block_boost: 1,
        aging_step: 1,
        boot_priority: TaskPriority::Normal,
    };
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Held scheduler lock; interrupts stay masked until the outermost drop.
pub type SchedulerLock<'a> = InterruptGuard<'a, dyn InterruptControl + 'a>;

/// Held [`Scheduler::lock_stuff`]; replays a deferred switch on release.
#[must_use = "switches are deferred only while the guard lives"]
pub struct StuffLock<'a> {
    scheduler: &'a Scheduler,
    _irq: SchedulerLock<'a>,
}

impl Drop for StuffLock<'_> {
    fn drop(&mut self) {
        if self.scheduler.postponer.exit() {
            log::trace!("replaying postponed switch");
            self.scheduler.schedule();
        }
    }
}

struct RunState {
    queues: ReadyQueues,
    current: Arc<Task>,
    live: BTreeMap<TaskId, Arc<Task>>,
    /// Ended tasks waiting for the next decision to be dropped.
    zombies: Vec<Arc<Task>>,
    idle: Option<TaskId>,
    now: Duration,
}

pub struct Scheduler {
    platform: Arc<dyn Platform>,
    masking: Masking,
    memory: &'static dyn ThreadMemory,
    config: SchedulerConfig,
    irq_lock: InterruptLock,
    postponer: SwitchPostponer,
    state: SpinLock<RunState>,
    next_id: AtomicU32,
}

impl Scheduler {
    /// Wraps the running flow of control as task zero and spawns the idle
    /// task, which must never return.
    ///
    /// # Errors
    /// No memory for the idle task.
    pub fn init(
        platform: Box<dyn Platform>,
        memory: &'static dyn ThreadMemory,
        config: SchedulerConfig,
        idle: TaskEntry,
    ) -> Result<Arc<Self>, SpawnError> {
        let platform: Arc<dyn Platform> = Arc::from(platform);
        let masking = Masking::new(platform.clone());
        let boot = Arc::new(
            Task::new(
                TaskId::BOOT,
                config.boot_priority,
                config.default_dynamic_priority,
                TaskState::Running,
            )
            .with_masking(masking.clone()),
        );
        let scheduler = Arc::new(Self {
            platform,
            masking,
            memory,
            config,
            irq_lock: InterruptLock::new(),
            postponer: SwitchPostponer::new(),
            state: SpinLock::new(RunState {
                queues: ReadyQueues::new(),
                current: boot.clone(),
                live: BTreeMap::from([(TaskId::BOOT, boot)]),
                zombies: Vec::new(),
                idle: None,
                now: Duration::ZERO,
            }),
            next_id: AtomicU32::new(1),
        });

        let idle = scheduler.spawn(idle, TaskPriority::Background)?;
        scheduler.run_state().idle = Some(idle.id());
        log::info!(
            "scheduler up: boot task {} ({:?}), idle task {}",
            TaskId::BOOT,
            config.boot_priority,
            idle.id()
        );
        Ok(scheduler)
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn platform(&self) -> &dyn Platform {
        &*self.platform
    }

    pub(crate) const fn masking(&self) -> &Masking {
        &self.masking
    }

    fn run_state(&self) -> IrqSpinLockGuard<'_, RunState, dyn InterruptControl + '_> {
        self.masking.lock(&self.state)
    }

    /// Masks interrupts until the returned guard (and every enclosing one) drops.
    pub fn lock_scheduler(&self) -> SchedulerLock<'_> {
        self.irq_lock.acquire(self.platform.interrupts())
    }

    /// The scheduler lock plus deferral of every switch requested while held.
    pub fn lock_stuff(&self) -> StuffLock<'_> {
        let irq = self.lock_scheduler();
        self.postponer.enter();
        StuffLock {
            scheduler: self,
            _irq: irq,
        }
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.irq_lock.is_held()
    }

    /// Whether a switch was requested under [`lock_stuff`](Self::lock_stuff)
    /// and not yet replayed.
    #[must_use]
    pub fn switch_postponed(&self) -> bool {
        self.postponer.is_postponed()
    }

    /// Creates a task in its own address space and queues it `Ready`.
    ///
    /// # Errors
    /// No memory for the address space.
    pub fn spawn(&self, entry: TaskEntry, priority: TaskPriority) -> Result<Arc<Task>, SpawnError> {
        let thread = self.memory.create_thread()?;
        let stack_pointer = self.platform.prepare_stack(&thread, entry, self);
        let id = TaskId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(
            Task::new(id, priority, self.config.default_dynamic_priority, TaskState::Ready)
                .with_masking(self.masking.clone())
                .with_thread(thread, self.memory, stack_pointer),
        );
        log::debug!(
            "spawned task {id} ({priority:?}) in {:?}",
            task.directory()
        );

        let _lock = self.lock_scheduler();
        let mut state = self.run_state();
        state.live.insert(id, task.clone());
        state.queues.push(task.clone());
        Ok(task)
    }

    /// Picks the task to run and switches to it.
    ///
    /// A running task keeps the CPU unless a ready task preempts it; a task
    /// that is no longer running is replaced by the most urgent ready task.
    ///
    /// # Panics
    /// Without the scheduler lock, and if no task at all is runnable.
    pub fn schedule(&self) {
        if !self.is_locked() {
            log::error!("schedule() called with interrupts enabled");
            panic!("schedule() requires the scheduler lock");
        }
        if self.postponer.is_active() {
            self.postponer.postpone();
            return;
        }

        let (switch, reaped) = {
            let mut state = self.run_state();
            let reaped = core::mem::take(&mut state.zombies);
            (Self::decide(&mut state), reaped)
        };
        drop(reaped);

        if let Some((save, target)) = switch {
            log::trace!("switch to task {}", target.task);
            let held = self.irq_lock.held();
            // Safety: `save` belongs to a task held by the run state (live map,
            // ready queue or zombie list) until after it is resumed or reaped.
            unsafe {
                self.platform.switch(save, target);
                // Back on this task's stack; the lock depth is ours again.
                self.irq_lock.resume(held);
            }
        }
    }

    /// Drops the scheduler lock a new task inherits from the switch that
    /// started it and unmasks interrupts. Must be the first thing a task's
    /// entry glue does.
    pub fn task_started(&self) {
        // Safety: the switch into a fresh task left the switcher's hold behind.
        unsafe { self.irq_lock.resume(HeldState::RELEASED) };
        self.platform.interrupts().enable_interrupts();
    }

    fn decide(state: &mut RunState) -> Option<(*mut u32, SwitchTarget)> {
        let current = state.current.clone();
        match current.state() {
            TaskState::Running => {
                let candidate = state.queues.peek()?;
                if !preempts(candidate, &current) {
                    return None;
                }
                log::trace!("task {} preempts task {}", candidate.id(), current.id());
                current.set_state(TaskState::Ready);
                state.queues.push(current.clone());
            }
            TaskState::Ready => {
                debug_assert!(state.queues.contains(current.id()), "ready task not queued");
            }
            TaskState::Waiting | TaskState::Stopped => {}
        }

        let Some(next) = state.queues.pop() else {
            log::error!("no runnable task; task {} is {:?}", current.id(), current.state());
            panic!("no runnable task, the idle task is missing");
        };
        next.run_from(state.now);
        if Arc::ptr_eq(&next, &current) {
            return None;
        }
        if current.state() == TaskState::Stopped {
            state.zombies.push(current.clone());
        }

        let target = SwitchTarget {
            task: next.id(),
            stack_pointer: next.stack_pointer(),
            directory: next.directory(),
        };
        state.current = next;
        Some((current.stack_pointer_slot(), target))
    }

    /// Advances the clock, ages the ready tasks and takes the CPU from a
    /// task that overran its slice.
    pub fn timer_tick(&self, elapsed: Duration) {
        let _lock = self.lock_scheduler();
        let expired = {
            let mut state = self.run_state();
            state.now += elapsed;
            state.queues.age(self.config.aging_step);

            let current = state.current.clone();
            let expired = current.state() == TaskState::Running
                && current.priority() != TaskPriority::Critical
                && state.now.saturating_sub(current.slice_start()) >= self.config.time_slice
                // Retried on the next tick once switching is allowed again.
                && !self.postponer.is_active();
            if expired {
                current.lower_dynamic_priority(self.config.aging_step);
                current.set_state(TaskState::Ready);
                state.queues.push(current.clone());
                log::trace!("task {} overran its slice", current.id());
            }
            expired
        };
        if expired {
            self.schedule();
        }
    }

    /// Time accumulated from timer ticks.
    #[must_use]
    pub fn since_boot(&self) -> Duration {
        self.run_state().now
    }

    #[must_use]
    pub fn current(&self) -> Arc<Task> {
        self.run_state().current.clone()
    }

    #[must_use]
    pub fn idle_task(&self) -> Option<TaskId> {
        self.run_state().idle
    }

    /// Tasks spawned and not yet ended, task zero included.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.run_state().live.len()
    }

    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.run_state().queues.len()
    }

    /// Ready tasks of one static tier.
    #[must_use]
    pub fn ready_in(&self, priority: TaskPriority) -> usize {
        self.run_state().queues.tier_len(priority)
    }

    #[must_use]
    pub fn task(&self, id: TaskId) -> Option<Arc<Task>> {
        self.run_state().live.get(&id).cloned()
    }

    /// Queues tasks released from a wait list, in order.
    pub(crate) fn make_ready(&self, tasks: Vec<Arc<Task>>) {
        let mut state = self.run_state();
        for task in tasks {
            state.queues.push(task);
        }
    }

    /// Parks the current task on `waitable` unless it is ready.
    ///
    /// # Panics
    /// If the current task would wait on itself.
    pub fn block_on<W: Waitable + ?Sized>(&self, waitable: &W) {
        let _lock = self.lock_scheduler();
        if waitable.is_ready() {
            return;
        }

        let current = self.current();
        if waitable.involves(current.id()) {
            log::error!("task {} would wait on itself", current.id());
            panic!("a task cannot wait on itself");
        }
        let ticket = current.begin_wait(waitable.describe(), self.config.block_boost);
        if waitable.subscribe(Subscriber::task(current.clone(), ticket)).is_err() {
            current.cancel_wait();
            return;
        }
        log::trace!("task {} waits on a {}", current.id(), waitable.describe());
        drop(current);
        self.schedule();
    }

    pub(crate) fn suspend(&self, task: &Task) {
        let _lock = self.lock_scheduler();
        match task.mark_suspended() {
            TaskState::Ready => {
                let removed = self.run_state().queues.remove(task.id());
                debug_assert!(removed.is_some(), "ready task not queued");
            }
            TaskState::Running => self.schedule(),
            TaskState::Waiting | TaskState::Stopped => {}
        }
    }

    pub(crate) fn resume(&self, task: &Task) {
        let _lock = self.lock_scheduler();
        if !task.clear_suspended() {
            return;
        }
        let Some(task) = self.task(task.id()) else {
            return;
        };
        self.make_ready(alloc::vec![task]);
        self.schedule();
    }

    pub(crate) fn end_task(&self, task: &Task, failed: bool) {
        let _stuff = self.lock_stuff();
        if task.state() == TaskState::Stopped {
            return;
        }
        if failed {
            task.completion().fail(self);
        } else {
            task.completion().finish(self);
        }
        task.set_state(TaskState::Stopped);

        {
            let mut state = self.run_state();
            state.queues.remove(task.id());
            if let Some(ended) = state.live.remove(&task.id())
                && !Arc::ptr_eq(&ended, &state.current)
            {
                state.zombies.push(ended);
            }
        }
        log::debug!("task {} ended{}", task.id(), if failed { " (failed)" } else { "" });
        self.schedule();
    }

    /// Ends the current task. Called when a task's entry returns; on the
    /// target this never comes back.
    pub fn exit_current(&self) {
        let _stuff = self.lock_stuff();
        let current = self.current();
        self.end_task(&current, false);
        // No reference may stay behind on the ending task's stack.
        drop(current);
    }
}

/// Whether a ready `candidate` displaces the `running` task.
fn preempts(candidate: &Task, running: &Task) -> bool {
    if !candidate.priority().may_preempt() {
        return false;
    }
    match candidate.priority().tier().cmp(&running.priority().tier()) {
        TierOrdering::Less => true,
        TierOrdering::Equal => candidate.dynamic_priority() > running.dynamic_priority(),
        TierOrdering::Greater => false,
    }
}
