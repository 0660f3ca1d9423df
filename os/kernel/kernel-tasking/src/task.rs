//! # Tasks
//!
//! A [`Task`] is one flow of control with its own stack and address space.
//! Tasks are shared as `Arc<Task>` between the run queues, the wait lists of
//! the latches they block on and whoever spawned them.

use crate::platform::Masking;
use crate::scheduler::Scheduler;
use crate::waitable::{Latch, Subscriber, Waitable};
use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use core::time::Duration;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::{InterruptControl, IrqSpinLockGuard, SpinLock};
use kernel_vmem::{ThreadData, ThreadMemory};

/// Code a spawned task starts running. When it returns the task ends.
pub type TaskEntry = fn(&Scheduler);

#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(u32);

impl TaskId {
    /// The flow of control that booted the kernel.
    pub const BOOT: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static priority tier, fixed at spawn. Earlier tiers always run first.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TaskPriority {
    Critical,
    RealTime,
    Normal,
    Background,
}

impl TaskPriority {
    pub const ALL: [Self; 4] = [Self::Critical, Self::RealTime, Self::Normal, Self::Background];

    /// Queue index; lower is more urgent.
    #[inline]
    #[must_use]
    pub const fn tier(self) -> usize {
        self as usize
    }

    /// Whether a ready task of this tier may displace a running one.
    #[inline]
    #[must_use]
    pub const fn may_preempt(self) -> bool {
        !matches!(self, Self::Background)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TaskState {
    Ready,
    Running,
    Waiting,
    Stopped,
}

/// Scheduling bookkeeping guarded by the task's own lock.
#[derive(Debug)]
struct Bookkeeping {
    state: TaskState,
    waiting_on: Option<&'static str>,
    /// Bumped on every wait; subscriptions from earlier waits are stale.
    ticket: u64,
    blocked: bool,
    suspended: bool,
    slice_start: Duration,
}

struct OwnedThread {
    data: ThreadData,
    memory: &'static dyn ThreadMemory,
}

pub struct Task {
    id: TaskId,
    priority: TaskPriority,
    dynamic: AtomicU8,
    stack_pointer: AtomicU32,
    books: SpinLock<Bookkeeping>,
    masking: Masking,
    thread: Option<OwnedThread>,
    latch: Latch,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        priority: TaskPriority,
        dynamic: u8,
        state: TaskState,
    ) -> Self {
        Self {
            id,
            priority,
            dynamic: AtomicU8::new(dynamic),
            stack_pointer: AtomicU32::new(0),
            books: SpinLock::new(Bookkeeping {
                state,
                waiting_on: None,
                ticket: 0,
                blocked: false,
                suspended: false,
                slice_start: Duration::ZERO,
            }),
            masking: Masking::DETACHED,
            thread: None,
            latch: Latch::with_masking(Masking::DETACHED),
        }
    }

    /// Masks interrupts through the scheduler's platform while the
    /// bookkeeping or the completion latch is locked.
    pub(crate) fn with_masking(mut self, masking: Masking) -> Self {
        self.latch = Latch::with_masking(masking.clone());
        self.masking = masking;
        self
    }

    fn books(&self) -> IrqSpinLockGuard<'_, Bookkeeping, dyn InterruptControl + '_> {
        self.masking.lock(&self.books)
    }

    /// Attaches a thread address space and the stack pointer that resumes it.
    pub(crate) fn with_thread(
        mut self,
        data: ThreadData,
        memory: &'static dyn ThreadMemory,
        stack_pointer: u32,
    ) -> Self {
        self.thread = Some(OwnedThread { data, memory });
        self.stack_pointer = AtomicU32::new(stack_pointer);
        self
    }

    /// Spawns a new task. See [`Scheduler::spawn`].
    ///
    /// # Errors
    /// No memory for the task's address space.
    pub fn start(
        scheduler: &Scheduler,
        entry: TaskEntry,
        priority: TaskPriority,
    ) -> Result<alloc::sync::Arc<Self>, crate::SpawnError> {
        scheduler.spawn(entry, priority)
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Tie-breaker within the tier; greater runs first.
    #[inline]
    #[must_use]
    pub fn dynamic_priority(&self) -> u8 {
        self.dynamic.load(Ordering::Relaxed)
    }

    pub(crate) fn raise_dynamic_priority(&self, step: u8) {
        let _ = self
            .dynamic
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_add(step)));
    }

    pub(crate) fn lower_dynamic_priority(&self, step: u8) {
        let _ = self
            .dynamic
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |p| Some(p.saturating_sub(step)));
    }

    #[must_use]
    pub fn state(&self) -> TaskState {
        self.books().state
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.books().state = state;
    }

    /// What the task is blocked on, if anything.
    #[must_use]
    pub fn waiting_on(&self) -> Option<&'static str> {
        self.books().waiting_on
    }

    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.books().suspended
    }

    /// Whether the task is still blocked on a waitable.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.books().blocked
    }

    pub(crate) fn slice_start(&self) -> Duration {
        self.books().slice_start
    }

    /// Marks the task running from `now` on.
    pub(crate) fn run_from(&self, now: Duration) {
        let mut books = self.books();
        books.state = TaskState::Running;
        books.slice_start = now;
    }

    /// Location the context switch saves the stack pointer to.
    pub(crate) fn stack_pointer_slot(&self) -> *mut u32 {
        self.stack_pointer.as_ptr()
    }

    #[must_use]
    pub fn stack_pointer(&self) -> u32 {
        self.stack_pointer.load(Ordering::Relaxed)
    }

    /// The task's page directory; `None` runs on the kernel directory.
    #[must_use]
    pub fn directory(&self) -> Option<PhysicalPage<Size4K>> {
        self.thread.as_ref().map(|t| t.data.directory)
    }

    #[must_use]
    pub fn thread(&self) -> Option<&ThreadData> {
        self.thread.as_ref().map(|t| &t.data)
    }

    /// The latch finished when the task ends.
    #[must_use]
    pub const fn completion(&self) -> &Latch {
        &self.latch
    }

    /// Parks the task on a waitable: raises its dynamic priority, records what
    /// it waits on and moves it to `Waiting`. Returns the ticket the wake must
    /// present.
    pub(crate) fn begin_wait(&self, what: &'static str, boost: u8) -> u64 {
        self.raise_dynamic_priority(boost);
        let mut books = self.books();
        books.ticket += 1;
        books.blocked = true;
        books.waiting_on = Some(what);
        books.state = TaskState::Waiting;
        books.ticket
    }

    /// Undoes [`begin_wait`](Self::begin_wait) when the waitable turned out
    /// to be ready already.
    pub(crate) fn cancel_wait(&self) {
        let mut books = self.books();
        books.blocked = false;
        books.waiting_on = None;
        books.state = TaskState::Running;
    }

    /// Ends the wait identified by `ticket`. Returns `true` if the task is now
    /// `Ready` and must be queued; stale tickets and suspended tasks yield
    /// `false`.
    pub(crate) fn wake(&self, ticket: u64) -> bool {
        let mut books = self.books();
        if !books.blocked || books.ticket != ticket || books.state != TaskState::Waiting {
            return false;
        }
        books.blocked = false;
        if books.suspended {
            books.waiting_on = Some("suspension");
            return false;
        }
        books.waiting_on = None;
        books.state = TaskState::Ready;
        true
    }

    /// Flags the task suspended and returns its state before.
    pub(crate) fn mark_suspended(&self) -> TaskState {
        let mut books = self.books();
        let before = books.state;
        books.suspended = true;
        if matches!(before, TaskState::Ready | TaskState::Running) {
            books.state = TaskState::Waiting;
            books.waiting_on = Some("suspension");
        }
        before
    }

    /// Clears the suspension. Returns `true` if the task became `Ready`.
    pub(crate) fn clear_suspended(&self) -> bool {
        let mut books = self.books();
        if !books.suspended {
            return false;
        }
        books.suspended = false;
        if books.state == TaskState::Waiting && !books.blocked {
            books.state = TaskState::Ready;
            books.waiting_on = None;
            return true;
        }
        false
    }

    /// Suspends the task until [`resume`](Self::resume).
    pub fn suspend(&self, scheduler: &Scheduler) {
        scheduler.suspend(self);
    }

    /// Makes a suspended task runnable again.
    pub fn resume(&self, scheduler: &Scheduler) {
        scheduler.resume(self);
    }

    /// Finishes the task's latch and stops it. Its address space goes back
    /// when the last `Arc<Task>` drops.
    pub fn end(&self, scheduler: &Scheduler) {
        scheduler.end_task(self, false);
    }

    /// Like [`end`](Self::end), but tasks waiting on this one see a failure.
    pub fn end_failed(&self, scheduler: &Scheduler) {
        scheduler.end_task(self, true);
    }
}

impl Waitable for Task {
    fn is_ready(&self) -> bool {
        self.latch.is_ready()
    }

    fn is_failed(&self) -> bool {
        self.latch.is_failed()
    }

    fn subscribe(&self, subscriber: Subscriber) -> Result<(), Subscriber> {
        self.latch.subscribe(subscriber)
    }

    fn involves(&self, task: TaskId) -> bool {
        self.id == task
    }

    fn describe(&self) -> &'static str {
        "task"
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            log::debug!("task {} dropped, releasing {}", self.id, thread.data.directory);
            thread.memory.release_thread(thread.data);
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("dynamic", &self.dynamic_priority())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new(TaskId::new(7), TaskPriority::Normal, 128, TaskState::Running)
    }

    #[test]
    fn tiers_are_ordered() {
        let tiers: Vec<_> = TaskPriority::ALL.iter().map(|p| p.tier()).collect();
        assert_eq!(tiers, [0, 1, 2, 3]);
        assert!(!TaskPriority::Background.may_preempt());
        assert!(TaskPriority::Normal.may_preempt());
    }

    #[test]
    fn dynamic_priority_saturates() {
        let t = task();
        t.raise_dynamic_priority(200);
        assert_eq!(t.dynamic_priority(), 255);
        t.lower_dynamic_priority(255);
        t.lower_dynamic_priority(1);
        assert_eq!(t.dynamic_priority(), 0);
    }

    #[test]
    fn wait_boosts_and_wake_checks_ticket() {
        let t = task();
        let ticket = t.begin_wait("latch", 1);
        assert_eq!(t.dynamic_priority(), 129);
        assert_eq!(t.state(), TaskState::Waiting);
        assert_eq!(t.waiting_on(), Some("latch"));

        assert!(!t.wake(ticket + 1), "stale ticket");
        assert!(t.wake(ticket));
        assert_eq!(t.state(), TaskState::Ready);
        assert_eq!(t.waiting_on(), None);
        assert!(!t.wake(ticket), "woken only once");
    }

    #[test]
    fn suspended_waiter_stays_parked_until_resumed() {
        let t = task();
        let ticket = t.begin_wait("latch", 0);
        assert_eq!(t.mark_suspended(), TaskState::Waiting);
        assert!(!t.wake(ticket));
        assert_eq!(t.state(), TaskState::Waiting);
        assert!(!t.is_blocked());

        assert!(t.clear_suspended());
        assert_eq!(t.state(), TaskState::Ready);
    }

    #[test]
    fn resume_of_a_blocked_task_keeps_it_waiting() {
        let t = task();
        let ticket = t.begin_wait("latch", 0);
        t.mark_suspended();
        assert!(!t.clear_suspended());
        assert!(t.wake(ticket));
    }

    #[test]
    fn task_zero_runs_on_the_kernel_directory() {
        let t = Task::new(TaskId::BOOT, TaskPriority::Normal, 128, TaskState::Running);
        assert_eq!(t.directory(), None);
        assert!(t.involves(TaskId::BOOT));
        assert_eq!(t.id().to_string(), "#0");
    }
}
