//! # Waitables
//!
//! Everything a task can block on implements [`Waitable`]. The primitive is
//! the one-shot [`Latch`]; tasks expose their completion latch, and
//! [`WaitAll`] / [`WaitOne`] combine any number of waitables into one.
//!
//! A waitable becomes ready exactly once. At that moment its subscribers are
//! drained front to back: blocked tasks become `Ready`, and combinators
//! subscribed to it count the member as settled, possibly settling in turn.
//! The tasks released by one [`Latch::finish`] are queued in subscription order
//! and followed by a single scheduling decision.
//!
//! Latches and combinators belong to a [`Scheduler`]: their locks mask
//! interrupts through its platform, as the timer interrupt may wake tasks.

use crate::platform::Masking;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskId};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::{InterruptControl, IrqSpinLockGuard, SpinLock};

/// Something tasks can block on until it becomes ready.
pub trait Waitable: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Whether it became ready through a failure.
    fn is_failed(&self) -> bool;

    /// Registers `subscriber` for the ready transition. Hands it back if the
    /// waitable is ready already.
    ///
    /// # Errors
    /// The waitable is ready; nothing was registered.
    fn subscribe(&self, subscriber: Subscriber) -> Result<(), Subscriber>;

    /// Whether waiting on this would make `task` wait on itself.
    fn involves(&self, _task: TaskId) -> bool {
        false
    }

    /// Short description recorded on a task blocked on this.
    fn describe(&self) -> &'static str {
        "waitable"
    }

    /// Blocks the current task until ready. Returns at once if ready.
    ///
    /// # Panics
    /// If the current task would wait on itself.
    fn wait(&self, scheduler: &Scheduler) {
        scheduler.block_on(self);
    }
}

impl<W: Waitable + ?Sized> Waitable for Arc<W> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn is_failed(&self) -> bool {
        (**self).is_failed()
    }

    fn subscribe(&self, subscriber: Subscriber) -> Result<(), Subscriber> {
        (**self).subscribe(subscriber)
    }

    fn involves(&self, task: TaskId) -> bool {
        (**self).involves(task)
    }

    fn describe(&self) -> &'static str {
        (**self).describe()
    }
}

/// An entry on a waitable's wait list.
pub struct Subscriber(Kind);

enum Kind {
    Task { task: Arc<Task>, ticket: u64 },
    Group(Arc<Group>),
}

impl Subscriber {
    pub(crate) const fn task(task: Arc<Task>, ticket: u64) -> Self {
        Self(Kind::Task { task, ticket })
    }

    fn group(group: Arc<Group>) -> Self {
        Self(Kind::Group(group))
    }

    /// The blocked task, if this entry is one.
    #[must_use]
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.0 {
            Kind::Task { task, .. } => Some(task.id()),
            Kind::Group(_) => None,
        }
    }

    /// Delivers the ready transition; tasks that become `Ready` go to `woken`.
    fn notify(self, failed: bool, woken: &mut Vec<Arc<Task>>) {
        match self.0 {
            Kind::Task { task, ticket } => {
                if task.wake(ticket) {
                    woken.push(task);
                } else {
                    log::trace!("skipping stale waiter {}", task.id());
                }
            }
            Kind::Group(group) => group.member_settled(failed, woken),
        }
    }
}

#[derive(Default)]
struct LatchState {
    ready: bool,
    failed: bool,
    subscribers: Vec<Subscriber>,
}

/// One-shot ready flag with a FIFO wait list.
pub struct Latch {
    state: SpinLock<LatchState>,
    masking: Masking,
}

impl Latch {
    #[must_use]
    pub fn new(scheduler: &Scheduler) -> Self {
        Self::with_masking(scheduler.masking().clone())
    }

    pub(crate) fn with_masking(masking: Masking) -> Self {
        Self {
            state: SpinLock::new(LatchState::default()),
            masking,
        }
    }

    fn state(&self) -> IrqSpinLockGuard<'_, LatchState, dyn InterruptControl + '_> {
        self.masking.lock(&self.state)
    }

    /// Marks the latch ready, releases every waiter and schedules once.
    /// Finishing a ready latch does nothing.
    pub fn finish(&self, scheduler: &Scheduler) {
        self.settle(scheduler, false);
    }

    /// Like [`finish`](Self::finish), with waiters observing a failure.
    pub fn fail(&self, scheduler: &Scheduler) {
        self.settle(scheduler, true);
    }

    fn settle(&self, scheduler: &Scheduler, failed: bool) {
        let _lock = scheduler.lock_scheduler();
        let mut woken = Vec::new();
        if !self.complete(failed, &mut woken) {
            log::warn!("latch settled twice");
            return;
        }
        scheduler.make_ready(woken);
        scheduler.schedule();
    }

    /// Flips the latch to ready and drains the wait list into `woken`.
    /// Returns `false` if it was ready before.
    pub(crate) fn complete(&self, failed: bool, woken: &mut Vec<Arc<Task>>) -> bool {
        let subscribers = {
            let mut state = self.state();
            if state.ready {
                return false;
            }
            state.ready = true;
            state.failed = failed;
            core::mem::take(&mut state.subscribers)
        };
        for subscriber in subscribers {
            subscriber.notify(failed, woken);
        }
        true
    }

    /// Tasks currently on the wait list, oldest first.
    #[must_use]
    pub fn waiters(&self) -> Vec<TaskId> {
        self.state()
            .subscribers
            .iter()
            .filter_map(Subscriber::task_id)
            .collect()
    }
}

impl Waitable for Latch {
    fn is_ready(&self) -> bool {
        self.state().ready
    }

    fn is_failed(&self) -> bool {
        self.state().failed
    }

    fn subscribe(&self, subscriber: Subscriber) -> Result<(), Subscriber> {
        let mut state = self.state();
        if state.ready {
            return Err(subscriber);
        }
        state.subscribers.push(subscriber);
        Ok(())
    }

    fn describe(&self) -> &'static str {
        "latch"
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Mode {
    All,
    One,
}

#[derive(Default)]
struct Tally {
    settled: usize,
    failed: usize,
}

/// Shared settle counter of a combinator, subscribed to each member.
struct Group {
    mode: Mode,
    members: usize,
    tally: SpinLock<Tally>,
    latch: Latch,
}

impl Group {
    fn new(mode: Mode, members: &[Box<dyn Waitable>], masking: Masking) -> Arc<Self> {
        let group = Arc::new(Self {
            mode,
            members: members.len(),
            tally: SpinLock::new(Tally::default()),
            latch: Latch::with_masking(masking),
        });

        let mut woken = Vec::new();
        if members.is_empty() {
            // Nothing can succeed for wait-one; wait-all holds vacuously.
            group.latch.complete(mode == Mode::One, &mut woken);
        }
        for member in members {
            if member.subscribe(Subscriber::group(group.clone())).is_err() {
                group.member_settled(member.is_failed(), &mut woken);
            }
        }
        debug_assert!(woken.is_empty(), "a fresh group has no waiters");
        group
    }

    fn member_settled(&self, failed: bool, woken: &mut Vec<Arc<Task>>) {
        let outcome = {
            let mut tally = self.latch.masking.lock(&self.tally);
            tally.settled += 1;
            tally.failed += usize::from(failed);
            match self.mode {
                Mode::All => (tally.settled == self.members).then_some(tally.failed > 0),
                Mode::One if tally.settled > tally.failed => Some(false),
                Mode::One => (tally.settled == self.members).then_some(true),
            }
        };
        if let Some(failed) = outcome {
            self.latch.complete(failed, woken);
        }
    }
}

macro_rules! combinator {
    ($name:ident, $mode:expr, $what:literal) => {
        pub struct $name {
            members: Vec<Box<dyn Waitable>>,
            group: Arc<Group>,
        }

        impl $name {
            #[must_use]
            pub fn new(scheduler: &Scheduler, members: Vec<Box<dyn Waitable>>) -> Self {
                Self::with_masking(scheduler.masking().clone(), members)
            }

            pub(crate) fn with_masking(masking: Masking, members: Vec<Box<dyn Waitable>>) -> Self {
                let group = Group::new($mode, &members, masking);
                Self { members, group }
            }

            #[must_use]
            pub fn members(&self) -> &[Box<dyn Waitable>] {
                &self.members
            }
        }

        impl Waitable for $name {
            fn is_ready(&self) -> bool {
                self.group.latch.is_ready()
            }

            fn is_failed(&self) -> bool {
                self.group.latch.is_failed()
            }

            fn subscribe(&self, subscriber: Subscriber) -> Result<(), Subscriber> {
                self.group.latch.subscribe(subscriber)
            }

            fn involves(&self, task: TaskId) -> bool {
                self.members.iter().any(|m| m.involves(task))
            }

            fn describe(&self) -> &'static str {
                $what
            }
        }
    };
}

combinator!(WaitAll, Mode::All, "wait-all");
combinator!(WaitOne, Mode::One, "wait-one");

/// Ready once every member is ready; failed if any member failed.
#[must_use]
pub fn wait_all(scheduler: &Scheduler, members: Vec<Box<dyn Waitable>>) -> WaitAll {
    WaitAll::new(scheduler, members)
}

/// Ready once any member succeeds, or failed once every member failed.
#[must_use]
pub fn wait_one(scheduler: &Scheduler, members: Vec<Box<dyn Waitable>>) -> WaitOne {
    WaitOne::new(scheduler, members)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn latches<const N: usize>() -> [Arc<Latch>; N] {
        core::array::from_fn(|_| Arc::new(Latch::with_masking(Masking::DETACHED)))
    }

    fn wait_all(members: Vec<Box<dyn Waitable>>) -> WaitAll {
        WaitAll::with_masking(Masking::DETACHED, members)
    }

    fn wait_one(members: Vec<Box<dyn Waitable>>) -> WaitOne {
        WaitOne::with_masking(Masking::DETACHED, members)
    }

    fn boxed(latches: &[Arc<Latch>]) -> Vec<Box<dyn Waitable>> {
        latches
            .iter()
            .map(|l| Box::new(l.clone()) as Box<dyn Waitable>)
            .collect()
    }

    fn settle(latch: &Latch, failed: bool) {
        let mut woken = Vec::new();
        assert!(latch.complete(failed, &mut woken));
        assert!(woken.is_empty());
    }

    #[test]
    fn latch_is_one_shot() {
        let [latch] = latches();
        assert!(!latch.is_ready());
        settle(&latch, true);
        assert!(latch.is_ready());
        assert!(latch.is_failed());
        assert!(!latch.complete(false, &mut Vec::new()));
        assert!(latch.is_failed(), "first outcome sticks");

        let late = Subscriber::group(Group::new(Mode::All, &[], Masking::DETACHED));
        assert!(latch.subscribe(late).is_err());
    }

    #[test]
    fn wait_all_needs_every_member() {
        let [a, b, c] = latches();
        let all = wait_all(boxed(&[a.clone(), b.clone(), c.clone()]));
        settle(&a, false);
        settle(&c, false);
        assert!(!all.is_ready());
        settle(&b, false);
        assert!(all.is_ready());
        assert!(!all.is_failed());
    }

    #[test]
    fn wait_all_fails_if_any_member_fails() {
        let [a, b] = latches();
        let all = wait_all(boxed(&[a.clone(), b.clone()]));
        settle(&a, true);
        assert!(!all.is_ready());
        settle(&b, false);
        assert!(all.is_ready() && all.is_failed());
    }

    #[test]
    fn wait_one_is_ready_at_first_success() {
        let [a, b, c] = latches();
        let one = wait_one(boxed(&[a.clone(), b.clone(), c.clone()]));
        settle(&a, true);
        assert!(!one.is_ready(), "a failure alone does not settle it");
        settle(&b, false);
        assert!(one.is_ready());
        assert!(!one.is_failed());
        settle(&c, true);
        assert!(!one.is_failed());
    }

    #[test]
    fn wait_one_fails_only_if_every_member_fails() {
        let [a, b] = latches();
        let one = wait_one(boxed(&[a.clone(), b.clone()]));
        settle(&a, true);
        settle(&b, true);
        assert!(one.is_ready() && one.is_failed());
    }

    #[test]
    fn members_ready_before_construction_count() {
        let [a, b] = latches();
        settle(&a, false);
        let one = wait_one(boxed(&[a.clone(), b.clone()]));
        assert!(one.is_ready());

        let all = wait_all(boxed(&[a, b.clone()]));
        assert!(!all.is_ready());
        settle(&b, false);
        assert!(all.is_ready());
    }

    #[test]
    fn empty_combinators() {
        assert!(wait_all(Vec::new()).is_ready());
        let one = wait_one(Vec::new());
        assert!(one.is_ready() && one.is_failed());
    }

    #[test]
    fn combinators_compose() {
        let [a, b, c] = latches();
        let inner = wait_all(boxed(&[a.clone(), b.clone()]));
        let outer = wait_one(vec![
            Box::new(inner) as Box<dyn Waitable>,
            Box::new(c.clone()) as Box<dyn Waitable>,
        ]);
        settle(&a, false);
        assert!(!outer.is_ready());
        settle(&b, false);
        assert!(outer.is_ready());
        assert_eq!(outer.members().len(), 2);
        assert!(!c.is_ready());
    }

    #[test]
    fn waiters_lists_only_tasks() {
        let [a] = latches();
        let _all = wait_all(boxed(&[a.clone()]));
        assert!(a.waiters().is_empty(), "group subscriptions are not tasks");
    }
}
